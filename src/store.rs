use std::collections::BTreeSet;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::codec;
use crate::domain::{Credential, CredentialId, label_order};
use crate::error::{StoreError, StoreResult};
use crate::kv::KeyValueStore;

pub const INDEX_KEY: &str = "credentialIds";

pub fn record_key(id: CredentialId) -> String {
    format!("credential{id}")
}

/// Maps credential id to encoded record, plus a durable index of live ids.
///
/// The index is always mutated before the record blob: an index entry may
/// briefly point at a missing record, never the other way round.
pub struct CredentialStore<S> {
    kv: S,
    index_lock: Mutex<()>,
}

impl<S: KeyValueStore> CredentialStore<S> {
    pub fn new(kv: S) -> Self {
        Self {
            kv,
            index_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &S {
        &self.kv
    }

    pub async fn write(&self, credential: &Credential) -> StoreResult<()> {
        {
            let _guard = self.index_lock.lock().await;
            let mut ids = self.load_index().await?;
            if ids.insert(credential.id) {
                self.kv
                    .put_sync(INDEX_KEY, &format_index(&ids))
                    .await
                    .map_err(StoreError::IndexNotDurable)?;
                debug!("index now holds {} ids", ids.len());
            }
        }

        let encoded = codec::encode(credential);
        self.kv
            .put(&record_key(credential.id), &encoded)
            .await
            .map_err(|source| StoreError::Backend {
                context: "writing record",
                source,
            })?;
        info!("stored credential {} '{}'", credential.id, credential.name);
        Ok(())
    }

    pub async fn read(&self, id: CredentialId) -> StoreResult<Option<Credential>> {
        let raw = self
            .kv
            .get(&record_key(id))
            .await
            .map_err(|source| StoreError::Backend {
                context: "reading record",
                source,
            })?;
        debug!(
            "read credential {} -> {}",
            id,
            if raw.is_some() { "hit" } else { "miss" }
        );
        raw.map(|encoded| {
            codec::decode(&encoded, id).map_err(|source| StoreError::CorruptRecord { id, source })
        })
        .transpose()
    }

    /// Returns whether the id was live. A failed blob delete after the index
    /// update only leaks an unreachable blob and is logged.
    pub async fn remove(&self, id: CredentialId) -> StoreResult<bool> {
        let was_live = {
            let _guard = self.index_lock.lock().await;
            let mut ids = self.load_index().await?;
            let was_live = ids.remove(&id);
            if was_live {
                self.kv
                    .put_sync(INDEX_KEY, &format_index(&ids))
                    .await
                    .map_err(StoreError::IndexNotDurable)?;
            }
            was_live
        };

        if let Err(e) = self.kv.delete(&record_key(id)).await {
            warn!("credential {id} unindexed but record blob not deleted: {e}");
        }
        info!("removed credential {id}");
        Ok(was_live)
    }

    pub async fn list_ids(&self) -> StoreResult<BTreeSet<CredentialId>> {
        self.load_index().await
    }

    /// Every readable record. Corrupt or missing ones are skipped.
    pub async fn read_all(&self) -> StoreResult<Vec<Credential>> {
        let mut out = Vec::new();
        for id in self.list_ids().await? {
            match self.read(id).await {
                Ok(Some(c)) => out.push(c),
                Ok(None) => debug!("index entry {id} has no record"),
                Err(StoreError::CorruptRecord { id, source }) => {
                    warn!("skipping unreadable credential {id}: {source}")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Union of labels over all records, shortest then alphabetical.
    pub async fn list_labels(&self) -> StoreResult<Vec<String>> {
        let labels: BTreeSet<String> = self
            .read_all()
            .await?
            .into_iter()
            .flat_map(|c| c.labels)
            .collect();
        let mut labels: Vec<String> = labels.into_iter().collect();
        labels.sort_by(|a, b| label_order(a, b));
        Ok(labels)
    }

    /// Drops index entries whose record blob is missing.
    pub async fn prune_index(&self) -> StoreResult<Vec<CredentialId>> {
        let _guard = self.index_lock.lock().await;
        let ids = self.load_index().await?;
        let mut pruned = Vec::new();
        for &id in &ids {
            let present = self
                .kv
                .get(&record_key(id))
                .await
                .map_err(|source| StoreError::Backend {
                    context: "checking record",
                    source,
                })?
                .is_some();
            if !present {
                pruned.push(id);
            }
        }
        if !pruned.is_empty() {
            let kept: BTreeSet<CredentialId> =
                ids.into_iter().filter(|id| !pruned.contains(id)).collect();
            self.kv
                .put_sync(INDEX_KEY, &format_index(&kept))
                .await
                .map_err(StoreError::IndexNotDurable)?;
            info!("pruned {} dangling index entries", pruned.len());
        }
        Ok(pruned)
    }

    async fn load_index(&self) -> StoreResult<BTreeSet<CredentialId>> {
        let raw = self
            .kv
            .get(INDEX_KEY)
            .await
            .map_err(|source| StoreError::Backend {
                context: "reading index",
                source,
            })?;
        parse_index(raw.as_deref().unwrap_or(""))
    }
}

/// Comma-separated decimal ids, no trailing separator.
pub fn format_index(ids: &BTreeSet<CredentialId>) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_index(raw: &str) -> StoreResult<BTreeSet<CredentialId>> {
    if raw.is_empty() {
        return Ok(BTreeSet::new());
    }
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<CredentialId>()
                .map_err(|_| StoreError::CorruptIndex(raw.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Barcode, BarcodeType, CredentialField};
    use crate::kv::MemoryKv;

    fn store() -> CredentialStore<MemoryKv> {
        CredentialStore::new(MemoryKv::new())
    }

    fn gym_card(id: CredentialId) -> Credential {
        let mut c = Credential::new(id, "Gym Card");
        c.labels.insert("Fitness".into());
        c.labels.insert("New".into());
        c.fields.push(CredentialField {
            name: "Member ID".into(),
            value: "12345".into(),
            secret: false,
        });
        c.barcode = Some(Barcode {
            code: "998877".into(),
            kind: BarcodeType::QrCode,
            show_text: true,
        });
        c
    }

    #[test]
    fn index_format() {
        assert_eq!(format_index(&BTreeSet::new()), "");
        assert_eq!(format_index(&BTreeSet::from([3, 1, 20])), "1,3,20");
        assert_eq!(parse_index("").unwrap(), BTreeSet::new());
        assert_eq!(parse_index("1,3,20").unwrap(), BTreeSet::from([1, 3, 20]));
        assert!(matches!(parse_index("1,,2"), Err(StoreError::CorruptIndex(_))));
        assert!(matches!(parse_index("-4"), Err(StoreError::CorruptIndex(_))));
    }

    #[tokio::test]
    async fn write_read_remove() {
        let store = store();
        let card = gym_card(5);
        store.write(&card).await.unwrap();

        assert!(store.list_ids().await.unwrap().contains(&5));
        assert_eq!(store.read(5).await.unwrap(), Some(card));

        assert!(store.remove(5).await.unwrap());
        assert!(!store.list_ids().await.unwrap().contains(&5));
        assert_eq!(store.read(5).await.unwrap(), None);
        assert!(!store.remove(5).await.unwrap());
    }

    #[tokio::test]
    async fn index_is_written_before_record() {
        let store = store();
        store.write(&gym_card(8)).await.unwrap();
        store.write(&gym_card(8)).await.unwrap();
        assert_eq!(
            store.backend().operations(),
            vec![
                format!("put_sync {INDEX_KEY}"),
                "put credential8".to_string(),
                "put credential8".to_string(),
            ]
        );

        store.remove(8).await.unwrap();
        let ops = store.backend().operations();
        assert_eq!(
            &ops[3..],
            &[format!("put_sync {INDEX_KEY}"), "delete credential8".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_index_write_aborts_before_record() {
        let store = store();
        store.backend().fail_put_sync(true);
        let err = store.write(&gym_card(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::IndexNotDurable(_)));
        assert!(!store.backend().contains(&record_key(1)));
        assert!(store.backend().operations().is_empty());
    }

    #[tokio::test]
    async fn failed_index_removal_keeps_record() {
        let store = store();
        store.write(&gym_card(1)).await.unwrap();
        store.backend().fail_put_sync(true);
        assert!(store.remove(1).await.is_err());
        assert!(store.backend().contains(&record_key(1)));
        assert!(store.list_ids().await.unwrap().contains(&1));
    }

    #[tokio::test]
    async fn remove_succeeds_when_blob_delete_fails() {
        let store = store();
        store.write(&gym_card(2)).await.unwrap();
        store.backend().fail_delete(true);
        assert!(store.remove(2).await.unwrap());
        assert!(!store.list_ids().await.unwrap().contains(&2));
    }

    #[tokio::test]
    async fn record_write_failure_is_reported() {
        let store = store();
        store.backend().fail_put(true);
        let err = store.write(&gym_card(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend { .. }));
        // the dangling index entry reads as not-found and is pruned
        assert_eq!(store.read(3).await.unwrap(), None);
        assert_eq!(store.prune_index().await.unwrap(), vec![3]);
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn labels_union_sorted_shortest_first() {
        let store = store();
        store.write(&gym_card(1)).await.unwrap();
        let mut other = Credential::new(2, "Bank");
        other.labels.insert("Finance".into());
        other.labels.insert("New".into());
        store.write(&other).await.unwrap();

        assert_eq!(
            store.list_labels().await.unwrap(),
            vec!["New".to_string(), "Finance".to_string(), "Fitness".to_string()]
        );
    }

    #[tokio::test]
    async fn corrupt_record_is_reported_and_skipped() {
        let store = store();
        store.write(&gym_card(1)).await.unwrap();
        store.write(&Credential::new(2, "Other")).await.unwrap();
        store
            .backend()
            .put(&record_key(2), "garbage")
            .await
            .unwrap();

        assert!(matches!(
            store.read(2).await,
            Err(StoreError::CorruptRecord { id: 2, .. })
        ));
        let all = store.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 1);
    }

    #[tokio::test]
    async fn concurrent_writes_keep_every_id() {
        let store = std::sync::Arc::new(store());
        let mut tasks = Vec::new();
        for id in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.write(&Credential::new(id, format!("card {id}"))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.list_ids().await.unwrap().len(), 32);
    }
}
