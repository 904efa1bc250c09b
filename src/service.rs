use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::OnceCell;

use crate::{
    assets::AssetManager,
    config::Config,
    crypto::{MasterKey, SecretCrypto},
    domain::{Credential, CredentialId},
    error::{ImageError, ImageErrorKind, KvError, StoreError, VaultError},
    file_cipher::FileCipher,
    id_gen,
    images::{DisplayBatch, ImageCodec, apply_decoded},
    kv::{KeyValueStore, SqliteKv},
    store::CredentialStore,
};

type OpenFuture<S> = Pin<Box<dyn Future<Output = Result<S, KvError>> + Send>>;
type Opener<S> = Box<dyn Fn() -> OpenFuture<S> + Send + Sync>;

/// Store handle opened on first use. Racing callers share one open.
pub struct LazyStore<S> {
    cell: OnceCell<CredentialStore<S>>,
    open: Opener<S>,
}

impl<S: KeyValueStore + 'static> LazyStore<S> {
    pub fn new<F, Fut>(open: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, KvError>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            open: Box::new(move || -> OpenFuture<S> { Box::pin(open()) }),
        }
    }

    /// Already open; the opener is never called.
    pub fn ready(kv: S) -> Self {
        Self {
            cell: OnceCell::new_with(Some(CredentialStore::new(kv))),
            open: Box::new(|| -> OpenFuture<S> {
                Box::pin(async { Err(KvError::Injected("store already open")) })
            }),
        }
    }
}

impl<S: KeyValueStore> LazyStore<S> {
    pub fn is_open(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<&CredentialStore<S>, VaultError> {
        self.cell
            .get_or_try_init(|| async {
                info!("opening credential store");
                (self.open)().await.map(CredentialStore::new)
            })
            .await
            .map_err(VaultError::Open)
    }
}

impl LazyStore<SqliteKv> {
    pub fn sqlite(db_path: PathBuf, crypto: SecretCrypto) -> Self {
        Self::new(move || {
            let db_path = db_path.clone();
            let crypto = crypto.clone();
            async move { SqliteKv::connect(&db_path, crypto).await }
        })
    }
}

#[derive(Debug, Default)]
pub struct SaveOutcome {
    pub images_migrated: usize,
    pub orphans_removed: usize,
    /// Images dropped from the credential because their file was gone.
    pub notices: Vec<ImageError>,
}

pub struct VaultService<S> {
    store: LazyStore<S>,
    assets: AssetManager,
}

impl VaultService<SqliteKv> {
    pub fn from_config(config: &Config, key: MasterKey) -> Self {
        let crypto = SecretCrypto::new(key);
        let codec = ImageCodec::new(config.images_dir(), FileCipher::new(crypto.clone()))
            .with_bundled(config.bundled_examples.iter().cloned())
            .with_bounds(config.decode_bounds);
        Self::new(
            LazyStore::sqlite(config.db_path(), crypto),
            AssetManager::new(codec, config.scratch_dir()),
        )
    }
}

impl<S: KeyValueStore> VaultService<S> {
    pub fn new(store: LazyStore<S>, assets: AssetManager) -> Self {
        Self { store, assets }
    }

    pub async fn store(&self) -> Result<&CredentialStore<S>, VaultError> {
        self.store.get().await
    }

    pub fn assets(&self) -> &AssetManager {
        &self.assets
    }

    /// A fresh in-memory credential with an unused id. Nothing is stored yet.
    pub async fn new_credential(&self, name: impl Into<String>) -> Result<Credential, VaultError> {
        let ids = self.store().await?.list_ids().await?;
        Ok(Credential::new(id_gen::generate(&ids), name))
    }

    /// Migrates scratch images, writes the record, then drops orphaned images.
    ///
    /// Scratch images that no longer exist are dropped and reported in
    /// [`SaveOutcome::notices`]. If the write fails the migration is undone
    /// and `credential` keeps its scratch paths, so the save can be retried.
    pub async fn save(&self, credential: &mut Credential) -> Result<SaveOutcome, VaultError> {
        let store = self.store().await?;
        let previous = match store.read(credential.id).await {
            Ok(previous) => previous,
            Err(StoreError::CorruptRecord { id, source }) => {
                warn!("overwriting unreadable credential {id}: {source}");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut migration = self.assets.migrate_on_save(credential)?;
        let images_migrated = migration.moved.len();
        let notices = std::mem::take(&mut migration.dropped);
        credential.touch();

        if let Err(e) = store.write(credential).await {
            warn!("saving credential {} failed, undoing image migration", credential.id);
            self.assets.rollback(credential, migration);
            return Err(e.into());
        }

        let orphans_removed = self.assets.remove_orphans(previous.as_ref(), credential);
        Ok(SaveOutcome {
            images_migrated,
            orphans_removed,
            notices,
        })
    }

    pub fn cancel(&self, credential: &Credential) {
        self.assets.discard_on_cancel(credential);
    }

    pub async fn load(&self, id: CredentialId) -> Result<Credential, VaultError> {
        self.store()
            .await?
            .read(id)
            .await?
            .ok_or(VaultError::NotFound(id))
    }

    /// Loads a credential and decodes all of its images before returning.
    /// Images that can no longer be shown are dropped from the returned value.
    /// References to files that are gone are also removed from the stored
    /// record.
    pub async fn load_for_display(
        &self,
        id: CredentialId,
    ) -> Result<(Credential, DisplayBatch), VaultError> {
        let stored = self.load(id).await?;
        let mut credential = stored.clone();
        let results = self.assets.codec().decode_all(&credential.image_paths).await;
        let batch = apply_decoded(&mut credential, results);

        let missing: Vec<&std::path::Path> = batch
            .notices
            .iter()
            .filter(|n| n.kind() == ImageErrorKind::FileNotFound)
            .map(ImageError::path)
            .collect();
        if !missing.is_empty() {
            let mut healed = stored;
            healed
                .image_paths
                .retain(|p| !missing.contains(&p.as_path()));
            match self.store().await?.write(&healed).await {
                Ok(()) => info!(
                    "credential {id}: removed {} missing image references",
                    missing.len()
                ),
                Err(e) => warn!("credential {id}: could not drop missing images: {e}"),
            }
        }
        Ok((credential, batch))
    }

    /// Removes the record and deletes its images. Returns false when the id
    /// was not live.
    pub async fn delete(&self, id: CredentialId) -> Result<bool, VaultError> {
        let store = self.store().await?;
        let existing = match store.read(id).await {
            Ok(existing) => existing,
            Err(StoreError::CorruptRecord { id, source }) => {
                warn!("deleting unreadable credential {id}, its images may leak: {source}");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let was_live = store.remove(id).await?;
        if let Some(credential) = existing {
            let deleted = self.assets.delete_images(&credential);
            debug!("credential {id}: deleted {deleted} images");
        }
        Ok(was_live)
    }

    pub async fn list(&self) -> Result<Vec<Credential>, VaultError> {
        Ok(self.store().await?.read_all().await?)
    }

    pub async fn labels(&self) -> Result<Vec<String>, VaultError> {
        Ok(self.store().await?.list_labels().await?)
    }

    pub fn sweep_scratch(&self, max_age: Duration) -> usize {
        self.assets.sweep_scratch(max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn assets(root: &std::path::Path) -> AssetManager {
        let codec = ImageCodec::new(
            root.join("files/images"),
            FileCipher::new(SecretCrypto::new(MasterKey::from_bytes([2u8; 32]))),
        );
        AssetManager::new(codec, root.join("cache/images"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lazy_store_opens_once() {
        let root = tempfile::tempdir().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = opened.clone();
        let store = LazyStore::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(MemoryKv::new()) }
        });
        let service = Arc::new(VaultService::new(store, assets(root.path())));
        assert!(!service.store.is_open());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service.store().await.map(|_| ()).is_ok()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_write_restores_scratch_paths() {
        let root = tempfile::tempdir().unwrap();
        let service = VaultService::new(LazyStore::ready(MemoryKv::new()), assets(root.path()));
        let mut card = service.new_credential("Card").await.unwrap();
        let scratch = service.assets().scratch_path_for(card.id, "png");
        fs::create_dir_all(scratch.parent().unwrap()).unwrap();
        fs::write(&scratch, b"img").unwrap();
        card.image_paths.push(scratch.clone());

        service.store().await.unwrap().backend().fail_put_sync(true);
        assert!(service.save(&mut card).await.is_err());
        assert_eq!(card.image_paths, vec![scratch.clone()]);
        let storage = service.assets().codec().storage_dir().to_path_buf();
        assert!(!storage.join(scratch.file_name().unwrap()).exists());

        service.store().await.unwrap().backend().fail_put_sync(false);
        let outcome = service.save(&mut card).await.unwrap();
        assert_eq!(outcome.images_migrated, 1);
        assert!(card.image_paths[0].starts_with(&storage));
    }

    #[tokio::test]
    async fn resave_removes_dropped_images() {
        let root = tempfile::tempdir().unwrap();
        let service = VaultService::new(LazyStore::ready(MemoryKv::new()), assets(root.path()));
        let mut card = service.new_credential("Card").await.unwrap();
        for body in [b"front".as_slice(), b"back".as_slice()] {
            let path = service.assets().scratch_path_for(card.id, "png");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, body).unwrap();
            card.image_paths.push(path);
        }
        service.save(&mut card).await.unwrap();
        let back = card.image_paths.pop().unwrap();

        let outcome = service.save(&mut card).await.unwrap();
        assert_eq!(outcome.images_migrated, 0);
        assert_eq!(outcome.orphans_removed, 1);
        assert!(outcome.notices.is_empty());
        assert!(!back.exists());
        assert_eq!(service.load(card.id).await.unwrap().image_paths, card.image_paths);
    }

    #[tokio::test]
    async fn purged_scratch_image_does_not_block_save() {
        let root = tempfile::tempdir().unwrap();
        let service = VaultService::new(LazyStore::ready(MemoryKv::new()), assets(root.path()));
        let mut card = service.new_credential("Card").await.unwrap();
        card.fields.push(crate::domain::CredentialField {
            name: "Number".into(),
            value: "4111".into(),
            secret: true,
        });
        let purged = service.assets().scratch_path_for(card.id, "png");
        card.image_paths.push(purged.clone());

        let outcome = service.save(&mut card).await.unwrap();
        assert_eq!(outcome.images_migrated, 0);
        assert_eq!(outcome.notices.len(), 1);
        assert_eq!(outcome.notices[0].path(), purged.as_path());
        assert!(card.image_paths.is_empty());

        let stored = service.load(card.id).await.unwrap();
        assert_eq!(stored.fields[0].value, "4111");
        assert!(stored.image_paths.is_empty());
    }

    #[tokio::test]
    async fn display_forgets_deleted_files() {
        let root = tempfile::tempdir().unwrap();
        let service = VaultService::new(LazyStore::ready(MemoryKv::new()), assets(root.path()));
        let mut card = service.new_credential("Card").await.unwrap();
        let scratch = service.assets().scratch_path_for(card.id, "png");
        fs::create_dir_all(scratch.parent().unwrap()).unwrap();
        fs::write(&scratch, b"img").unwrap();
        card.image_paths.push(scratch);
        service.save(&mut card).await.unwrap();
        let updated_at = card.updated_at;
        fs::remove_file(&card.image_paths[0]).unwrap();

        let (shown, batch) = service.load_for_display(card.id).await.unwrap();
        assert!(shown.image_paths.is_empty());
        assert_eq!(batch.notices.len(), 1);

        let stored = service.load(card.id).await.unwrap();
        assert!(stored.image_paths.is_empty());
        assert_eq!(stored.updated_at, updated_at);
        let (_, again) = service.load_for_display(card.id).await.unwrap();
        assert!(again.notices.is_empty());
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let service = VaultService::new(LazyStore::ready(MemoryKv::new()), assets(root.path()));
        assert!(matches!(
            service.load(77).await,
            Err(VaultError::NotFound(77))
        ));
        assert!(!service.delete(77).await.unwrap());
    }
}
