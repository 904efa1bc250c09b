//! Moves captured images from the unencrypted scratch directory into
//! encrypted storage when a credential is saved, and deletes images that
//! are no longer referenced.
//!
//! Per image slot: `absent -> scratch -> permanent`, plus `scratch -> absent`
//! and `permanent -> absent`. Nothing ever moves back to scratch.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::domain::{Credential, CredentialId, now_millis};
use crate::error::{ImageError, ImageErrorKind};
use crate::images::ImageCodec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedImage {
    pub scratch: PathBuf,
    pub permanent: PathBuf,
}

/// What one save-time migration did, kept so it can be undone.
#[derive(Debug, Default)]
pub struct Migration {
    pub moved: Vec<MovedImage>,
    /// References dropped because their scratch file was gone.
    pub dropped: Vec<ImageError>,
    original_paths: Vec<PathBuf>,
}

impl Migration {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.dropped.is_empty()
    }
}

pub struct AssetManager {
    codec: ImageCodec,
    scratch_dir: PathBuf,
}

impl AssetManager {
    pub fn new(codec: ImageCodec, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            codec,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn codec(&self) -> &ImageCodec {
        &self.codec
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// `<id>_<epoch-millis>.<ext>` in the scratch directory, bumped until unused.
    pub fn scratch_path_for(&self, id: CredentialId, ext: &str) -> PathBuf {
        let mut stamp = now_millis().timestamp_millis();
        loop {
            let name = format!("{id}_{stamp}.{ext}");
            let candidate = self.scratch_dir.join(&name);
            let taken = candidate.exists() || self.codec.storage_dir().join(&name).exists();
            if !taken {
                return candidate;
            }
            stamp += 1;
        }
    }

    /// Copies an externally captured image into scratch for `id`.
    pub fn import_to_scratch(&self, source: &Path, id: CredentialId) -> Result<PathBuf, ImageError> {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("img")
            .to_ascii_lowercase();
        fs::create_dir_all(&self.scratch_dir).map_err(|e| ImageError::io(&self.scratch_dir, e))?;
        let dest = self.scratch_path_for(id, &ext);
        fs::copy(source, &dest).map_err(|e| ImageError::io(source, e))?;
        debug!("captured {} as {}", source.display(), dest.display());
        Ok(dest)
    }

    /// Encrypts every image not yet in storage and rewrites its path.
    ///
    /// A scratch file that has vanished is dropped from the credential and
    /// reported in [`Migration::dropped`]. Scratch originals are left for
    /// [`sweep_scratch`](Self::sweep_scratch). Any other failure removes the
    /// copies made so far and restores the paths.
    pub fn migrate_on_save(&self, credential: &mut Credential) -> Result<Migration, ImageError> {
        let storage = self.codec.storage_dir().to_path_buf();
        let mut migration = Migration {
            original_paths: credential.image_paths.clone(),
            ..Migration::default()
        };

        let mut kept = Vec::with_capacity(credential.image_paths.len());
        for path in std::mem::take(&mut credential.image_paths) {
            // Encrypted images and shipped examples already live in storage.
            if path.starts_with(&storage) {
                kept.push(path);
                continue;
            }
            match self.codec.encrypt_copy(&path, &storage) {
                Ok(permanent) => {
                    kept.push(permanent.clone());
                    migration.moved.push(MovedImage {
                        scratch: path,
                        permanent,
                    });
                }
                Err(e) if e.kind() == ImageErrorKind::FileNotFound && e.path() == path.as_path() => {
                    warn!("credential {}: dropping {e}", credential.id);
                    migration.dropped.push(e);
                }
                Err(e) => {
                    warn!("credential {}: migrating {} failed: {e}", credential.id, path.display());
                    self.rollback(credential, migration);
                    return Err(e);
                }
            }
        }
        credential.image_paths = kept;

        if !migration.moved.is_empty() {
            info!(
                "credential {}: moved {} images into encrypted storage",
                credential.id,
                migration.moved.len()
            );
        }
        Ok(migration)
    }

    /// Undoes a migration: deletes the encrypted copies it wrote and restores
    /// the paths the credential had before.
    pub fn rollback(&self, credential: &mut Credential, migration: Migration) {
        for moved in &migration.moved {
            remove_best_effort(&moved.permanent);
        }
        credential.image_paths = migration.original_paths;
    }

    /// Deletes permanent images the previous version referenced and the
    /// current one no longer does. Returns how many were removed.
    pub fn remove_orphans(&self, previous: Option<&Credential>, current: &Credential) -> usize {
        let Some(previous) = previous else {
            return 0;
        };
        previous
            .image_paths
            .iter()
            .filter(|p| !current.image_paths.contains(p))
            .filter(|p| self.codec.is_encrypted_at_rest(p))
            .filter(|p| remove_best_effort(p))
            .count()
    }

    /// Abandoned edits leave storage untouched; scratch files go with the sweep.
    pub fn discard_on_cancel(&self, credential: &Credential) {
        let pending = credential
            .image_paths
            .iter()
            .filter(|p| p.starts_with(&self.scratch_dir))
            .count();
        debug!(
            "credential {}: edit cancelled, {} scratch images left for sweep",
            credential.id, pending
        );
    }

    /// Deletes every image of a credential being removed, except shipped
    /// examples.
    pub fn delete_images(&self, credential: &Credential) -> usize {
        let storage = self.codec.storage_dir();
        credential
            .image_paths
            .iter()
            .filter(|p| !p.starts_with(storage) || self.codec.is_encrypted_at_rest(p))
            .filter(|p| remove_best_effort(p))
            .count()
    }

    /// Removes scratch files last modified more than `max_age` ago.
    pub fn sweep_scratch(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("cannot sweep {}: {e}", self.scratch_dir.display());
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= max_age && remove_best_effort(&entry.path()) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("swept {removed} scratch images");
        }
        removed
    }
}

fn remove_best_effort(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("deleted {}", path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} already gone", path.display());
            false
        }
        Err(e) => {
            warn!("could not delete {}: {e}", path.display());
            false
        }
    }
}
