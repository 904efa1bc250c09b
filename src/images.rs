//! Classifies image files as encrypted or plaintext and decodes them for
//! display.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader, Limits};
use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::domain::Credential;
use crate::error::ImageError;
use crate::file_cipher::FileCipher;

/// Example assets shipped with the app. They stay plaintext even inside
/// the storage directory.
pub const BUNDLED_EXAMPLES: &[&str] = &["example_card_front.png", "example_card_back.png"];

#[derive(Debug, Clone, Copy)]
pub struct DecodeBounds {
    pub max_width: u32,
    pub max_height: u32,
    pub max_alloc: u64,
}

impl Default for DecodeBounds {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1920,
            max_alloc: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub path: PathBuf,
    pub image: DynamicImage,
}

/// Images ready for display plus the failures that were dropped or kept.
#[derive(Debug, Default)]
pub struct DisplayBatch {
    pub images: Vec<DecodedImage>,
    pub notices: Vec<ImageError>,
}

#[derive(Clone)]
pub struct ImageCodec {
    storage_dir: PathBuf,
    bundled: BTreeSet<String>,
    cipher: FileCipher,
    bounds: DecodeBounds,
}

impl ImageCodec {
    pub fn new(storage_dir: impl Into<PathBuf>, cipher: FileCipher) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            bundled: BUNDLED_EXAMPLES.iter().map(|s| s.to_string()).collect(),
            cipher,
            bounds: DecodeBounds::default(),
        }
    }

    pub fn with_bundled<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bundled = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bounds(mut self, bounds: DecodeBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn is_encrypted_at_rest(&self, path: &Path) -> bool {
        if !path.starts_with(&self.storage_dir) {
            return false;
        }
        let bundled = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.bundled.contains(n));
        !bundled
    }

    /// Decodes and scales the image down to the configured bounds.
    pub fn decode(&self, path: &Path) -> Result<DecodedImage, ImageError> {
        let bytes = if self.is_encrypted_at_rest(path) {
            self.cipher
                .open(path)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => ImageError::FileNotFound {
                        path: path.to_path_buf(),
                    },
                    _ => ImageError::DecryptionFailed {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    },
                })?
                .into_inner()
        } else {
            fs::read(path).map_err(|e| ImageError::io(path, e))?
        };

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ImageError::UnknownDecodeFailure {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.bounds.max_alloc);
        reader.limits(limits);

        let image = reader.decode().map_err(|e| match e {
            image::ImageError::Limits(limit) => ImageError::TooLarge {
                path: path.to_path_buf(),
                message: limit.to_string(),
            },
            other => ImageError::UnknownDecodeFailure {
                path: path.to_path_buf(),
                message: other.to_string(),
            },
        })?;

        let DecodeBounds {
            max_width,
            max_height,
            ..
        } = self.bounds;
        let image = if image.width() > max_width || image.height() > max_height {
            image.thumbnail(max_width, max_height)
        } else {
            image
        };
        debug!(
            "decoded {} at {}x{}",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(DecodedImage {
            path: path.to_path_buf(),
            image,
        })
    }

    /// Writes an encrypted copy of `source` into `dest_dir`. The file name is
    /// kept unless taken, in which case `<stem>_<n>.<ext>` is used. Existing
    /// files are never replaced.
    pub fn encrypt_copy(&self, source: &Path, dest_dir: &Path) -> Result<PathBuf, ImageError> {
        let name = source.file_name().ok_or_else(|| ImageError::Io {
            path: source.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
        let mut plain = fs::read(source).map_err(|e| ImageError::io(source, e))?;
        fs::create_dir_all(dest_dir).map_err(|e| ImageError::io(dest_dir, e))?;

        let written = (0u32..)
            .map(|n| dest_dir.join(numbered(Path::new(name), n)))
            .find_map(|dest| {
                let mut writer = self.cipher.create_new(&dest);
                match writer.write_all(&plain).and_then(|_| writer.finish()) {
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        debug!("{} taken, trying the next name", dest.display());
                        None
                    }
                    other => Some(other.map_err(|source| ImageError::Io { path: dest, source })),
                }
            });
        zeroize::Zeroize::zeroize(&mut plain);
        written.unwrap_or_else(|| {
            Err(ImageError::Io {
                path: dest_dir.to_path_buf(),
                source: std::io::Error::other("no free file name"),
            })
        })
    }

    /// Decodes every path concurrently and returns only once all are done,
    /// in input order. Dropping the future discards every result.
    pub async fn decode_all(&self, paths: &[PathBuf]) -> Vec<Result<DecodedImage, ImageError>> {
        let mut tasks = JoinSet::new();
        for (slot, path) in paths.iter().cloned().enumerate() {
            let codec = self.clone();
            tasks.spawn_blocking(move || (slot, codec.decode(&path)));
        }

        let mut results: Vec<Option<Result<DecodedImage, ImageError>>> =
            paths.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(e) => warn!("image decode task failed: {e}"),
            }
        }

        paths
            .iter()
            .zip(results)
            .map(|(path, result)| {
                result.unwrap_or_else(|| {
                    Err(ImageError::UnknownDecodeFailure {
                        path: path.clone(),
                        message: "decode task did not complete".into(),
                    })
                })
            })
            .collect()
    }

    /// Like [`decode_all`](Self::decode_all) but gives up, returning `None`,
    /// once `cancel` turns true or its sender is dropped.
    pub async fn decode_all_or_cancel(
        &self,
        paths: &[PathBuf],
        mut cancel: watch::Receiver<bool>,
    ) -> Option<Vec<Result<DecodedImage, ImageError>>> {
        tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                debug!("image decode cancelled, discarding {} results", paths.len());
                None
            }
            results = self.decode_all(paths) => Some(results),
        }
    }
}

fn numbered(name: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return name.to_path_buf();
    }
    let stem = name.file_stem().unwrap_or_default().to_string_lossy();
    match name.extension() {
        Some(ext) => PathBuf::from(format!("{stem}_{n}.{}", ext.to_string_lossy())),
        None => PathBuf::from(format!("{stem}_{n}")),
    }
}

/// Drops references whose failure is a resource error and collects the
/// notifications for the caller.
pub fn apply_decoded(
    credential: &mut Credential,
    results: Vec<Result<DecodedImage, ImageError>>,
) -> DisplayBatch {
    let mut batch = DisplayBatch::default();
    let mut dropped = Vec::new();
    for result in results {
        match result {
            Ok(image) => batch.images.push(image),
            Err(e) => {
                if e.drops_reference() {
                    dropped.push(e.path().to_path_buf());
                }
                warn!("credential {}: {e}", credential.id);
                batch.notices.push(e);
            }
        }
    }
    if !dropped.is_empty() {
        credential.image_paths.retain(|p| !dropped.contains(p));
    }
    batch
}
