//! Encrypted-file primitive for images at rest.
//!
//! File layout: `CVI1 || nonce || ciphertext`. The file name is bound as
//! associated data so a sealed file cannot be swapped for another.

use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::crypto::SecretCrypto;
use crate::error::CryptoError;

pub const MAGIC: &[u8; 4] = b"CVI1";

#[derive(Clone)]
pub struct FileCipher {
    crypto: SecretCrypto,
}

impl FileCipher {
    pub fn new(crypto: SecretCrypto) -> Self {
        Self { crypto }
    }

    pub fn create(&self, path: impl Into<PathBuf>) -> EncryptedWriter {
        EncryptedWriter {
            crypto: self.crypto.clone(),
            path: path.into(),
            buffer: Vec::new(),
            clobber: true,
        }
    }

    /// Like [`create`](Self::create), but `finish` fails with
    /// `AlreadyExists` instead of replacing an existing file.
    pub fn create_new(&self, path: impl Into<PathBuf>) -> EncryptedWriter {
        EncryptedWriter {
            clobber: false,
            ..self.create(path)
        }
    }

    /// Reads and decrypts the whole file.
    pub fn open(&self, path: &Path) -> io::Result<Cursor<Vec<u8>>> {
        let sealed = fs::read(path)?;
        let body = sealed
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an encrypted image"))?;
        let plain = self
            .crypto
            .open(&aad_for(path), body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Cursor::new(plain))
    }
}

fn aad_for(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Buffers plaintext; nothing reaches disk until [`EncryptedWriter::finish`].
pub struct EncryptedWriter {
    crypto: SecretCrypto,
    path: PathBuf,
    buffer: Vec<u8>,
    clobber: bool,
}

impl Write for EncryptedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EncryptedWriter {
    /// Seals the buffered bytes and writes them via temp file and rename.
    /// The temp file is removed if any step fails.
    pub fn finish(mut self) -> io::Result<PathBuf> {
        let sealed = self
            .crypto
            .seal(&aad_for(&self.path), &self.buffer)
            .map_err(|e: CryptoError| io::Error::other(e))?;
        zeroize::Zeroize::zeroize(&mut self.buffer);

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(MAGIC)?;
        tmp.write_all(&sealed)?;
        tmp.as_file().sync_all()?;
        if self.clobber {
            tmp.persist(&self.path).map_err(|e| e.error)?;
        } else {
            tmp.persist_noclobber(&self.path).map_err(|e| e.error)?;
        }
        Ok(self.path)
    }
}
