use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encrypt failed: {0}")]
    Seal(String),
    #[error("decrypt failed: {0}")]
    Open(String),
    #[error("ciphertext too short")]
    Truncated,
}

/// Malformed encoded record. Always a data-corruption condition.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoded record is empty")]
    Empty,
    #[error("expected {expected} components, found {found}")]
    ComponentCount { expected: usize, found: usize },
    #[error("invalid {what}: {value:?}")]
    InvalidNumber { what: &'static str, value: String },
    #[error("invalid boolean: {0:?}")]
    InvalidBool(String),
    #[error("unknown barcode type: {0:?}")]
    UnknownBarcodeType(String),
    #[error("malformed {what} item: {found} sub-fields")]
    SubFieldCount { what: &'static str, found: usize },
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("stored value for '{0}' is not valid utf-8")]
    Utf8(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Injected(&'static str),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key-value backend failed while {context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: KvError,
    },
    #[error("identifier index update could not be confirmed: {0}")]
    IndexNotDurable(#[source] KvError),
    #[error("identifier index is corrupt: {0:?}")]
    CorruptIndex(String),
    #[error("credential {id} is unreadable: {source}")]
    CorruptRecord {
        id: u32,
        #[source]
        source: CodecError,
    },
}

/// Classification of image failures, used by callers to decide whether to
/// drop the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageErrorKind {
    FileNotFound,
    TooLarge,
    DecryptionFailed,
    UnknownDecodeFailure,
    Io,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image not found: {}", path.display())]
    FileNotFound { path: PathBuf },
    #[error("image too large to decode: {} ({message})", path.display())]
    TooLarge { path: PathBuf, message: String },
    #[error("could not decrypt image {}: {message}", path.display())]
    DecryptionFailed { path: PathBuf, message: String },
    #[error("could not decode image {}: {message}", path.display())]
    UnknownDecodeFailure { path: PathBuf, message: String },
    #[error("image i/o failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ImageError {
    pub fn kind(&self) -> ImageErrorKind {
        match self {
            Self::FileNotFound { .. } => ImageErrorKind::FileNotFound,
            Self::TooLarge { .. } => ImageErrorKind::TooLarge,
            Self::DecryptionFailed { .. } => ImageErrorKind::DecryptionFailed,
            Self::UnknownDecodeFailure { .. } => ImageErrorKind::UnknownDecodeFailure,
            Self::Io { .. } => ImageErrorKind::Io,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::FileNotFound { path }
            | Self::TooLarge { path, .. }
            | Self::DecryptionFailed { path, .. }
            | Self::UnknownDecodeFailure { path, .. }
            | Self::Io { path, .. } => path,
        }
    }

    /// Resource errors drop the image reference instead of failing the flow.
    pub fn drops_reference(&self) -> bool {
        matches!(
            self.kind(),
            ImageErrorKind::FileNotFound
                | ImageErrorKind::TooLarge
                | ImageErrorKind::DecryptionFailed
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::FileNotFound { path }
        } else {
            Self::Io { path, source }
        }
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("credential {0} not found")]
    NotFound(u32),
    #[error("could not open vault database: {0}")]
    Open(#[source] KvError),
}

pub type StoreResult<T> = Result<T, StoreError>;
