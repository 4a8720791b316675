//! Error taxonomy for the archive codec, indexer, and layer fetcher.
//!
//! Variants mirror the failure kinds named in the design: corruption is
//! fail-fast, network failures are retried once upstream and surfaced here
//! only after retries are exhausted. [`fs`](crate::fs) maps every variant to
//! a POSIX errno since `fuser::Filesystem` methods cannot return `Result`.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("archive header magic or version mismatch")]
    HeaderMismatch,

    #[error("unsupported storage-info type {0:?}")]
    UnsupportedStorageInfoType([u8; 12]),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("corrupt storage-info: {0}")]
    CorruptStorageInfo(String),

    #[error("unsupported layer media type {0}")]
    UnsupportedLayerMediaType(String),

    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("registry authentication failed for {0}")]
    RegistryUnauthorized(String),

    #[error("registry resource not found: {0}")]
    RegistryNotFound(String),

    #[error("gzip decompression failed: {0}")]
    DecompressionError(String),

    #[error("decompressed layer hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("requested byte range not satisfiable")]
    RangeUnsatisfiable,

    #[error("overlay mount unsupported on this host: {0}")]
    OverlayUnsupported(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bincode (de)serialization failed: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, ClipError>;

impl ClipError {
    /// Map this error to the POSIX errno surfaced at the FUSE boundary.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            ClipError::NotFound(_) => libc::ENOENT,
            ClipError::RangeUnsatisfiable => libc::EIO,
            ClipError::RegistryUnreachable(_)
            | ClipError::RegistryUnauthorized(_)
            | ClipError::RegistryNotFound(_)
            | ClipError::DecompressionError(_)
            | ClipError::HashMismatch { .. } => libc::EIO,
            ClipError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}
