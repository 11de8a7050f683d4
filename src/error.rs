use std::io;

use thiserror::Error;

/// Error taxonomy for cache refresh operations.
///
/// Several variants double as control flow: the updaters downgrade an
/// incremental refresh to a full one on `CacheNotFound`, `CacheInvalid`, and
/// cache-side `EmptyMap`, and the per-map loop in the update command converts
/// the rest into a failure count rather than aborting the run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cache not found: {0}")]
    CacheNotFound(String),

    #[error("cache invalid: {0}")]
    CacheInvalid(String),

    #[error("empty map: {0}")]
    EmptyMap(String),

    #[error("invalid map: {0}")]
    InvalidMap(String),

    #[error("invalid merge: {0}")]
    InvalidMerge(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported map: {0}")]
    UnsupportedMap(String),

    #[error("no configuration file found")]
    NoConfigFound,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an I/O error, promoting EACCES to the distinct permission kind.
    pub fn from_io(err: io::Error, context: &str) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(format!("{context}: {err}"))
        } else {
            Self::Io(err)
        }
    }
}
