//! Error types for CID fetching and the disk cache
//!
//! Every failure surfaces through [`FetchError`]. The type is `Clone` so a
//! single failure can be handed to every caller coalesced onto the same
//! in-flight fetch, and to both branches of a duplicated stream.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for fetch and cache operations
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// Filesystem error while reading, writing or deleting a cache entry
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// HTTP client error - connection, timeout or body transfer
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    /// The gateway answered with a non-success status
    #[error("Gateway returned status {status} for {url}")]
    Status { status: u16, url: String },

    /// A key that cannot be mapped to a file inside the cache directory
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The background fetch task panicked or was cancelled
    #[error("Fetch task failed: {0}")]
    TaskFailed(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for fetch and cache operations
pub type Result<T> = std::result::Result<T, FetchError>;

impl FetchError {
    /// Whether this is the "file does not exist" case.
    ///
    /// The store turns exactly this case into an absent entry on lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Io(err) if err.kind() == io::ErrorKind::NotFound)
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        FetchError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(Arc::new(err))
    }
}

impl From<String> for FetchError {
    fn from(s: String) -> Self {
        FetchError::Other(s)
    }
}

impl From<&str> for FetchError {
    fn from(s: &str) -> Self {
        FetchError::Other(s.to_string())
    }
}
