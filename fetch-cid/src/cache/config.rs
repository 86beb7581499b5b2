//! Configuration for the disk cache

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application id used to resolve the default cache directory
pub const DEFAULT_APP_ID: &str = "fetch-cid";

/// Chunks a fast reader may run ahead of a slow one on a duplicated stream
pub const DEFAULT_TEE_CAPACITY: usize = 16;

/// Environment variable overriding the cache directory
pub const CACHE_DIR_ENV: &str = "FETCH_CID_CACHE_DIR";

/// Configuration for the disk cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding one file per cached CID
    pub cache_dir: PathBuf,

    /// Buffered chunks per branch when a response is split between
    /// the caller and the cache writer
    pub tee_capacity: usize,
}

impl CacheConfig {
    /// Create a configuration rooted at `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            tee_capacity: DEFAULT_TEE_CAPACITY,
        }
    }

    /// Resolve the platform cache directory for an application id
    ///
    /// On Linux this is `$XDG_CACHE_HOME/<app_id>` (usually
    /// `~/.cache/<app_id>`), on macOS `~/Library/Caches/<app_id>`.
    pub fn for_app(app_id: &str) -> Result<Self> {
        let base = dirs::cache_dir().ok_or_else(|| {
            FetchError::ConfigError("could not determine platform cache directory".to_string())
        })?;
        Ok(Self::new(base.join(app_id)))
    }

    /// Like [`CacheConfig::for_app`], honouring `FETCH_CID_CACHE_DIR`
    pub fn from_env(app_id: &str) -> Result<Self> {
        dotenv::dotenv().ok();

        match std::env::var(CACHE_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => Ok(Self::new(dir)),
            _ => Self::for_app(app_id),
        }
    }

    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(FetchError::ConfigError(
                "cache_dir must not be empty".to_string(),
            ));
        }

        if self.tee_capacity == 0 {
            return Err(FetchError::ConfigError(
                "tee_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    cache_dir: Option<PathBuf>,
    app_id: Option<String>,
    tee_capacity: Option<usize>,
}

impl CacheConfigBuilder {
    /// Use an explicit cache directory
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Resolve the cache directory from an application id
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Set the per-branch buffer of duplicated streams
    pub fn tee_capacity(mut self, capacity: usize) -> Self {
        self.tee_capacity = Some(capacity);
        self
    }

    /// Build and validate the cache configuration
    ///
    /// An explicit `cache_dir` wins over `app_id`; with neither set the
    /// directory for [`DEFAULT_APP_ID`] is used.
    pub fn build(self) -> Result<CacheConfig> {
        let mut config = match self.cache_dir {
            Some(dir) => CacheConfig::new(dir),
            None => CacheConfig::for_app(self.app_id.as_deref().unwrap_or(DEFAULT_APP_ID))?,
        };

        if let Some(capacity) = self.tee_capacity {
            config.tee_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }
}
