//! Shared types for cached content and fetcher counters

use crate::error::FetchError;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key type - the content identifier as given by the caller
pub type CacheKey = String;

/// A single chunk of fetched or cached content
pub type Chunk = std::result::Result<Bytes, FetchError>;

/// Lazily produced, finite, non-restartable sequence of content chunks
pub type ByteStream = BoxStream<'static, Chunk>;

/// Snapshot of fetcher counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fetches answered from the disk store
    pub hits: u64,

    /// Fetches that had to go to the gateway
    pub misses: u64,

    /// Calls that joined an already running fetch for the same key
    pub coalesced: u64,

    /// Fetches that ended in an error
    pub failures: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Number of network requests issued
    pub fn network_fetches(&self) -> u64 {
        self.misses
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, coalesced: {}, failures: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.coalesced,
            self.failures
        )
    }
}

/// Live counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
