//! # fetch-cid
//!
//! Fetch IPFS content by CID through an HTTP gateway, memoized on local
//! disk so each CID crosses the network once.
//!
//! ## Features
//!
//! - Streaming: content is returned as a stream of byte chunks, never
//!   buffered whole in memory
//! - Write-behind caching: a network response is split so the caller and
//!   the disk writer consume it at the same time
//! - Coalescing: concurrent requests for the same CID share one fetch
//! - Partial-write safety: an interrupted download never leaves a
//!   truncated cache entry
//! - No negative caching: a failed fetch is retried on the next request
//!
//! ## Quick start
//!
//! ```no_run
//! use fetch_cid::{fetch_cid, FetchOptions};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = FetchOptions::builder()
//!         .gateway_base_url("https://dweb.link/ipfs/")
//!         .build();
//!
//!     let mut content = fetch_cid("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi", Some(options)).await?;
//!     while let Some(chunk) = content.next().await {
//!         println!("{} bytes", chunk?.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Long-lived use
//!
//! Applications fetching many CIDs should hold a [`CidFetcher`], which
//! reuses one HTTP client and exposes the store and counters:
//!
//! ```no_run
//! use fetch_cid::{CacheConfig, CidFetcher, FetchOptions, HttpGateway};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let gateway = HttpGateway::new(FetchOptions::default())?;
//! let fetcher = CidFetcher::new(gateway, CacheConfig::for_app("my-app")?)?;
//!
//! let _content = fetcher.fetch("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi").await?;
//! println!("{}", fetcher.stats());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod gateway;

use std::sync::OnceLock;

// Re-export main types for convenience
pub use cache::{
    tee, ByteStream, CacheConfig, CacheConfigBuilder, CacheStats, CidFetcher, DiskStore,
    InFlightTable, OnFinish, OnFinishExt, TeeBranch,
};
pub use error::{FetchError, Result};
pub use gateway::{FetchOptions, FetchOptionsBuilder, Gateway, HttpGateway};

/// In-flight fetches shared by every [`fetch_cid`] call in the process
fn shared_in_flight() -> InFlightTable {
    static IN_FLIGHT: OnceLock<InFlightTable> = OnceLock::new();
    IN_FLIGHT.get_or_init(InFlightTable::new).clone()
}

/// Fetch `cid`, caching it under the default cache directory
///
/// `options` fields override [`FetchOptions::default`]. The cache key is
/// the CID alone, so content cached through one gateway is served for
/// requests naming another. Concurrent calls for the same CID coalesce
/// across the whole process.
pub async fn fetch_cid(cid: &str, options: Option<FetchOptions>) -> Result<ByteStream> {
    let options = options.unwrap_or_default();
    let config = CacheConfig::from_env(cache::DEFAULT_APP_ID)?;

    let fetcher = CidFetcher::new(HttpGateway::new(options)?, config)?
        .with_in_flight(shared_in_flight());
    fetcher.fetch(cid).await
}
