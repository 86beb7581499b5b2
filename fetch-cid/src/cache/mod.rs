//! # Disk-Memoized Content Cache
//!
//! This module implements a permanent on-disk memo table for content
//! fetched by CID. Entries are never evicted or expired.
//!
//! ## Components
//!
//! - [`DiskStore`]: one file per key, with `get`/`has`/`set`/`delete`
//! - [`tee`]: splits a single-read byte stream into two bounded readers
//! - [`OnFinish`]: runs a cleanup exactly once on end-of-stream or drop
//! - [`CidFetcher`]: memoizing orchestrator with per-key fetch coalescing
//!
//! ## Data flow
//!
//! ```text
//! fetch(cid) ──► in flight? ──yes──► wait, then open from disk
//!                    │ no
//!                    ▼
//!               on disk? ──yes──► open from disk
//!                    │ no
//!                    ▼
//!               gateway GET ──► tee ──► caller
//!                                  └──► DiskStore::set
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use fetch_cid::cache::{CacheConfig, DiskStore};
//! use futures::StreamExt;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = DiskStore::from_config(&CacheConfig::new("/tmp/cid-cache"));
//!
//! if let Some(mut stream) = store.get("bafybeigdyrzt").await? {
//!     while let Some(chunk) = stream.next().await {
//!         println!("{} bytes", chunk?.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fetcher;
pub mod finish;
pub mod store;
pub mod tee;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder, DEFAULT_APP_ID, DEFAULT_TEE_CAPACITY};
pub use fetcher::{CidFetcher, InFlightTable, Settled};
pub use finish::{OnFinish, OnFinishExt};
pub use store::DiskStore;
pub use tee::{tee, tee_with_capacity, Side, TeeBranch};
pub use types::{ByteStream, CacheKey, CacheStats, Chunk};
