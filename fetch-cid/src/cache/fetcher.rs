//! Memoizing fetch orchestration
//!
//! [`CidFetcher::fetch`] answers from the disk store when it can and goes to
//! the gateway otherwise, writing the response to the store while the
//! caller reads it. At most one fetch per key runs at a time: concurrent
//! callers for a key share the in-flight fetch through a
//! [`futures::future::Shared`] future and read the entry from disk once it
//! settles.
//!
//! Each fetch runs on its own spawned task, so the write to the store keeps
//! going when the caller that started it drops its stream early.

use crate::cache::config::CacheConfig;
use crate::cache::store::DiskStore;
use crate::cache::tee::tee_with_capacity;
use crate::cache::types::{ByteStream, CacheKey, CacheStats, StatsCounters};
use crate::error::{FetchError, Result};
use crate::gateway::{Gateway, HttpGateway};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How a settled fetch ended up populating the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// The entry was already on disk
    Hit,
    /// The entry was fetched and written; carries the stored size
    Stored(u64),
}

type SettledFuture = Shared<BoxFuture<'static, Result<Settled>>>;

struct InFlight {
    generation: u64,
    settled: SettledFuture,
}

/// Fetches currently running, by key
///
/// Cloning shares the table, which lets several fetchers coalesce
/// requests with each other.
#[derive(Clone, Default)]
pub struct InFlightTable {
    entries: Arc<Mutex<HashMap<CacheKey, InFlight>>>,
    generations: Arc<AtomicU64>,
}

impl InFlightTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a fetch in progress
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no fetch is in progress
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether a fetch for `key` is in progress
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop the record for `key` if it still belongs to `generation`
    fn settle(&self, key: &str, generation: u64) {
        let mut entries = self.lock();
        if entries.get(key).map(|entry| entry.generation) == Some(generation) {
            entries.remove(key);
        }
    }
}

impl std::fmt::Debug for InFlightTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTable")
            .field("in_flight", &self.len())
            .finish()
    }
}

/// Disk-memoized CID fetcher
pub struct CidFetcher<G: Gateway = HttpGateway> {
    store: DiskStore,
    gateway: Arc<G>,
    in_flight: InFlightTable,
    tee_capacity: usize,
    stats: Arc<StatsCounters>,
}

impl<G: Gateway> CidFetcher<G> {
    /// Create a fetcher over `gateway`, caching as configured
    pub fn new(gateway: G, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        info!("Initializing CID fetcher with config: {:?}", config);

        Ok(Self {
            store: DiskStore::from_config(&config),
            gateway: Arc::new(gateway),
            in_flight: InFlightTable::new(),
            tee_capacity: config.tee_capacity,
            stats: Arc::new(StatsCounters::default()),
        })
    }

    /// Share an in-flight table with other fetchers
    pub fn with_in_flight(mut self, in_flight: InFlightTable) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// The underlying disk store
    pub fn store(&self) -> &DiskStore {
        &self.store
    }

    /// The gateway used on cache misses
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// The in-flight table this fetcher coalesces through
    pub fn in_flight(&self) -> &InFlightTable {
        &self.in_flight
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Content for `cid`, from the disk store or the gateway
    ///
    /// The caller that starts a network fetch receives one half of the
    /// response while the other half is written to the store. That caller
    /// should keep reading: the writer can run at most the tee capacity
    /// ahead of it.
    ///
    /// A caller that joins a running fetch gets its stream right away. The
    /// stream waits for the write to land on its first poll and then reads
    /// the stored entry; a failed fetch shows up as its first item.
    pub async fn fetch(&self, cid: &str) -> Result<ByteStream> {
        match self.join_or_start(cid) {
            Joined::Leader(leader) => receive(leader, cid).await,
            Joined::Waiter(settled) => {
                self.stats.record_coalesced();
                debug!("Joining in-flight fetch for {}", cid);

                let fetcher = self.clone();
                let key = cid.to_string();
                Ok(stream::once(fetcher.open_when_settled(key, settled))
                    .try_flatten()
                    .boxed())
            }
        }
    }

    /// Wait for an in-flight fetch, then open what it stored
    async fn open_when_settled(
        self,
        key: CacheKey,
        mut settled: SettledFuture,
    ) -> Result<ByteStream> {
        loop {
            settled.await?;

            if let Some(stream) = self.store.get(&key).await? {
                return Ok(stream);
            }

            // Deleted between settling and opening; go again
            debug!("Entry for {} vanished after fetch, retrying", key);
            match self.join_or_start(&key) {
                Joined::Leader(leader) => return receive(leader, &key).await,
                Joined::Waiter(next) => settled = next,
            }
        }
    }

    /// Join the running fetch for `cid`, or start one and become its leader
    fn join_or_start(&self, cid: &str) -> Joined {
        let mut entries = self.in_flight.lock();

        if let Some(entry) = entries.get(cid) {
            return Joined::Waiter(entry.settled.clone());
        }

        let generation = self.in_flight.next_generation();
        let (tx, rx) = oneshot::channel();
        let task = FetchTask {
            key: cid.to_string(),
            store: self.store.clone(),
            gateway: Arc::clone(&self.gateway),
            tee_capacity: self.tee_capacity,
            stats: Arc::clone(&self.stats),
        };

        let in_flight = self.in_flight.clone();
        let key = cid.to_string();
        let handle = tokio::spawn(async move {
            let mut leader = Some(tx);
            let result = task.run(&mut leader).await;
            in_flight.settle(&key, generation);

            if let Err(err) = &result {
                warn!("Fetch for {} failed: {}", key, err);
                // Failed before a stream was handed out
                if let Some(leader) = leader.take() {
                    let _ = leader.send(Err(err.clone()));
                }
            }
            result
        });

        let settled = handle
            .map(|joined| {
                joined.unwrap_or_else(|err| Err(FetchError::TaskFailed(err.to_string())))
            })
            .boxed()
            .shared();

        entries.insert(cid.to_string(), InFlight { generation, settled });

        Joined::Leader(rx)
    }
}

impl<G: Gateway> Clone for CidFetcher<G> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            gateway: Arc::clone(&self.gateway),
            in_flight: self.in_flight.clone(),
            tee_capacity: self.tee_capacity,
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Outcome of looking up the in-flight table
enum Joined {
    /// This call started the fetch and will be handed its stream
    Leader(oneshot::Receiver<Result<ByteStream>>),
    /// Another call is fetching; settles once the store write is done
    Waiter(SettledFuture),
}

async fn receive(
    leader: oneshot::Receiver<Result<ByteStream>>,
    cid: &str,
) -> Result<ByteStream> {
    leader.await.unwrap_or_else(|_| {
        Err(FetchError::TaskFailed(format!(
            "fetch task for {} ended without a result",
            cid
        )))
    })
}

impl CidFetcher<HttpGateway> {
    /// Fetcher over an HTTP gateway, caching under the default directory
    pub fn with_defaults() -> Result<Self> {
        let options = crate::gateway::FetchOptions::from_env()?;
        let config = CacheConfig::from_env(crate::cache::config::DEFAULT_APP_ID)?;
        Self::new(HttpGateway::new(options)?, config)
    }
}

/// Work done on the spawned task for one key
struct FetchTask<G> {
    key: CacheKey,
    store: DiskStore,
    gateway: Arc<G>,
    tee_capacity: usize,
    stats: Arc<StatsCounters>,
}

impl<G: Gateway> FetchTask<G> {
    /// Serve the leader and populate the store
    ///
    /// `leader` is taken as soon as the leader has its stream; if it is
    /// still present on error, nothing was handed out yet.
    async fn run(
        self,
        leader: &mut Option<oneshot::Sender<Result<ByteStream>>>,
    ) -> Result<Settled> {
        if let Some(stream) = self.store.get(&self.key).await? {
            self.stats.record_hit();
            if let Some(leader) = leader.take() {
                let _ = leader.send(Ok(stream));
            }
            return Ok(Settled::Hit);
        }

        self.stats.record_miss();
        let response = match self.gateway.fetch(&self.key).await {
            Ok(response) => response,
            Err(err) => {
                self.stats.record_failure();
                return Err(err);
            }
        };

        let (for_caller, for_store) = tee_with_capacity(response, self.tee_capacity);
        if let Some(leader) = leader.take() {
            if leader.send(Ok(for_caller.boxed())).is_err() {
                debug!("Caller for {} went away, caching in the background", self.key);
            }
        }

        match self.store.set(&self.key, for_store).await {
            Ok(written) => Ok(Settled::Stored(written)),
            Err(err) => {
                self.stats.record_failure();
                Err(err)
            }
        }
    }
}
