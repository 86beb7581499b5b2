//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use bytes::Bytes;
use fetch_cid::{ByteStream, FetchError, Gateway, Result};
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Install a test-friendly subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fetch_cid=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// How the scripted gateway answers one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with these chunks
    Chunks(Vec<&'static str>),
    /// Fail before any body is sent
    Refuse,
    /// Send these chunks, then break the connection
    BreakAfter(Vec<&'static str>),
}

/// In-memory gateway answering from a script, counting requests per CID
pub struct ScriptedGateway {
    delay: Duration,
    default: Reply,
    script: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedGateway {
    /// Every CID answers `reply`
    pub fn always(reply: Reply) -> Self {
        Self {
            delay: Duration::ZERO,
            default: reply,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Wait this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue replies for `cid`, used in order before falling back to the default
    pub fn then(self, cid: &str, replies: Vec<Reply>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(cid.to_string(), replies);
        self
    }

    /// Requests seen for `cid`
    pub fn calls(&self, cid: &str) -> usize {
        self.calls.lock().unwrap().get(cid).copied().unwrap_or(0)
    }

    fn next_reply(&self, cid: &str) -> Reply {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(cid.to_string())
            .or_insert(0) += 1;

        let mut script = self.script.lock().unwrap();
        match script.get_mut(cid) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => self.default.clone(),
        }
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn fetch(&self, cid: &str) -> Result<ByteStream> {
        let reply = self.next_reply(cid);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let to_chunks = |parts: Vec<&'static str>| -> Vec<std::result::Result<Bytes, FetchError>> {
            parts.into_iter().map(|part| Ok(Bytes::from_static(part.as_bytes()))).collect()
        };

        match reply {
            Reply::Chunks(parts) => Ok(stream::iter(to_chunks(parts)).boxed()),
            Reply::Refuse => Err(FetchError::Status {
                status: 503,
                url: cid.to_string(),
            }),
            Reply::BreakAfter(parts) => {
                let mut items = to_chunks(parts);
                items.push(Err(FetchError::Other("connection reset".to_string())));
                Ok(stream::iter(items).boxed())
            }
        }
    }
}

/// Concatenate a stream, panicking on errors
pub async fn read_all(stream: ByteStream) -> Vec<u8> {
    let parts: Vec<_> = stream.collect().await;
    parts
        .into_iter()
        .flat_map(|part| part.expect("chunk").to_vec())
        .collect()
}

/// Wait until no fetch for `cid` is running
pub async fn wait_settled<G: Gateway>(fetcher: &fetch_cid::CidFetcher<G>, cid: &str) {
    for _ in 0..500 {
        if !fetcher.in_flight().contains(cid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("fetch for {cid} never settled");
}

async fn serve_block(
    State(hits): State<Arc<AtomicUsize>>,
    Path(cid): Path<String>,
) -> std::result::Result<String, StatusCode> {
    hits.fetch_add(1, Ordering::SeqCst);
    match cid.as_str() {
        "missing" => Err(StatusCode::NOT_FOUND),
        "large" => Ok("x".repeat(256 * 1024)),
        _ => Ok(format!("block {}", cid)),
    }
}

/// Serve `/ipfs/:cid` on an ephemeral port, counting requests
///
/// `missing` answers 404, `large` a 256 KiB body, anything else
/// `block <cid>`.
pub async fn start_test_gateway() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/ipfs/:cid", get(serve_block))
        .with_state(Arc::clone(&hits));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (addr, hits)
}
