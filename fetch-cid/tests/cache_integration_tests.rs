//! Integration tests for the memoizing fetcher
//!
//! These tests verify the complete fetch path including:
//! - Miss-then-hit memoization
//! - Coalescing of concurrent requests
//! - Failure isolation and retry
//! - Slow and vanished consumers of a duplicated response
//! - File handle release on the hit path

mod common;

use common::{init_tracing, read_all, wait_settled, Reply, ScriptedGateway};
use fetch_cid::{CacheConfig, CidFetcher, FetchError, InFlightTable};
use futures::future::join_all;
use futures::StreamExt;
use std::time::Duration;
use tempfile::TempDir;

fn fetcher(dir: &TempDir, gateway: ScriptedGateway) -> CidFetcher<ScriptedGateway> {
    init_tracing();
    CidFetcher::new(gateway, CacheConfig::new(dir.path().join("cache"))).unwrap()
}

#[tokio::test]
async fn test_miss_then_hit() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["hello ", "ipfs"]));
    let fetcher = fetcher(&dir, gateway);

    let first = read_all(fetcher.fetch("bafyA").await.unwrap()).await;
    assert_eq!(first, b"hello ipfs");
    assert_eq!(fetcher.gateway().calls("bafyA"), 1);

    wait_settled(&fetcher, "bafyA").await;
    let second = read_all(fetcher.fetch("bafyA").await.unwrap()).await;
    assert_eq!(second, first);
    assert_eq!(fetcher.gateway().calls("bafyA"), 1);

    let stats = fetcher.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_hit_survives_new_fetcher() {
    let dir = TempDir::new().unwrap();

    {
        let gateway = ScriptedGateway::always(Reply::Chunks(vec!["persisted"]));
        let fetcher = fetcher(&dir, gateway);
        read_all(fetcher.fetch("bafyP").await.unwrap()).await;
        wait_settled(&fetcher, "bafyP").await;
    }

    let gateway = ScriptedGateway::always(Reply::Refuse);
    let fetcher = fetcher(&dir, gateway);
    let content = read_all(fetcher.fetch("bafyP").await.unwrap()).await;
    assert_eq!(content, b"persisted");
    assert_eq!(fetcher.gateway().calls("bafyP"), 0);
}

#[tokio::test]
async fn test_concurrent_fetches_coalesce() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["one ", "two ", "three"]))
        .with_delay(Duration::from_millis(50));
    let fetcher = fetcher(&dir, gateway);

    let streams = join_all((0..8).map(|_| fetcher.fetch("bafyC"))).await;
    assert_eq!(fetcher.gateway().calls("bafyC"), 1);

    let bodies = join_all(streams.into_iter().map(|stream| read_all(stream.unwrap()))).await;
    for body in bodies {
        assert_eq!(body, b"one two three");
    }
    assert_eq!(fetcher.stats().coalesced, 7);
}

#[tokio::test]
async fn test_coalesced_fetches_resolve_before_any_read() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["x"; 40]))
        .with_delay(Duration::from_millis(20));
    let fetcher = fetcher(&dir, gateway);

    // Body is longer than the default tee capacity; nobody reads until
    // every call has returned its stream
    let streams = tokio::time::timeout(
        Duration::from_secs(5),
        join_all((0..3).map(|_| fetcher.fetch("bafyBig"))),
    )
    .await
    .expect("coalesced fetch calls should return without the leader reading");

    let bodies = tokio::time::timeout(
        Duration::from_secs(5),
        join_all(streams.into_iter().map(|stream| read_all(stream.unwrap()))),
    )
    .await
    .expect("all streams should drain");

    for body in bodies {
        assert_eq!(body, "x".repeat(40).as_bytes());
    }
    assert_eq!(fetcher.gateway().calls("bafyBig"), 1);
    assert_eq!(fetcher.stats().coalesced, 2);
}

#[tokio::test]
async fn test_independent_keys_fetch_independently() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["shared body"]))
        .with_delay(Duration::from_millis(20));
    let fetcher = fetcher(&dir, gateway);

    let (a, b) = tokio::join!(fetcher.fetch("bafyA"), fetcher.fetch("bafyB"));
    assert_eq!(read_all(a.unwrap()).await, b"shared body");
    assert_eq!(read_all(b.unwrap()).await, b"shared body");

    assert_eq!(fetcher.gateway().calls("bafyA"), 1);
    assert_eq!(fetcher.gateway().calls("bafyB"), 1);
    assert_eq!(fetcher.stats().coalesced, 0);
}

#[tokio::test]
async fn test_refused_fetch_is_retried() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["second try"]))
        .then("bafyK", vec![Reply::Refuse]);
    let fetcher = fetcher(&dir, gateway);

    let err = fetcher.fetch("bafyK").await.err().unwrap();
    assert!(matches!(err, FetchError::Status { status: 503, .. }));
    assert!(!fetcher.store().has("bafyK").await.unwrap());

    let content = read_all(fetcher.fetch("bafyK").await.unwrap()).await;
    assert_eq!(content, b"second try");
    assert_eq!(fetcher.gateway().calls("bafyK"), 2);
}

#[tokio::test]
async fn test_refusal_reaches_every_waiter() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Refuse).with_delay(Duration::from_millis(30));
    let fetcher = fetcher(&dir, gateway);

    let mut results = join_all((0..4).map(|_| fetcher.fetch("bafyR"))).await;
    assert_eq!(fetcher.gateway().calls("bafyR"), 1);

    // The caller that started the fetch gets the error directly
    let leader = results.remove(0);
    assert!(matches!(leader, Err(FetchError::Status { status: 503, .. })));

    // Joined callers see it as the only item of their stream
    for result in results {
        let items: Vec<_> = result.unwrap().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(FetchError::Status { status: 503, .. })));
    }
    assert!(!fetcher.store().has("bafyR").await.unwrap());
}

#[tokio::test]
async fn test_broken_response_leaves_no_entry() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["complete"]))
        .then("bafyX", vec![Reply::BreakAfter(vec!["trunc"])]);
    let fetcher = fetcher(&dir, gateway);

    let parts: Vec<_> = fetcher.fetch("bafyX").await.unwrap().collect().await;
    assert_eq!(parts.len(), 2);
    assert!(parts[0].is_ok());
    assert!(parts[1].is_err());

    wait_settled(&fetcher, "bafyX").await;
    assert!(!fetcher.store().has("bafyX").await.unwrap());

    let content = read_all(fetcher.fetch("bafyX").await.unwrap()).await;
    assert_eq!(content, b"complete");
    assert_eq!(fetcher.gateway().calls("bafyX"), 2);
}

#[tokio::test]
async fn test_slow_caller_and_cache_see_same_bytes() {
    let dir = TempDir::new().unwrap();
    let parts = vec!["0123456789"; 40];
    let gateway = ScriptedGateway::always(Reply::Chunks(parts));
    init_tracing();
    let config = CacheConfig::builder()
        .cache_dir(dir.path())
        .tee_capacity(2)
        .build()
        .unwrap();
    let fetcher = CidFetcher::new(gateway, config).unwrap();

    let mut stream = fetcher.fetch("bafyS").await.unwrap();
    let mut seen = Vec::new();
    while let Some(chunk) = stream.next().await {
        seen.extend_from_slice(&chunk.unwrap());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(seen.len(), 400);

    wait_settled(&fetcher, "bafyS").await;
    let cached = read_all(fetcher.store().get("bafyS").await.unwrap().unwrap()).await;
    assert_eq!(cached, seen);
}

#[tokio::test]
async fn test_dropped_caller_stream_still_caches() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["a", "b", "c"]));
    let fetcher = fetcher(&dir, gateway);

    drop(fetcher.fetch("bafyD").await.unwrap());

    wait_settled(&fetcher, "bafyD").await;
    let cached = read_all(fetcher.store().get("bafyD").await.unwrap().unwrap()).await;
    assert_eq!(cached, b"abc");
}

#[tokio::test]
async fn test_hit_stream_releases_file() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["handle"]));
    let fetcher = fetcher(&dir, gateway);

    read_all(fetcher.fetch("bafyH").await.unwrap()).await;
    wait_settled(&fetcher, "bafyH").await;

    // Cancelled hit
    let stream = fetcher.fetch("bafyH").await.unwrap();
    drop(stream);
    fetcher.store().delete("bafyH").await.unwrap();

    // Drained hit
    read_all(fetcher.fetch("bafyH").await.unwrap()).await;
    wait_settled(&fetcher, "bafyH").await;
    read_all(fetcher.fetch("bafyH").await.unwrap()).await;
    fetcher.store().delete("bafyH").await.unwrap();

    assert_eq!(fetcher.gateway().calls("bafyH"), 2);
}

#[tokio::test]
async fn test_shared_in_flight_table_coalesces_across_fetchers() {
    let dir = TempDir::new().unwrap();
    let table = InFlightTable::new();

    let slow = ScriptedGateway::always(Reply::Chunks(vec!["from first"]))
        .with_delay(Duration::from_millis(50));
    let first = fetcher(&dir, slow).with_in_flight(table.clone());
    let second = fetcher(&dir, ScriptedGateway::always(Reply::Refuse)).with_in_flight(table);

    let (a, b) = tokio::join!(first.fetch("bafyT"), second.fetch("bafyT"));
    assert_eq!(read_all(a.unwrap()).await, b"from first");
    assert_eq!(read_all(b.unwrap()).await, b"from first");
    assert_eq!(second.gateway().calls("bafyT"), 0);
}

#[tokio::test]
async fn test_separator_keys_stay_in_cache_dir() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::always(Reply::Chunks(vec!["nested"]));
    let fetcher = fetcher(&dir, gateway);

    read_all(fetcher.fetch("bafyDir/sub/file.txt").await.unwrap()).await;
    wait_settled(&fetcher, "bafyDir/sub/file.txt").await;

    let path = fetcher.store().key_path("bafyDir/sub/file.txt").unwrap();
    assert_eq!(path.parent(), Some(fetcher.store().base_dir()));
    assert!(path.is_file());
}
