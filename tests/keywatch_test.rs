//! Key watcher verdicts and the Etag short-circuit.
//!
//! These tests need a local redis at redis://127.0.0.1:6379 and skip
//! themselves quietly when none is reachable.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use redis::AsyncCommands;

use common::{start_backend, start_proxy_with_kv, test_config};
use stevedore::keywatch::{KeyWatcher, WatchOutcome};
use stevedore::kvstore::KvStore;

const REDIS_URL: &str = "redis://127.0.0.1:6379";

async fn connect() -> Option<(KvStore, redis::Client)> {
    match KvStore::connect(REDIS_URL).await {
        Ok(connected) => Some(connected),
        Err(_) => {
            eprintln!("skipping: no redis at {}", REDIS_URL);
            None
        }
    }
}

async fn set_key(key: &str, value: &str) {
    let client = redis::Client::open(REDIS_URL).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = conn.set(key, value).await.unwrap();
}

#[tokio::test]
async fn watch_key_verdicts() {
    let Some((kv, client)) = connect().await else {
        return;
    };
    let watcher = Arc::new(KeyWatcher::new(kv, client, "stevedore-test:"));

    // AlreadyChanged: stored value differs from the expected one at entry.
    set_key("stevedore-test:w1", "new-value").await;
    let outcome = watcher
        .watch_key("stevedore-test:w1", "old-value", Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::AlreadyChanged);

    // Timeout: value matches and nothing happens.
    set_key("stevedore-test:w2", "same").await;
    let outcome = watcher
        .watch_key("stevedore-test:w2", "same", Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(outcome, WatchOutcome::Timeout);

    // SeenChange: a notification fires after the value moved.
    set_key("stevedore-test:w3", "same").await;
    let watching = {
        let watcher = watcher.clone();
        tokio::spawn(async move {
            watcher
                .watch_key("stevedore-test:w3", "same", Duration::from_secs(5))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(watcher.subscriber_count(), 1);
    set_key("stevedore-test:w3", "changed").await;
    watcher.notify("stevedore-test:w3").await;
    assert_eq!(watching.await.unwrap(), WatchOutcome::SeenChange);

    // NoChange: a notification fires but the value still matches.
    set_key("stevedore-test:w4", "same").await;
    let watching = {
        let watcher = watcher.clone();
        tokio::spawn(async move {
            watcher
                .watch_key("stevedore-test:w4", "same", Duration::from_secs(5))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    watcher.notify("stevedore-test:w4").await;
    assert_eq!(watching.await.unwrap(), WatchOutcome::NoChange);

    // Watchers deregistered on return.
    assert_eq!(watcher.subscriber_count(), 0);
}

#[tokio::test]
async fn coalesced_waiters_all_wake_once() {
    let Some((kv, client)) = connect().await else {
        return;
    };
    let watcher = Arc::new(KeyWatcher::new(kv, client, "stevedore-test:"));

    set_key("stevedore-test:co", "v0").await;

    let mut waiters = Vec::new();
    for _ in 0..5 {
        let watcher = watcher.clone();
        waiters.push(tokio::spawn(async move {
            watcher
                .watch_key("stevedore-test:co", "v0", Duration::from_secs(5))
                .await
                .unwrap()
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(watcher.subscriber_count(), 5);

    set_key("stevedore-test:co", "v1").await;
    watcher.notify("stevedore-test:co").await;

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), WatchOutcome::SeenChange);
    }
    assert_eq!(watcher.subscriber_count(), 0);
}

#[tokio::test]
async fn etag_hit_short_circuits_the_backend() {
    let Some(kv) = connect().await else {
        return;
    };

    let hits = Arc::new(AtomicU32::new(0));
    let backend_hits = hits.clone();
    let backend = start_backend(Router::new().route(
        "/api/v4/polled",
        get(move || {
            let hits = backend_hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "fresh"
            }
        }),
    ))
    .await;

    set_key("etag:/api/v4/polled", "etag-x").await;
    let proxy = start_proxy_with_kv(test_config(backend), Some(kv)).await;

    let client = reqwest::Client::new();

    // Matching quoted-weak If-None-Match: 304 from the proxy alone.
    let response = client
        .get(format!("http://{}/api/v4/polled", proxy))
        .header("If-None-Match", "W/\"etag-x\"")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 304);
    assert_eq!(
        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok()),
        Some("W/\"etag-x\"")
    );
    assert_eq!(
        response
            .headers()
            .get("x-stevedore-from-cache")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0, "backend must not be hit");

    // A mismatch forwards to the backend.
    let response = client
        .get(format!("http://{}/api/v4/polled", proxy))
        .header("If-None-Match", "W/\"stale\"")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // No If-None-Match at all forwards too.
    let response = client
        .get(format!("http://{}/api/v4/polled", proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
