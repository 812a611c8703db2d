//! Admission queue behavior through the HTTP surface.

mod common;

use std::time::{Duration, Instant};

use axum::routing::post;
use axum::Router;

use common::{start_backend, start_proxy, test_config};

#[tokio::test]
async fn queue_admits_queues_and_rejects() {
    // Backend is slow enough that the first request still holds the slot
    // while the other two arrive.
    let backend = start_backend(Router::new().route(
        "/api/v4/jobs/request",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            "job"
        }),
    ))
    .await;

    let mut config = test_config(backend);
    config.api_queue.limit = 1;
    config.api_queue.queue_limit = 1;
    config.api_queue.queue_timeout_secs = 5;
    let proxy = start_proxy(config).await;

    let client = reqwest::Client::new();
    let url = format!("http://{}/api/v4/jobs/request", proxy);

    let mut handles = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            // Stagger so request 0 certainly holds the slot first.
            tokio::time::sleep(Duration::from_millis(20 * i)).await;
            let started = Instant::now();
            let status = client.post(&url).send().await.unwrap().status().as_u16();
            (status, started.elapsed())
        }));
    }

    let mut statuses = Vec::new();
    for handle in handles {
        let (status, elapsed) = handle.await.unwrap();
        if status == 503 {
            // The rejection must be immediate, not a queue-timeout later.
            assert!(elapsed < Duration::from_millis(150), "503 took {:?}", elapsed);
        }
        statuses.push(status);
    }
    statuses.sort_unstable();

    assert_eq!(statuses, vec![200, 200, 503]);
}

#[tokio::test]
async fn queue_timeout_rejects_waiters() {
    let backend = start_backend(Router::new().route(
        "/api/v4/jobs/request",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            "job"
        }),
    ))
    .await;

    let mut config = test_config(backend);
    config.api_queue.limit = 1;
    config.api_queue.queue_limit = 2;
    config.api_queue.queue_timeout_secs = 1;
    let proxy = start_proxy(config).await;

    let client = reqwest::Client::new();
    let url = format!("http://{}/api/v4/jobs/request", proxy);

    let holder = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move { client.post(&url).send().await.unwrap().status().as_u16() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // This waiter outlives the holder's 500 ms, so it gets a slot.
    let status = client.post(&url).send().await.unwrap().status().as_u16();
    assert_eq!(status, 200);
    assert_eq!(holder.await.unwrap(), 200);
}
