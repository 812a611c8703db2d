//! Shared helpers for integration tests: mock backends and a proxy
//! instance wired to them.
#![allow(dead_code)]

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response};
use axum::Router;
use tokio::net::TcpListener;

use stevedore::config::ProxyConfig;
use stevedore::HttpServer;

pub const CAPABILITY_CONTENT_TYPE: &str = "application/vnd.stevedore+json";

/// Serve an axum router on an ephemeral port, returning its address.
pub async fn start_backend(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

/// A capability response as the backend would send it.
pub fn capability_response(json: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(json.to_string()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(CAPABILITY_CONTENT_TYPE),
    );
    response
}

/// Test configuration pointing at the given backend.
pub fn test_config(backend: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::development();
    config.backend = format!("http://{}", backend);
    config.backend_name = "test backend".to_string();
    config.development_mode = false;
    config
}

/// Start the proxy against `config`; returns its address.
pub async fn start_proxy(config: ProxyConfig) -> SocketAddr {
    start_proxy_with_kv(config, None).await
}

/// Start the proxy with an optional shared key-value store attached.
pub async fn start_proxy_with_kv(
    config: ProxyConfig,
    kv: Option<(stevedore::kvstore::KvStore, redis::Client)>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(config, b"test-secret-key-32-bytes-long!!!".to_vec(), kv)
        .expect("build proxy");

    tokio::spawn(async move {
        server.run(listener).await.unwrap();
    });

    // Give the accept loop a beat.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    addr
}

/// Start a proxy in front of a freshly started backend router.
pub async fn start_proxy_for(router: Router) -> (SocketAddr, SocketAddr) {
    let backend = start_backend(router).await;
    let proxy = start_proxy(test_config(backend)).await;
    (proxy, backend)
}
