//! Senddata dispatch through the full proxy: sentinel recognition,
//! send-url injection, header stripping.

mod common;

use axum::body::Body;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use base64::Engine;

use common::{start_backend, start_proxy, test_config};

fn sentinel(prefix: &str, params: serde_json::Value) -> String {
    format!(
        "{}:{}",
        prefix,
        base64::engine::general_purpose::URL_SAFE.encode(params.to_string())
    )
}

#[tokio::test]
async fn send_url_substitutes_the_backend_body() {
    // A file server the backend delegates to.
    let file_server = start_backend(Router::new().route(
        "/artifact.bin",
        get(|headers: HeaderMap| async move {
            let range = headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            format!("file-content range={}", range)
        }),
    ))
    .await;

    let value = sentinel(
        "send-url",
        serde_json::json!({
            "URL": format!("http://{}/artifact.bin", file_server),
            "AllowRedirects": false
        }),
    );

    let backend = start_backend(Router::new().route(
        "/api/v4/file",
        get(move || {
            let value = value.clone();
            async move {
                axum::http::Response::builder()
                    .header("Stevedore-Send-Data", value)
                    .body(Body::from("backend body, must not be seen"))
                    .unwrap()
            }
        }),
    ))
    .await;
    let proxy = start_proxy(test_config(backend)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/v4/file", proxy))
        .header("Range", "bytes=0-4")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(
        response.headers().get("stevedore-send-data").is_none(),
        "sentinel header must be stripped"
    );
    // The range header was forwarded to the target.
    assert_eq!(
        response.text().await.unwrap(),
        "file-content range=bytes=0-4"
    );
}

#[tokio::test]
async fn unknown_prefixes_fall_through_untouched() {
    let backend = start_backend(Router::new().route(
        "/api/v4/other",
        get(|| async {
            axum::http::Response::builder()
                .header("Stevedore-Send-Data", "mystery:abcd")
                .body(Body::from("backend body"))
                .unwrap()
        }),
    ))
    .await;
    let proxy = start_proxy(test_config(backend)).await;

    let response = reqwest::get(format!("http://{}/api/v4/other", proxy))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "backend body");
}
