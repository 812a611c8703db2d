//! Upload pipeline end to end: multipart rewriting, dual-write to the
//! object store, multipart object-store uploads, cleanup calls.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::HeaderMap;
use axum::routing::{any, delete, post, put};
use axum::Json;
use axum::Router;

use common::{capability_response, start_backend, start_proxy, test_config};

/// Echo backend: authorizes uploads with the given capability and echoes
/// the rewritten form back as JSON.
fn upload_backend(capability: serde_json::Value) -> Router {
    Router::new()
        .route(
            "/g/p/uploads/authorize",
            post(move || {
                let capability = capability.clone();
                async move { capability_response(capability) }
            }),
        )
        .route(
            "/g/p/uploads",
            post(|headers: HeaderMap, body: Bytes| async move {
                let content_type = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let boundary = multer::parse_boundary(&content_type).unwrap();
                let stream =
                    futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) });
                let mut form = multer::Multipart::new(stream, boundary);

                let mut fields = serde_json::Map::new();
                while let Some(field) = form.next_field().await.unwrap() {
                    let name = field.name().unwrap().to_string();
                    fields.insert(name, field.text().await.unwrap().into());
                }
                Json(serde_json::Value::Object(fields))
            }),
        )
}

async fn post_upload(proxy: SocketAddr, file_bytes: &'static [u8]) -> serde_json::Value {
    let client = reqwest::Client::new();
    let form = reqwest::multipart::Form::new().text("token", "abc").part(
        "upload",
        reqwest::multipart::Part::bytes(file_bytes).file_name("hello.txt"),
    );

    let response = client
        .post(format!("http://{}/g/p/uploads", proxy))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "upload should succeed");
    response.json().await.unwrap()
}

#[tokio::test]
async fn local_only_upload_rewrites_file_parts() {
    let tmp = tempfile::tempdir().unwrap();
    let temp_path = tmp.path().to_string_lossy().into_owned();

    let backend =
        start_backend(upload_backend(serde_json::json!({ "TempPath": temp_path }))).await;
    let proxy = start_proxy(test_config(backend)).await;

    let fields = post_upload(proxy, b"hello").await;

    assert_eq!(fields["token"], "abc");
    assert_eq!(fields["upload.name"], "hello.txt");
    assert_eq!(fields["upload.size"], "5");
    assert_eq!(fields["upload.md5"], "5d41402abc4b2a76b9719d911017c592");
    assert_eq!(
        fields["upload.sha256"],
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );

    // The temp file lives under TempPath while the backend handles the
    // request (it was read by the echo handler before responding).
    let path = fields["upload.path"].as_str().unwrap();
    assert!(path.starts_with(tmp.path().to_str().unwrap()));
    assert!(path.ends_with("/hello.txt"));

    // After the response is done the cleanup chain removes it.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!std::path::Path::new(path).exists());
}

#[derive(Clone, Default)]
struct StoreState {
    puts: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    deletes: Arc<Mutex<Vec<String>>>,
    completes: Arc<Mutex<Vec<String>>>,
}

/// A presigned-URL object store stub.
fn object_store(state: StoreState) -> Router {
    Router::new()
        .route(
            "/store/{name}",
            put(
                |State(state): State<StoreState>, AxumPath(name): AxumPath<String>, body: Bytes| async move {
                    state.puts.lock().unwrap().push((name, body.to_vec()));
                    let n = state.puts.lock().unwrap().len();
                    axum::http::Response::builder()
                        .header("ETag", format!("\"etag-{}\"", n))
                        .body(axum::body::Body::empty())
                        .unwrap()
                },
            ),
        )
        .route(
            "/delete/{name}",
            delete(
                |State(state): State<StoreState>, AxumPath(name): AxumPath<String>| async move {
                    state.deletes.lock().unwrap().push(name);
                    "deleted"
                },
            ),
        )
        .route(
            "/complete/{name}",
            any(
                |State(state): State<StoreState>, body: String| async move {
                    state.completes.lock().unwrap().push(body);
                    "completed"
                },
            ),
        )
        .with_state(state)
}

#[tokio::test]
async fn remote_only_upload_puts_once_and_deletes_after() {
    let store_state = StoreState::default();
    let store = start_backend(object_store(store_state.clone())).await;

    let capability = serde_json::json!({
        "RemoteObject": {
            "ID": "obj-1",
            "GetURL": format!("http://{}/get/obj-1", store),
            "StoreURL": format!("http://{}/store/obj-1", store),
            "DeleteURL": format!("http://{}/delete/obj-1", store),
            "Timeout": 10
        }
    });
    let backend = start_backend(upload_backend(capability)).await;
    let proxy = start_proxy(test_config(backend)).await;

    let fields = post_upload(proxy, b"xyz").await;

    assert_eq!(fields["upload.remote_id"], "obj-1");
    assert_eq!(
        fields["upload.remote_url"],
        format!("http://{}/get/obj-1", store)
    );
    assert_eq!(fields["upload.size"], "3");
    assert!(fields.get("upload.path").is_none(), "no local copy expected");

    // Exactly one PUT with the full content.
    let puts = store_state.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].1, b"xyz");

    // The delete fires once the response has been delivered.
    for _ in 0..50 {
        if !store_state.deletes.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(store_state.deletes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn multipart_upload_sends_parts_in_order_and_completes() {
    let store_state = StoreState::default();
    let store = start_backend(object_store(store_state.clone())).await;

    let capability = serde_json::json!({
        "RemoteObject": {
            "ID": "obj-2",
            "GetURL": format!("http://{}/get/obj-2", store),
            "DeleteURL": format!("http://{}/delete/obj-2", store),
            "Timeout": 10,
            "MultipartUpload": {
                "PartSize": 5,
                "PartURLs": [
                    format!("http://{}/store/part1", store),
                    format!("http://{}/store/part2", store)
                ],
                "CompleteURL": format!("http://{}/complete/obj-2", store),
                "AbortURL": format!("http://{}/delete/abort-obj-2", store)
            }
        }
    });
    let backend = start_backend(upload_backend(capability)).await;
    let proxy = start_proxy(test_config(backend)).await;

    let fields = post_upload(proxy, b"abcdefgh").await;
    assert_eq!(fields["upload.size"], "8");

    let puts = store_state.puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 2, "8 bytes at part size 5 is two parts");
    assert_eq!(puts[0], ("part1".to_string(), b"abcde".to_vec()));
    assert_eq!(puts[1], ("part2".to_string(), b"fgh".to_vec()));

    let completes = store_state.completes.lock().unwrap().clone();
    assert_eq!(completes.len(), 1);
    assert_eq!(
        completes[0],
        "<CompleteMultipartUpload>\
         <Part><PartNumber>1</PartNumber><ETag>etag-1</ETag></Part>\
         <Part><PartNumber>2</PartNumber><ETag>etag-2</ETag></Part>\
         </CompleteMultipartUpload>"
    );
}

#[tokio::test]
async fn artifacts_route_rejects_files_outside_the_file_field() {
    let tmp = tempfile::tempdir().unwrap();
    let temp_path = tmp.path().to_string_lossy().into_owned();

    let backend = start_backend(
        Router::new()
            .route(
                "/api/v4/jobs/7/artifacts/authorize",
                post(move || {
                    let capability = serde_json::json!({ "TempPath": temp_path.clone() });
                    async move { capability_response(capability) }
                }),
            )
            .route("/api/v4/jobs/7/artifacts", post(|| async { "stored" })),
    )
    .await;
    let proxy = start_proxy(test_config(backend)).await;

    let client = reqwest::Client::new();
    let form = reqwest::multipart::Form::new().part(
        "wrong_field",
        reqwest::multipart::Part::bytes(&b"zipzip"[..]).file_name("a.zip"),
    );
    let response = client
        .post(format!("http://{}/api/v4/jobs/7/artifacts", proxy))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(&b"zipzip"[..]).file_name("a.zip"),
    );
    let response = client
        .post(format!("http://{}/api/v4/jobs/7/artifacts", proxy))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "stored");
}

#[tokio::test]
async fn illegal_filename_fails_the_upload() {
    let tmp = tempfile::tempdir().unwrap();
    let temp_path = tmp.path().to_string_lossy().into_owned();

    let backend =
        start_backend(upload_backend(serde_json::json!({ "TempPath": temp_path }))).await;
    let proxy = start_proxy(test_config(backend)).await;

    let client = reqwest::Client::new();
    let form = reqwest::multipart::Form::new().part(
        "upload",
        reqwest::multipart::Part::bytes(&b"x"[..]).file_name(".."),
    );
    let response = client
        .post(format!("http://{}/g/p/uploads", proxy))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}

/// Non-multipart POST bodies on accelerated routes proxy through intact.
#[tokio::test]
async fn non_multipart_bodies_are_not_rewritten() {
    let tmp = tempfile::tempdir().unwrap();
    let temp_path = tmp.path().to_string_lossy().into_owned();

    let backend = start_backend(
        Router::new()
            .route(
                "/g/p/uploads/authorize",
                post(move || {
                    let capability = serde_json::json!({ "TempPath": temp_path.clone() });
                    async move { capability_response(capability) }
                }),
            )
            .route(
                "/g/p/uploads",
                post(|body: String| async move { format!("got:{}", body) }),
            ),
    )
    .await;
    let proxy = start_proxy(test_config(backend)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/g/p/uploads", proxy))
        .header("Content-Type", "application/json")
        .body("{\"a\":1}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "got:{\"a\":1}");
}
