//! Server assembly.
//!
//! # Responsibilities
//! - Build the shared clients (backend round-tripper, object-store client)
//! - Assemble the ordered routing table
//! - Wire the axum catch-all dispatcher with the Etag and trace layers
//! - Serve with graceful shutdown
//!
//! Specialized handlers come first; the senddata-wrapped fallback proxy
//! takes whatever is left.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, Response, StatusCode};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::api::ApiClient;
use crate::artifacts::{ArtifactsProcessor, SendEntry};
use crate::badgateway::RoundTripper;
use crate::builds;
use crate::channel;
use crate::config::ProxyConfig;
use crate::etagcache::{self, EtagCache};
use crate::git;
use crate::helper;
use crate::keywatch::KeyWatcher;
use crate::kvstore::KvStore;
use crate::lfs;
use crate::lifecycle;
use crate::observability::metrics;
use crate::proxy::Proxy;
use crate::queueing::{queue_requests, Queue};
use crate::routing::{route, router::is_content_type, ws_route, Handler, RouteTable};
use crate::senddata::{send_data, sendurl::SendUrl, Injector};
use crate::upload::{self, FieldFilter};

const GIT_PROJECT_PATTERN: &str = r"^/([^/]+/){1,}[^/]+\.git/";
const PROJECT_PATTERN: &str = r"^/([^/]+/){1,}[^/]+/";
const API_PATTERN: &str = r"^/api/";

/// Everything the dispatcher needs per request.
#[derive(Clone)]
struct DispatchState {
    table: Arc<RouteTable>,
}

/// The assembled proxy server.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    watcher: Option<Arc<KeyWatcher>>,
}

impl HttpServer {
    pub fn new(
        config: ProxyConfig,
        secret: Vec<u8>,
        kv: Option<(KvStore, redis::Client)>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let backend = url::Url::parse(&config.backend)?;

        let round_tripper = RoundTripper::new(
            &backend,
            config.backend_socket.as_deref(),
            &config.backend_name,
            config.development_mode,
        );

        let api = Arc::new(ApiClient::new(
            round_tripper.clone(),
            &config.version_string,
            &secret,
        ));

        let (kv, watcher) = match kv {
            Some((kv, client)) => {
                let watcher = Arc::new(KeyWatcher::new(
                    kv.clone(),
                    client,
                    &config.redis.watch_prefix,
                ));
                (Some(kv), Some(watcher))
            }
            None => (None, None),
        };

        let table = Arc::new(RouteTable::new(
            build_routes(&config, api, round_tripper, watcher.clone()),
            &config.url_prefix,
        ));

        let state = DispatchState { table };
        let etag_state = kv.map(EtagCache::new);

        let router = Router::new()
            .route("/{*path}", any(dispatch))
            .route("/", any(dispatch))
            .with_state(state)
            .layer(axum::middleware::from_fn_with_state(
                etag_state,
                etagcache::cache,
            ))
            .layer(TraceLayer::new_for_http());

        Ok(Self {
            router,
            config,
            watcher,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve until shutdown. The pub/sub listener lives exactly as long
    /// as the accept loop: its stop channel is signalled when serving
    /// ends, however serving ends.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, backend = %self.config.backend, "stevedore listening");

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        if let Some(watcher) = self.watcher.clone() {
            tokio::spawn(async move {
                watcher.run(stop_rx).await;
            });
        }

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(lifecycle::shutdown_signal())
            .await;

        let _ = stop_tx.send(true);
        served?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Catch-all axum handler: route-table dispatch with WebSocket gating.
async fn dispatch(State(state): State<DispatchState>, req: Request<Body>) -> Response<Body> {
    let started = Instant::now();
    let method = req.method().as_str().to_string();

    let Some(entry) = state.table.match_route(&req) else {
        // The table ends in a catch-all; reaching this means the table
        // was assembled without one.
        return helper::plain_response(StatusCode::NOT_FOUND, "Not Found");
    };

    // Disallow upgrades on plain routes: a hijacked connection would
    // bypass every layer below.
    if !entry.is_websocket() && helper::is_websocket_upgrade(req.headers()) {
        return helper::plain_response(StatusCode::BAD_REQUEST, "websocket upgrade not allowed");
    }

    let pattern = entry.pattern();
    let response = (entry.handler)(req).await;
    metrics::record_request(&method, response.status().as_u16(), pattern, started);
    response
}

/// The ordered routing table, most specific first.
fn build_routes(
    config: &ProxyConfig,
    api: Arc<ApiClient>,
    round_tripper: RoundTripper,
    watcher: Option<Arc<KeyWatcher>>,
) -> Vec<crate::routing::RouteEntry> {
    let proxy = Arc::new(Proxy::new(round_tripper, &config.version_string)).handler();

    let injectors: Vec<Arc<dyn Injector>> = vec![
        Arc::new(git::SendArchive),
        Arc::new(git::SendBlob),
        Arc::new(git::SendDiff),
        Arc::new(git::SendPatch),
        Arc::new(git::SendCommit),
        Arc::new(git::SendSnapshot),
        Arc::new(SendEntry),
        Arc::new(SendUrl::new()),
    ];
    let senddata_proxy: Handler = send_data(&config.senddata.header, injectors, proxy);

    // Object-store transfers share one client.
    let store_client = reqwest::Client::new();

    // Admission control + long polling for the CI job-request endpoint.
    let job_request: Handler = {
        let queued = if config.api_queue.limit > 0 {
            let queue = Arc::new(Queue::new(
                "ci_api_job_requests",
                config.api_queue.limit,
                config.api_queue.queue_limit,
                Duration::from_secs(config.api_queue.queue_timeout_secs),
            ));
            queue_requests(queue, senddata_proxy.clone())
        } else {
            senddata_proxy.clone()
        };
        builds::register_handler(
            queued,
            watcher,
            Duration::from_secs(config.api_queue.long_poll_timeout_secs),
        )
    };

    vec![
        // Git clone/fetch/push over smart HTTP
        route(
            Some(Method::GET),
            constcat(GIT_PROJECT_PATTERN, r"info/refs\z"),
            git::get_info_refs(api.clone()),
        ),
        route(
            Some(Method::POST),
            constcat(GIT_PROJECT_PATTERN, r"git-upload-pack\z"),
            git::upload_pack(api.clone()),
        )
        .with_matcher(is_content_type("application/x-git-upload-pack-request")),
        route(
            Some(Method::POST),
            constcat(GIT_PROJECT_PATTERN, r"git-receive-pack\z"),
            git::receive_pack(api.clone()),
        )
        .with_matcher(is_content_type("application/x-git-receive-pack-request")),
        // LFS object storage
        route(
            Some(Method::PUT),
            constcat(
                GIT_PROJECT_PATTERN,
                r"stevedore-lfs/objects/([0-9a-f]{64})/([0-9]+)\z",
            ),
            lfs::put_store(api.clone(), senddata_proxy.clone(), store_client.clone()),
        )
        .with_matcher(is_content_type("application/octet-stream")),
        // CI artifacts
        route(
            Some(Method::POST),
            r"^/api/v4/jobs/[0-9]+/artifacts\z",
            upload::accelerate(api.clone(), store_client.clone(), senddata_proxy.clone(), || {
                Box::new(ArtifactsProcessor::new())
            }),
        ),
        // CI raw trace
        route(
            Some(Method::GET),
            r"^/api/v4/jobs/[0-9]+/trace_raw\z",
            builds::raw_trace(api.clone()),
        ),
        // Terminal websockets
        ws_route(
            constcat(PROJECT_PATTERN, r"environments/[0-9]+/terminal.ws\z"),
            channel::handler(api.clone()),
        ),
        ws_route(
            constcat(PROJECT_PATTERN, r"-/jobs/[0-9]+/terminal.ws\z"),
            channel::handler(api.clone()),
        ),
        // Long poll + limit capacity given to job requests
        route(None, r"^/api/v4/jobs/request\z", job_request),
        // Explicitly proxy remaining API requests
        route(None, API_PATTERN, senddata_proxy.clone()),
        // User uploads
        route(
            Some(Method::POST),
            constcat(PROJECT_PATTERN, r"uploads\z"),
            upload::accelerate(api, store_client, senddata_proxy.clone(), || {
                Box::new(FieldFilter::new("uploads"))
            }),
        ),
        // Everything else streams to the backend
        route(None, "", senddata_proxy),
    ]
}

/// Join two pattern literals into a leaked static string. Route patterns
/// double as metrics labels, which want `&'static str`.
fn constcat(a: &str, b: &str) -> &'static str {
    Box::leak(format!("{}{}", a, b).into_boxed_str())
}
