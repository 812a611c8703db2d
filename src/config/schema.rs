//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for stevedore.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address for the proxy listener (e.g. "127.0.0.1:8181").
    pub listen_addr: String,

    /// Base URL of the single application backend. Must be plain http;
    /// TLS towards the backend is a configuration error.
    pub backend: String,

    /// Optional unix socket path; when set, all backend connections dial
    /// this socket instead of the TCP address in `backend`.
    pub backend_socket: Option<String>,

    /// Human-readable backend name, used in the production 502 body.
    pub backend_name: String,

    /// Relative URL root the routing table strips before matching.
    pub url_prefix: String,

    /// Development mode: raw error text in 502 bodies instead of the
    /// canned message.
    pub development_mode: bool,

    /// Version string sent to the backend in the `Stevedore` header.
    pub version_string: String,

    /// Path to the base64-encoded HS256 secret shared with the backend.
    pub secret_path: String,

    pub redis: RedisConfig,
    pub api_queue: ApiQueueConfig,
    pub senddata: SendDataConfig,
    pub metrics: MetricsConfig,
}

/// Shared key-value store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL; empty disables the key watcher and the Etag
    /// short-circuit.
    pub url: String,

    /// Key prefix watched for keyspace notifications.
    pub watch_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            watch_prefix: "runner:build_queue:".to_string(),
        }
    }
}

/// Admission control for the slow job-request endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiQueueConfig {
    /// Concurrent request capacity. 0 disables queueing entirely.
    pub limit: u32,

    /// How many requests may wait for a slot before 503s start.
    pub queue_limit: u32,

    /// How long a queued request waits before giving up.
    pub queue_timeout_secs: u64,

    /// Long-poll duration for the CI build-queue watch. 0 disables
    /// long polling.
    pub long_poll_timeout_secs: u64,
}

impl Default for ApiQueueConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            queue_limit: 0,
            queue_timeout_secs: 30,
            long_poll_timeout_secs: 0,
        }
    }
}

/// Senddata dispatcher settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SendDataConfig {
    /// Response header the backend uses to delegate body generation.
    pub header: String,
}

impl Default for SendDataConfig {
    fn default() -> Self {
        Self {
            header: "Stevedore-Send-Data".to_string(),
        }
    }
}

/// Prometheus exposition settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// Listen address for the metrics exporter; empty disables it.
    pub listen_addr: String,
}

impl ProxyConfig {
    /// Defaults suitable for local development.
    pub fn development() -> Self {
        Self {
            listen_addr: "127.0.0.1:8181".to_string(),
            backend: "http://127.0.0.1:8080".to_string(),
            backend_name: "application backend".to_string(),
            url_prefix: "/".to_string(),
            development_mode: true,
            version_string: format!("stevedore/{}", env!("CARGO_PKG_VERSION")),
            ..Self::default()
        }
    }
}
