use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;

use stevedore::config::{self, ProxyConfig};
use stevedore::kvstore::KvStore;
use stevedore::observability::{logging, metrics};
use stevedore::HttpServer;

#[derive(Parser)]
#[command(name = "stevedore", version, about = "Smart reverse proxy for a slow application backend")]
struct Args {
    /// Path to the TOML configuration file. Without it, development
    /// defaults apply.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the config file.
    #[arg(short, long)]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match config::load_config(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path.display(), "load config: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            tracing::warn!("no config file given; using development defaults");
            ProxyConfig::development()
        }
    };
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }

    let secret = if config.secret_path.is_empty() {
        tracing::warn!("no secret_path configured; using a random per-process secret");
        use rand::RngCore;
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    } else {
        match config::load_secret(std::path::Path::new(&config.secret_path)) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(path = %config.secret_path, "load secret: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    if !config.metrics.listen_addr.is_empty() {
        match config.metrics.listen_addr.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => {
                tracing::error!(addr = %config.metrics.listen_addr, "metrics listen address: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let kv = if config.redis.url.is_empty() {
        None
    } else {
        match KvStore::connect(&config.redis.url).await {
            Ok(connected) => Some(connected),
            Err(e) => {
                // The proxy still works without the shared store; only the
                // Etag short-circuit and long polling go dark.
                tracing::error!("connect to redis: {}; continuing without it", e);
                None
            }
        }
    };

    let server = match HttpServer::new(config.clone(), secret, kv) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("build server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.listen_addr, "bind: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match server.run(listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("serve: {}", e);
            ExitCode::FAILURE
        }
    }
}
