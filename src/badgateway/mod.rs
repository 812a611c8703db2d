//! Backend round trips with 502 injection.
//!
//! # Responsibilities
//! - Dial the single application backend (fixed TCP address or unix socket)
//! - Convert transport errors into rendered 502 responses
//!
//! # Design Decisions
//! - The proxy serves exactly one backend, so the connector ignores the
//!   request URI and always dials the configured target
//! - Transport failures become 502 ("<name> is not responding"), not 500:
//!   users and operators expect a bad-gateway page when the backend is down
//! - Raw error text is only exposed in development mode

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use url::Url;

use crate::helper;

/// Where backend connections go.
#[derive(Clone, Debug)]
enum Target {
    Tcp(Arc<str>),
    Unix(Arc<PathBuf>),
}

/// A connection to the backend, TCP or unix-socket flavoured.
pub enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for BackendStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// A hyper connector that always dials the configured backend target.
#[derive(Clone)]
pub struct BackendConnector {
    target: Target,
}

impl tower::Service<Uri> for BackendConnector {
    type Response = TokioIo<BackendStream>;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let target = self.target.clone();
        Box::pin(async move {
            match target {
                Target::Tcp(addr) => TcpStream::connect(addr.as_ref())
                    .await
                    .map(BackendStream::Tcp),
                Target::Unix(path) => UnixStream::connect(path.as_path())
                    .await
                    .map(BackendStream::Unix),
            }
            .map(TokioIo::new)
        })
    }
}

/// Backend HTTP client with 502 injection. Process-wide and safe for
/// concurrent use; shared by the pre-auth client and the fallback proxy.
#[derive(Clone)]
pub struct RoundTripper {
    client: Client<BackendConnector, Body>,
    authority: String,
    backend_name: Arc<str>,
    development_mode: bool,
}

impl RoundTripper {
    pub fn new(
        backend: &Url,
        socket: Option<&str>,
        backend_name: &str,
        development_mode: bool,
    ) -> Self {
        let target = match socket {
            Some(path) => Target::Unix(Arc::new(PathBuf::from(path))),
            None => Target::Tcp(backend_address(backend).into()),
        };

        let authority = backend
            .host_str()
            .map(|h| match backend.port() {
                Some(p) => format!("{}:{}", h, p),
                None => h.to_string(),
            })
            .unwrap_or_else(|| "localhost".to_string());

        let client = Client::builder(TokioExecutor::new()).build(BackendConnector { target });

        Self {
            client,
            authority,
            backend_name: backend_name.into(),
            development_mode,
        }
    }

    /// Rewrite the request URI onto the backend authority. The path and
    /// query are preserved; the original Host header is left untouched.
    fn rebase(&self, req: &mut Request<Body>) -> Result<(), axum::http::Error> {
        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(axum::http::uri::Scheme::HTTP);
        parts.authority = Some(self.authority.parse().map_err(axum::http::Error::from)?);
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(axum::http::uri::PathAndQuery::from_static("/"));
        }
        *req.uri_mut() = Uri::from_parts(parts)?;
        Ok(())
    }

    /// Perform the round trip. Never fails: transport errors come back as
    /// a rendered 502 response.
    pub async fn round_trip(&self, mut req: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let scrubbed_uri = helper::scrub_url_params(&req.uri().to_string());

        if let Err(e) = self.rebase(&mut req) {
            tracing::error!(uri = %scrubbed_uri, "badgateway: rebase request URI: {}", e);
            return self.bad_gateway(&e.to_string());
        }

        match self.client.request(req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                tracing::error!(
                    uri = %scrubbed_uri,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "badgateway: {}",
                    e
                );
                self.bad_gateway(&e.to_string())
            }
        }
    }

    fn bad_gateway(&self, error: &str) -> Response<Body> {
        let message = if self.development_mode {
            error.to_string()
        } else {
            format!("{} is not responding", self.backend_name)
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = StatusCode::BAD_GATEWAY;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    }
}

fn backend_address(backend: &Url) -> String {
    let host = backend.host_str().unwrap_or("localhost");
    let port = backend.port_or_known_default().unwrap_or(80);
    format!("{}:{}", host, port)
}
