//! Terminal WebSocket bridge.
//!
//! The capability carries everything needed to reach the upstream
//! terminal endpoint (usually a container runtime): URL, auth headers,
//! subprotocols, an optional CA bundle, and a hard session limit. The
//! proxy upgrades the client, dials the upstream, and pumps messages both
//! ways preserving text/binary framing. Ping/pong stays inside each
//! WebSocket library.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::http::Request;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::api::{pre_auth_handler, ApiClient, TerminalSettings};
use crate::helper;
use crate::observability::metrics;
use crate::routing::Handler;

/// 1006: the session was torn down rather than closed by a peer.
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("terminal settings missing from capability")]
    MissingSettings,
    #[error("terminal URL missing from capability")]
    MissingUrl,
    #[error("build upstream request: {0}")]
    Request(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("parse CA bundle")]
    BadCa,
}

/// The terminal route handler: pre-authorize, upgrade, bridge.
pub fn handler(api: Arc<ApiClient>) -> Handler {
    pre_auth_handler(api, "/authorize", |req, capability| {
        Box::pin(async move {
            let Some(settings) = capability.terminal.clone() else {
                return helper::fail_500(&req, &ChannelError::MissingSettings);
            };
            if settings.url.is_empty() {
                return helper::fail_500(&req, &ChannelError::MissingUrl);
            }

            let client_ip = helper::client_ip(&req);
            let forwarded_for = {
                let prior: Vec<String> = req
                    .headers()
                    .get_all("x-forwarded-for")
                    .iter()
                    .filter_map(|v| v.to_str().ok().map(str::to_owned))
                    .collect();
                match (prior.is_empty(), client_ip) {
                    (true, Some(ip)) => Some(ip),
                    (false, Some(ip)) => Some(format!("{}, {}", prior.join(", "), ip)),
                    (_, None) => None,
                }
            };

            let (mut parts, _body) = req.into_parts();
            let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                Ok(upgrade) => upgrade,
                Err(rejection) => {
                    let probe = Request::from_parts(parts, Body::empty());
                    return helper::fail_500(&probe, &rejection);
                }
            };

            let subprotocols = settings.subprotocols.clone();
            upgrade
                .protocols(subprotocols)
                .on_upgrade(move |client| async move {
                    metrics::record_terminal_session(1);
                    if let Err(e) = bridge(client, settings, forwarded_for).await {
                        tracing::error!("terminal session: {}", e);
                    }
                    metrics::record_terminal_session(-1);
                })
        })
    })
}

type Upstream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_upstream(
    settings: &TerminalSettings,
    forwarded_for: Option<String>,
) -> Result<Upstream, ChannelError> {
    let mut request = settings.url.as_str().into_client_request()?;

    for (name, value) in &settings.header {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            axum::http::HeaderValue::from_str(value),
        ) {
            request.headers_mut().insert(name, value);
        }
    }
    if !settings.subprotocols.is_empty() {
        if let Ok(value) =
            axum::http::HeaderValue::from_str(&settings.subprotocols.join(", "))
        {
            request
                .headers_mut()
                .insert("sec-websocket-protocol", value);
        }
    }
    if let Some(xff) = forwarded_for {
        if let Ok(value) = axum::http::HeaderValue::from_str(&xff) {
            request.headers_mut().insert("x-forwarded-for", value);
        }
    }

    let connector = if settings.ca_pem.is_empty() {
        None
    } else {
        Some(Connector::Rustls(Arc::new(tls_config(&settings.ca_pem)?)))
    };

    let (upstream, _response) =
        connect_async_tls_with_config(request, None, false, connector).await?;
    Ok(upstream)
}

fn tls_config(ca_pem: &str) -> Result<rustls::ClientConfig, ChannelError> {
    let mut roots = rustls::RootCertStore::empty();
    let mut reader = std::io::BufReader::new(ca_pem.as_bytes());
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|_| ChannelError::BadCa)?;
        roots.add(cert).map_err(|_| ChannelError::BadCa)?;
    }
    if roots.is_empty() {
        return Err(ChannelError::BadCa);
    }

    // Pin the provider: more than one rustls crypto backend may be linked.
    rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|_| ChannelError::BadCa)
    .map(|builder| builder.with_root_certificates(roots).with_no_client_auth())
}

async fn bridge(
    client: WebSocket,
    settings: TerminalSettings,
    forwarded_for: Option<String>,
) -> Result<(), ChannelError> {
    let upstream = connect_upstream(&settings, forwarded_for).await?;

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let Some(converted) = client_to_upstream_message(message) else {
                continue;
            };
            let closing = matches!(converted, UpstreamMessage::Close(_));
            if upstream_tx.send(converted).await.is_err() || closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(converted) = upstream_to_client_message(message) else {
                continue;
            };
            let closing = matches!(converted, ClientMessage::Close(_));
            if client_tx.send(converted).await.is_err() || closing {
                break;
            }
        }
    };

    let session_timer = async {
        if settings.max_session_time > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(settings.max_session_time)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    let timed_out = tokio::select! {
        _ = client_to_upstream => false,
        _ = upstream_to_client => false,
        _ = session_timer => true,
    };

    if timed_out {
        tracing::info!(
            max_session_time = settings.max_session_time,
            "terminal session reached its time limit"
        );
    }

    // Tear down both legs; either copier exiting means the session is over.
    let _ = client_tx
        .send(ClientMessage::Close(Some(CloseFrame {
            code: ABNORMAL_CLOSURE,
            reason: "session ended".into(),
        })))
        .await;
    let _ = upstream_tx
        .send(UpstreamMessage::Close(Some(UpstreamCloseFrame {
            code: CloseCode::Abnormal,
            reason: "session ended".into(),
        })))
        .await;

    Ok(())
}

/// Binary in, binary out; text in, text out. Ping/pong never crosses.
fn client_to_upstream_message(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text.as_str().to_string().into())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data.to_vec().into())),
        ClientMessage::Close(_) => Some(UpstreamMessage::Close(None)),
        ClientMessage::Ping(_) | ClientMessage::Pong(_) => None,
    }
}

fn upstream_to_client_message(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.to_string().into())),
        UpstreamMessage::Binary(data) => {
            Some(ClientMessage::Binary(bytes::Bytes::from(data.to_vec())))
        }
        UpstreamMessage::Close(_) => Some(ClientMessage::Close(None)),
        _ => None,
    }
}
