//! WebSocket relay between browsers and backends
//!
//! Unlike a byte tunnel, the relay terminates both WebSocket connections so
//! that every text frame can pass through the wire codec. Client requests are
//! recorded; server acks are paired with them and offered to the rewrite
//! engine. Anything that does not decode or match goes through as sent.

use crate::error::{full_body, json_error_response, GatewayBody, ProxyErrorCode};
use crate::rewrite::{RewriteContext, RewriteEngine};
use crate::wire::{self, Correlator};
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Headers carried over to the backend handshake
const FORWARDED_HEADERS: [&str; 4] = ["cookie", "origin", "user-agent", "x-forwarded-for"];

/// How long to wait for the far side to acknowledge a close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Check if a request asks for a WebSocket upgrade
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let upgrades_to_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    has_upgrade_connection && upgrades_to_websocket
}

/// Per-connection rewriting state
pub struct RelaySession {
    engine: Arc<RewriteEngine>,
    context: RewriteContext,
    correlator: Correlator,
}

impl RelaySession {
    pub fn new(engine: Arc<RewriteEngine>, context: RewriteContext, correlation_offset: i64) -> Self {
        Self {
            engine,
            context,
            correlator: Correlator::new(correlation_offset),
        }
    }

    /// Note a client frame before it is forwarded unchanged
    pub fn observe_client(&mut self, text: &str) {
        if let Ok(message) = wire::decode(text) {
            self.correlator.record(&message);
        }
    }

    /// The text to forward for a server frame
    pub fn transform_server(&mut self, text: Utf8Bytes) -> Utf8Bytes {
        let Ok(message) = wire::decode(text.as_str()) else {
            return text;
        };
        if !message.is_ack() {
            return text;
        }
        let Some(request) = self.correlator.resolve(&message) else {
            return text;
        };
        match self.engine.rewrite(&message, &request, &self.context) {
            Some(rewritten) => {
                debug!(
                    slug = %self.context.fragment.slug,
                    verb = request.first().and_then(|v| v.as_str()).unwrap_or_default(),
                    "Rewrote backend reply"
                );
                wire::encode(&rewritten).into()
            }
            None => text,
        }
    }
}

/// Open the backend socket, then accept the client's upgrade and relay
/// between the two on a spawned task
pub async fn handle_upgrade(
    req: Request<Incoming>,
    backend_url: String,
    session: RelaySession,
    request_id: String,
) -> Response<GatewayBody> {
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return json_error_response(ProxyErrorCode::BadRequest, "Missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());

    let mut backend_req = match backend_url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            error!(request_id, error = %e, "Invalid backend socket URL");
            return json_error_response(ProxyErrorCode::InternalError, "Invalid backend address");
        }
    };
    for name in FORWARDED_HEADERS {
        if let Some(value) = req.headers().get(name) {
            backend_req.headers_mut().insert(name, value.clone());
        }
    }

    let backend = match tokio_tungstenite::connect_async(backend_req).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!(request_id, error = %e, "Backend refused WebSocket handshake");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        }
    };

    let slug = session.context.fragment.slug.clone();
    info!(slug, request_id, "WebSocket upgrade successful");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                relay(client, backend, session).await;
            }
            Err(e) => {
                error!(slug, error = %e, "Failed to upgrade client connection");
            }
        }
        debug!(slug, request_id, "WebSocket connection closed");
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, HeaderValue::from_static("websocket"))
        .header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(full_body(""))
        .expect("valid response builder")
}

/// Pump frames both ways until either side closes
pub async fn relay<C, B>(
    mut client: WebSocketStream<C>,
    mut backend: WebSocketStream<B>,
    mut session: RelaySession,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let slug = session.context.fragment.slug.clone();

    loop {
        tokio::select! {
            frame = client.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    session.observe_client(text.as_str());
                    if backend.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if backend.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(slug, ?frame, "Client closed WebSocket");
                    let _ = client.flush().await;
                    let _ = backend.send(Message::Close(frame)).await;
                    drain(&mut backend).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(slug, error = %e, "Client WebSocket error");
                    let _ = backend.close(None).await;
                    return;
                }
                None => {
                    let _ = backend.close(None).await;
                    return;
                }
            },
            frame = backend.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text = session.transform_server(text);
                    if client.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if client.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(slug, ?frame, "Backend closed WebSocket");
                    let _ = backend.flush().await;
                    let _ = client.send(Message::Close(frame)).await;
                    drain(&mut client).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(slug, error = %e, "Backend WebSocket error");
                    let _ = client.close(None).await;
                    return;
                }
                None => {
                    let _ = client.close(None).await;
                    return;
                }
            },
        }
    }

    let _ = client.close(None).await;
    let _ = backend.close(None).await;
}

/// Read until the peer answers our close frame or the timeout passes
async fn drain<S>(stream: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await;
}
