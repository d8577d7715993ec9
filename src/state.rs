//! Backend state probing and socket queries
//!
//! State is never stored. It is read off the backend by fetching the
//! instance base URL: the license form marker in the body means the backend
//! wants a key, otherwise the page it redirects to names the phase.

use crate::config::BackendConfig;
use crate::wire::{self, Correlator, EventType, PacketType, Payload, WireMessage};
use anyhow::Context;
use futures::{SinkExt, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Marker present only on the license key entry page
pub const LICENSE_MARKER: &str = r#"form id="license-key""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// No live process, or the backend did not answer
    Inactive,
    /// Waiting for a license key
    License,
    /// Waiting for EULA acceptance
    LicenseEula,
    /// At the world selection screen
    Setup,
    /// A world is running and accepting players
    Join,
    ActiveUnknown,
}

/// Map a probe result to a state. The license marker wins over the redirect target.
pub fn classify(body: &str, final_url: &str) -> InstanceState {
    if body.contains(LICENSE_MARKER) {
        return InstanceState::License;
    }
    let path = final_url.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('/').next().unwrap_or_default() {
        "license" => InstanceState::LicenseEula,
        "setup" | "auth" => InstanceState::Setup,
        "join" => InstanceState::Join,
        _ => InstanceState::ActiveUnknown,
    }
}

/// Fetch the session cookie value out of a cookie header
fn session_cookie(header: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "session")
        .map(|(_, value)| value.to_string())
}

/// HTTP and socket client for talking to backends directly
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    host: String,
    instance_prefix: String,
    socket_path: String,
    probe_timeout: Duration,
    query_timeout: Duration,
    correlation_offset: i64,
}

impl BackendClient {
    pub fn new(config: &BackendConfig, instance_prefix: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .context("Failed to build backend HTTP client")?;
        Ok(Self {
            http,
            host: config.host.clone(),
            instance_prefix: instance_prefix.to_string(),
            socket_path: config.socket_path.clone(),
            probe_timeout: config.probe_timeout(),
            query_timeout: config.query_timeout(),
            correlation_offset: config.correlation_offset,
        })
    }

    /// Server-facing base URL of an instance
    pub fn base_url(&self, port: u16, slug: &str) -> String {
        format!("http://{}:{}/{}/{}", self.host, port, self.instance_prefix, slug)
    }

    /// Classify the backend by fetching its base URL
    pub async fn probe(&self, port: u16, slug: &str) -> InstanceState {
        let url = self.base_url(port, slug);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(slug, port, error = %e, "Probe failed");
                return InstanceState::Inactive;
            }
        };
        let final_url = response.url().to_string();
        match response.text().await {
            Ok(body) => {
                let state = classify(&body, &final_url);
                debug!(slug, port, ?state, final_url, "Probed backend");
                state
            }
            Err(e) => {
                debug!(slug, port, error = %e, "Probe body read failed");
                InstanceState::Inactive
            }
        }
    }

    /// A fresh cookie-carrying session against one backend
    pub fn session(&self, port: u16, slug: &str) -> anyhow::Result<BackendSession> {
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .timeout(self.probe_timeout)
            .cookie_provider(jar.clone())
            .build()
            .context("Failed to build backend session client")?;
        Ok(BackendSession {
            http,
            jar,
            base_url: self.base_url(port, slug),
            socket_url: format!(
                "ws://{}:{}/{}/{}/{}/",
                self.host, port, self.instance_prefix, slug, self.socket_path
            ),
            correlation_offset: self.correlation_offset,
        })
    }

    /// GET `<base>/<path>` for a session, then POST the form there.
    /// True on a 2xx or 3xx answer.
    pub async fn post_form(
        &self,
        port: u16,
        slug: &str,
        path: &str,
        form: &[(&str, &str)],
    ) -> anyhow::Result<bool> {
        self.session(port, slug)?.post_form(path, form).await
    }

    /// Send one event over the backend socket and return the first value of
    /// its acknowledgement. None on timeout or any failure.
    pub async fn query(&self, port: u16, slug: &str, event: &str) -> Option<Value> {
        let exchange = async {
            let session = self.session(port, slug)?;
            let mut socket = session.open_socket().await?;
            let value = socket.call(event, Vec::new()).await?;
            socket.close().await;
            anyhow::Ok(value)
        };
        match tokio::time::timeout(self.query_timeout, exchange).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(slug, port, event, error = %e, "Socket query failed");
                None
            }
            Err(_) => {
                warn!(
                    slug,
                    port,
                    event,
                    timeout_secs = self.query_timeout.as_secs(),
                    "Socket query timed out"
                );
                None
            }
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }
}

/// One browser-like session: cookies persist across its requests
pub struct BackendSession {
    http: reqwest::Client,
    jar: Arc<Jar>,
    base_url: String,
    socket_url: String,
    correlation_offset: i64,
}

impl BackendSession {
    /// GET `<base>/<path>`, then POST the form there within this session
    pub async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> anyhow::Result<bool> {
        let url = format!("{}/{}", self.base_url, path);
        self.http.get(&url).send().await?;
        let response = self.http.post(&url).form(form).send().await?;
        let status = response.status();
        debug!(url, %status, "Posted form to backend");
        Ok(status.is_success() || status.is_redirection())
    }

    fn session_id(&self, url: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .jar
            .cookies(&url.parse()?)
            .and_then(|header| header.to_str().ok().and_then(session_cookie)))
    }

    /// Connect to the backend socket as this session, fetching a session
    /// cookie from the join page first if there is none yet
    pub async fn open_socket(&self) -> anyhow::Result<BackendSocket> {
        let join_url = format!("{}/join", self.base_url);
        let session = match self.session_id(&join_url)? {
            Some(session) => session,
            None => {
                self.http
                    .get(&join_url)
                    .send()
                    .await
                    .context("Failed to open backend session")?;
                self.session_id(&join_url)?
                    .ok_or_else(|| anyhow::anyhow!("backend issued no session cookie"))?
            }
        };

        let socket_url = format!("{}?session={}&EIO=4&transport=websocket", self.socket_url, session);
        let mut request = socket_url.into_client_request()?;
        request
            .headers_mut()
            .insert("Cookie", HeaderValue::from_str(&format!("session={session}"))?);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("Backend socket handshake failed")?;
        let mut socket = BackendSocket {
            socket,
            correlator: Correlator::new(self.correlation_offset),
            next_id: 0,
        };
        socket.connect_namespace().await?;
        Ok(socket)
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected backend socket that can make acknowledged calls
pub struct BackendSocket {
    socket: ClientStream,
    correlator: Correlator,
    next_id: u64,
}

impl BackendSocket {
    /// Next decoded message, answering pings on the way
    async fn next_message(&mut self) -> anyhow::Result<Option<WireMessage>> {
        while let Some(frame) = self.socket.next().await {
            let text = match frame? {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(None),
                _ => continue,
            };
            let Ok(message) = wire::decode(text.as_str()) else {
                continue;
            };
            if message.packet == PacketType::Ping {
                self.socket.send(Message::text("3")).await?;
                continue;
            }
            return Ok(Some(message));
        }
        Ok(None)
    }

    async fn connect_namespace(&mut self) -> anyhow::Result<()> {
        while let Some(message) = self.next_message().await? {
            match (message.packet, message.event) {
                (PacketType::Open, _) => {
                    self.socket.send(Message::text("40")).await?;
                }
                (PacketType::Message, Some(EventType::Connect)) => return Ok(()),
                (PacketType::Message, Some(EventType::ConnectError)) => {
                    anyhow::bail!("backend refused socket connection");
                }
                _ => {}
            }
        }
        anyhow::bail!("backend closed the socket before connecting")
    }

    /// Emit `event` with `args` and wait for its acknowledgement. Returns the
    /// first acknowledged value; None when the socket closes first.
    pub async fn call(&mut self, event: &str, args: Vec<Value>) -> anyhow::Result<Option<Value>> {
        let id = self.next_id;
        self.next_id += 1;

        let mut data = vec![Value::String(event.to_string())];
        data.extend(args);
        let call = WireMessage::message(EventType::Event, Some(id), Payload::Json(Value::Array(data)));
        self.correlator.record(&call);
        self.socket.send(Message::text(wire::encode(&call))).await?;

        while let Some(message) = self.next_message().await? {
            if message.packet == PacketType::Message
                && matches!(message.event, Some(EventType::Ack | EventType::BinaryAck))
                && self.correlator.resolve(&message).is_some()
            {
                return Ok(message.data().and_then(|data| data.first().cloned()));
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}
