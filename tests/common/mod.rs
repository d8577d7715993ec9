//! Shared helpers for integration tests
//!
//! `FakeBackend` speaks just enough of a tabletop backend's surface for the
//! gateway and lifecycle tests: the landing redirect, the license and EULA
//! forms, the session cookie and a socket that answers the events we query.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use vttgate::config::Config;
use vttgate::process::RouteTable;
use vttgate::proxy::{Gateway, ProxyServer};
use vttgate::rewrite::RewriteEngine;
use vttgate::store::{InstanceStore, SqliteStore};
use vttgate::wire::{self, EventType, Payload, WireMessage};

pub const LICENSE_FORM: &str = r#"<html><body><form id="license-key" method="post"></form></body></html>"#;

/// Join form template as the backend sends it for `parts/join-form.hbs`
pub const JOIN_FORM_TEMPLATE: &str =
    r#"<form class="join-form"><select name="userid"></select><input type="password" name="password"></form>"#;

/// v11 join page template with a header worth keeping
pub const JOIN_GAME_TEMPLATE: &str =
    r#"<section><div class="join-form"><h2>Join Game Session</h2><form><input name="password"></form></div></section>"#;

/// Which page the backend's base URL lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    LicenseForm,
    Eula,
    Setup,
    Join,
}

#[derive(Debug)]
pub struct BackendState {
    pub port: u16,
    pub landing: Mutex<Landing>,
    pub active_users: AtomicUsize,
    /// (backend-relative path, raw body) of every POST
    pub posts: Mutex<Vec<(String, String)>>,
    /// Query strings of socket handshakes
    pub socket_queries: Mutex<Vec<String>>,
    /// Cookie headers of socket handshakes
    pub socket_cookies: Mutex<Vec<String>>,
    /// Close frames received from clients, as (code, reason)
    pub closes: Mutex<Vec<(u16, String)>>,
    /// Text frames received from clients
    pub frames: Mutex<Vec<String>>,
    /// Cookie header of every POST, empty when none was sent
    pub post_cookies: Mutex<Vec<String>>,
    /// Id of the world answered in join data
    pub world: Mutex<String>,
    /// Users of the running world
    pub users: Mutex<Vec<Value>>,
    /// `modifyDocument` payloads received over the socket
    pub documents: Mutex<Vec<Value>>,
    sessions: AtomicU64,
}

impl BackendState {
    pub fn set_landing(&self, landing: Landing) {
        *self.landing.lock() = landing;
    }

    pub fn posts_to(&self, path: &str) -> Vec<String> {
        self.posts
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

pub struct FakeBackend {
    pub port: u16,
    pub state: Arc<BackendState>,
    task: JoinHandle<()>,
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeBackend {
    pub async fn start(landing: Landing) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, landing)
    }

    /// Serve on an already bound listener
    pub fn serve(listener: TcpListener, landing: Landing) -> Self {
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(BackendState {
            port,
            landing: Mutex::new(landing),
            active_users: AtomicUsize::new(0),
            posts: Mutex::new(Vec::new()),
            socket_queries: Mutex::new(Vec::new()),
            socket_cookies: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            post_cookies: Mutex::new(Vec::new()),
            world: Mutex::new("world-1".to_string()),
            users: Mutex::new(vec![
                json!({"_id": "gm1", "name": "Gamemaster", "role": 4}),
                json!({"_id": "p1", "name": "Player", "role": 1}),
            ]),
            documents: Mutex::new(Vec::new()),
            sessions: AtomicU64::new(0),
        });

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });

        Self { port, state, task }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/html")
        .body(Full::new(body.into()))
        .unwrap()
}

async fn handle(req: Request<Incoming>, state: Arc<BackendState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.len() < 2 || segments[0] != "vtt" {
        return Ok(text(StatusCode::NOT_FOUND, "not found"));
    }
    let base = format!("/vtt/{}", segments[1]);
    let rest = segments[2..].join("/");

    if rest.starts_with("socket.io") && req.headers().contains_key("sec-websocket-key") {
        return Ok(upgrade(req, state));
    }

    let cookie = req
        .headers()
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if req.method() == Method::POST {
        let body = req.into_body().collect().await?.to_bytes();
        let body = String::from_utf8_lossy(&body).to_string();
        match rest.as_str() {
            "license" if body.contains("action=enterKey") => state.set_landing(Landing::Eula),
            "license" if body.contains("accept=on") => state.set_landing(Landing::Setup),
            "setup" if body.contains("action=launchWorld") => {
                if let Some(world) = form_value(&body, "world") {
                    *state.world.lock() = world;
                }
                state.set_landing(Landing::Join);
            }
            "join" if body.contains("action=shutdown") => state.set_landing(Landing::Setup),
            _ => {}
        }
        state.post_cookies.lock().push(cookie);
        state.posts.lock().push((rest, body));
        return Ok(Response::builder()
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(r#"{"status":"success"}"#)))
            .unwrap());
    }

    if rest.is_empty() {
        let landing = *state.landing.lock();
        let target = match landing {
            Landing::LicenseForm => return Ok(text(StatusCode::OK, LICENSE_FORM)),
            Landing::Eula => "license",
            Landing::Setup => "setup",
            Landing::Join => "join",
        };
        return Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header("location", format!("{base}/{target}"))
            .body(Full::new(Bytes::new()))
            .unwrap());
    }

    let mut response = Response::builder().header("content-type", "text/html");
    if !cookie.contains("session=") {
        let session = state.sessions.fetch_add(1, Ordering::SeqCst);
        response = response.header("set-cookie", format!("session=sess-{session}; Path=/"));
    }
    Ok(response
        .body(Full::new(Bytes::from(format!("<html><body>{rest}</body></html>"))))
        .unwrap())
}

fn form_value(body: &str, name: &str) -> Option<String> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn upgrade(req: Request<Incoming>, state: Arc<BackendState>) -> Response<Full<Bytes>> {
    let accept = derive_accept_key(req.headers()["sec-websocket-key"].as_bytes());
    state
        .socket_queries
        .lock()
        .push(req.uri().query().unwrap_or_default().to_string());
    if let Some(cookie) = req.headers().get("cookie").and_then(|v| v.to_str().ok()) {
        state.socket_cookies.lock().push(cookie.to_string());
    }

    tokio::spawn(async move {
        if let Ok(upgraded) = hyper::upgrade::on(req).await {
            let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            socket_session(socket, state).await;
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-accept", accept)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn ack(id: Option<u64>, value: Value) -> Message {
    let reply = WireMessage::message(EventType::Ack, id, Payload::Json(json!([value])));
    Message::text(wire::encode(&reply))
}

async fn socket_session(mut socket: WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>, state: Arc<BackendState>) {
    let open = r#"0{"sid":"fake","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
    if socket.send(Message::text(open)).await.is_err() {
        return;
    }

    while let Some(Ok(frame)) = socket.next().await {
        let text = match frame {
            Message::Text(text) => text.as_str().to_string(),
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    state
                        .closes
                        .lock()
                        .push((u16::from(frame.code), frame.reason.as_str().to_string()));
                }
                break;
            }
            _ => continue,
        };
        state.frames.lock().push(text.clone());

        if text == "40" {
            let _ = socket.send(Message::text(r#"40{"sid":"socket-1"}"#)).await;
            continue;
        }
        let Ok(message) = wire::decode(&text) else {
            continue;
        };
        let Some(data) = message.data() else {
            continue;
        };
        let reply = match data.first().and_then(Value::as_str) {
            Some("getJoinData") => {
                let users = state.active_users.load(Ordering::SeqCst);
                let active: Vec<Value> = (0..users).map(|i| json!(format!("player-{i}"))).collect();
                ack(
                    message.id,
                    json!({
                        "activeUsers": active,
                        "users": state.users.lock().clone(),
                        "world": {"id": state.world.lock().clone(), "title": "Test World"}
                    }),
                )
            }
            Some("getPlayersData") => ack(message.id, json!({"users": state.users.lock().clone()})),
            Some("modifyDocument") => {
                let document = data.get(1).cloned().unwrap_or(Value::Null);
                state.documents.lock().push(document.clone());
                let mut users = state.users.lock();
                let created = json!({
                    "_id": format!("user-{}", users.len()),
                    "name": document.pointer("/operation/data/0/name").cloned().unwrap_or(Value::Null),
                    "role": 1
                });
                users.push(created.clone());
                ack(message.id, json!({"result": [created]}))
            }
            Some("getSetupData") => ack(message.id, json!({"worlds": [], "version": "11.315"})),
            Some("template") => {
                let html = match data.get(1).and_then(Value::as_str) {
                    Some("templates/setup/join-game.hbs") => JOIN_GAME_TEMPLATE,
                    Some("templates/setup/parts/join-form.hbs") => JOIN_FORM_TEMPLATE,
                    _ => "<p>untouched</p>",
                };
                ack(message.id, json!({"html": html, "success": true}))
            }
            Some("world") => {
                let port = state.port;
                ack(
                    message.id,
                    json!({
                        "addresses": {
                            "local": format!("http://127.0.0.1:{port}/vtt/alice"),
                            "remote": format!("http://203.0.113.9:{port}/vtt/alice")
                        }
                    }),
                )
            }
            Some("kick") => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(4001),
                        reason: "kicked".into(),
                    })))
                    .await;
                // Wait for the peer to answer the close
                let _ = tokio::time::timeout(Duration::from_secs(2), async {
                    while let Some(Ok(_)) = socket.next().await {}
                })
                .await;
                return;
            }
            _ => match message.id {
                Some(id) => ack(Some(id), Value::Null),
                None => continue,
            },
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

/// Route table backed by a fixed map
#[derive(Default)]
pub struct FixedRoutes(pub Mutex<HashMap<String, u16>>);

impl FixedRoutes {
    pub fn with(slug: &str, port: u16) -> Self {
        let routes = Self::default();
        routes.0.lock().insert(slug.to_string(), port);
        routes
    }
}

impl RouteTable for FixedRoutes {
    fn port_of(&self, slug: &str) -> Option<u16> {
        self.0.lock().get(slug).copied()
    }
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP request and get response
pub async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, &[], b"").await
}

pub async fn http_post_form(port: u16, path: &str, body: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_post_raw(
        port,
        path,
        &[("Content-Type", "application/x-www-form-urlencoded")],
        body.as_bytes(),
    )
    .await
}

/// POST an arbitrary body with extra request headers
pub async fn http_post_raw(
    port: u16,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "POST", path, headers, body).await
}

/// One request over a fresh connection; the raw response text
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!("{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n", method, path, port);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if method != "GET" {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.write_all(body).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Body of a raw HTTP response
pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, body)| body)
}

/// Status code from a raw HTTP response
pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// Lay out a fake release whose `main.js` is a shell script
pub fn fake_release(root: &std::path::Path, version: &str, script: &str) {
    let app = root.join("releases").join(version).join("resources").join("app");
    std::fs::create_dir_all(&app).unwrap();
    std::fs::write(app.join("main.js"), script).unwrap();
}

pub const LOGIN_FRAGMENT: &str =
    r#"<a class="vtt-login" href="/{{ management_prefix }}/login/{{ slug }}">Log in</a>"#;
pub const ADMIN_FRAGMENT: &str =
    r#"<a class="vtt-admin" href="/{{ management_prefix }}/admin/{{ slug }}">Manage</a>"#;

/// A gateway serving on an ephemeral port
pub struct TestGateway {
    pub port: u16,
    pub store: Arc<dyn InstanceStore>,
    pub routes: Arc<FixedRoutes>,
    _templates: tempfile::TempDir,
    _shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_gateway(routes: FixedRoutes) -> TestGateway {
    let templates = tempfile::tempdir().unwrap();
    std::fs::write(templates.path().join("injected_login_button.html"), LOGIN_FRAGMENT).unwrap();
    std::fs::write(templates.path().join("injected_admin_login.html"), ADMIN_FRAGMENT).unwrap();

    let mut config = Config::default();
    config.templates.dir = templates.path().to_path_buf();
    config.server.request_timeout_secs = 5;

    let store: Arc<dyn InstanceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let routes = Arc::new(routes);
    let gateway = Gateway::new(
        &config,
        Arc::clone(&store),
        routes.clone(),
        RewriteEngine::standard(&config.templates),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(listener.local_addr().unwrap(), gateway, shutdown_rx);
    let task = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestGateway {
        port,
        store,
        routes,
        _templates: templates,
        _shutdown: shutdown_tx,
        task,
    }
}
