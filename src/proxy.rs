use crate::config::Config;
use crate::error::{full_body, json_error_response, GatewayBody, ProxyErrorCode};
use crate::gatekeeper::{is_identity_encoding, parse_fields, Gatekeeper};
use crate::model::Instance;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::RouteTable;
use crate::rewrite::{observe_eula_acceptance, FragmentContext, RewriteContext, RewriteEngine};
use crate::store::InstanceStore;
use crate::websocket::{self, RelaySession};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Backend-relative path whose POSTs carry EULA acceptance
const LICENSE_PATH: &str = "license";

/// Where a request is routed, by its first path segment
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    Root,
    Management,
    /// Instance slug and the path below the instance base
    Instance { slug: &'a str, rest: &'a str },
    NotFound,
}

/// Shared state for request handling
pub struct Gateway {
    instance_prefix: String,
    management_prefix: String,
    management_upstream: Option<String>,
    backend_host: String,
    socket_path: String,
    public_port: u16,
    request_timeout: Duration,
    max_inspected_body_bytes: usize,
    correlation_offset: i64,
    store: Arc<dyn InstanceStore>,
    routes: Arc<dyn RouteTable>,
    pool: ConnectionPool,
    gatekeeper: Gatekeeper,
    rewriter: Arc<RewriteEngine>,
}

impl Gateway {
    pub fn new(
        config: &Config,
        store: Arc<dyn InstanceStore>,
        routes: Arc<dyn RouteTable>,
        rewriter: RewriteEngine,
    ) -> Arc<Self> {
        let server = &config.server;
        Arc::new(Self {
            instance_prefix: server.instance_prefix.clone(),
            management_prefix: server.management_prefix.clone(),
            management_upstream: server.management_upstream.clone(),
            backend_host: config.backend.host.clone(),
            socket_path: config.backend.socket_path.trim_matches('/').to_string(),
            public_port: server.public_port(),
            request_timeout: server.request_timeout(),
            max_inspected_body_bytes: server.max_inspected_body_bytes,
            correlation_offset: config.backend.correlation_offset,
            store,
            routes,
            pool: ConnectionPool::new(PoolConfig::from(server)),
            gatekeeper: Gatekeeper::new(&config.gateway),
            rewriter: Arc::new(rewriter),
        })
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn route<'a>(&self, path: &'a str) -> Route<'a> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Route::Root;
        }
        let mut segments = trimmed.splitn(3, '/');
        let first = segments.next().unwrap_or_default();

        if first == self.management_prefix {
            return Route::Management;
        }
        if first == self.instance_prefix {
            return match segments.next() {
                Some(slug) if !slug.is_empty() => Route::Instance {
                    slug,
                    rest: segments.next().unwrap_or_default(),
                },
                _ => Route::NotFound,
            };
        }
        Route::NotFound
    }

    fn rewrite_context(&self, instance: &Instance, backend_port: u16) -> RewriteContext {
        RewriteContext {
            fragment: FragmentContext {
                slug: instance.slug.clone(),
                name: instance.name.clone(),
                display_name: instance.display_name().to_string(),
                base_url: instance.base_path(&self.instance_prefix),
                management_prefix: self.management_prefix.clone(),
            },
            backend_port,
            public_port: self.public_port,
        }
    }
}

/// The public listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.gateway.pool().stats();
                        info!(
                            forwarded = stats.get_total_requests(),
                            failed = stats.get_failed_requests(),
                            "Gateway shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, not appended: this is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let path = req.uri().path().to_string();
    match gateway.route(&path) {
        Route::Root => Ok(redirect(&format!("/{}/", gateway.management_prefix))),
        Route::Management => match gateway.management_upstream.clone() {
            Some(upstream) => Ok(forward(&gateway, req.map(|b| b.boxed()), &upstream, &request_id).await),
            None => Ok(json_error_response(ProxyErrorCode::NotFound, "Not found")),
        },
        Route::Instance { slug, rest } => {
            Ok(handle_instance(req, &gateway, slug, rest, request_id).await)
        }
        Route::NotFound => Ok(json_error_response(ProxyErrorCode::NotFound, "Not found")),
    }
}

fn redirect(location: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .body(full_body(""))
        .expect("valid response builder")
}

async fn handle_instance(
    req: Request<Incoming>,
    gateway: &Gateway,
    slug: &str,
    rest: &str,
    request_id: String,
) -> Response<GatewayBody> {
    let instance = match gateway.store.lookup_instance_by_slug(slug) {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            return json_error_response(ProxyErrorCode::UnknownInstance, "Unknown instance");
        }
        Err(e) => {
            error!(slug, error = %e, "Instance lookup failed");
            return json_error_response(ProxyErrorCode::InternalError, "Instance lookup failed");
        }
    };

    let Some(port) = gateway.routes.port_of(slug) else {
        return json_error_response(ProxyErrorCode::InstanceInactive, "Instance is not running");
    };
    let backend = format!("{}:{}", gateway.backend_host, port);
    let backend_path = rest.trim_end_matches('/');

    if websocket::is_websocket_upgrade(&req) && backend_path.starts_with(gateway.socket_path.as_str()) {
        let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let backend_url = format!("ws://{}{}", backend, path_and_query);
        let session = RelaySession::new(
            Arc::clone(&gateway.rewriter),
            gateway.rewrite_context(&instance, port),
            gateway.correlation_offset,
        );
        debug!(slug, request_id, backend_url, "Relaying WebSocket");
        return websocket::handle_upgrade(req, backend_url, session, request_id).await;
    }

    let inspect = req.method() == Method::POST
        && (gateway.gatekeeper.inspects(backend_path) || backend_path.eq_ignore_ascii_case(LICENSE_PATH));
    if !inspect {
        return forward(gateway, req.map(|b| b.boxed()), &backend, &request_id).await;
    }

    let content_encoding = req
        .headers()
        .get(hyper::header::CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or("invalid"));
    if !is_identity_encoding(content_encoding) {
        warn!(slug, request_id, encoding = content_encoding.unwrap_or_default(), "Refused encoded body");
        return json_error_response(
            ProxyErrorCode::UnsupportedMediaType,
            "Encoded request bodies are not accepted here",
        );
    }

    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let (parts, body) = req.into_parts();

    let bytes = match Limited::new(body, gateway.max_inspected_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(slug, request_id, limit = gateway.max_inspected_body_bytes, "Request body too large");
            return json_error_response(ProxyErrorCode::PayloadTooLarge, "Request body too large");
        }
        Err(e) => {
            debug!(slug, request_id, error = %e, "Failed to read request body");
            return json_error_response(ProxyErrorCode::BadRequest, "Failed to read request body");
        }
    };

    let fields = parse_fields(content_type.as_deref(), &bytes);
    if gateway.gatekeeper.is_denied(backend_path, &fields) {
        warn!(
            slug,
            request_id,
            path = backend_path,
            action = fields.get("action").map(String::as_str).unwrap_or_default(),
            "Denied privileged action"
        );
        return json_error_response(ProxyErrorCode::ActionDenied, "Action not permitted");
    }

    if observe_eula_acceptance(backend_path, &fields) && !instance.eula_accepted {
        match gateway.store.set_eula_accepted(slug) {
            Ok(true) => info!(slug, "Recorded EULA acceptance"),
            Ok(false) => {}
            Err(e) => error!(slug, error = %e, "Failed to record EULA acceptance"),
        }
    }

    let req = Request::from_parts(parts, full_body(bytes));
    forward(gateway, req, &backend, &request_id).await
}

/// Send a request through the pool with the gateway's timeout
async fn forward(
    gateway: &Gateway,
    req: Request<GatewayBody>,
    authority: &str,
    request_id: &str,
) -> Response<GatewayBody> {
    let timeout = gateway.request_timeout;
    match tokio::time::timeout(timeout, gateway.pool.send_request(req, authority)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(authority, request_id, error = %e, "Failed to forward request via pool");
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        Err(_) => {
            warn!(
                authority,
                request_id,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            )
        }
    }
}
