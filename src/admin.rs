use crate::license::LicenseError;
use crate::lifecycle::{ActivationError, InstanceManager};
use crate::model::{is_valid_slug, CompanionUser};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body the admin API reads
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct NewLicense {
    key: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct WorldLaunch {
    world_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct NewCompanion {
    world_id: String,
    user_name: String,
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

/// Buffer and decode a JSON request body, or the 400 to answer with
async fn read_json<T: DeserializeOwned>(body: Incoming) -> Result<T, Response<Full<Bytes>>> {
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|_| response(StatusCode::BAD_REQUEST, "unreadable body"))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| response(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))
}

fn join_failed(e: JoinError) -> Response<Full<Bytes>> {
    error!(error = %e, "Lifecycle task failed");
    response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Localhost API through which the management layer drives instances
pub struct AdminServer {
    bind_addr: SocketAddr,
    manager: Arc<InstanceManager>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<InstanceManager>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, manager, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    manager: Arc<InstanceManager>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, manager, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// Split `/instances/{slug}/{operation}`
fn instance_operation(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/instances/")?;
    let (slug, operation) = rest.split_once('/')?;
    (!operation.contains('/')).then_some((slug, operation))
}

async fn handle_admin_request(
    req: Request<Incoming>,
    manager: Arc<InstanceManager>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        _ if !check_auth(&req, &auth_token) => {
            warn!(%path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/instances") => {
            let processes = manager.supervisor().list();
            json_response(
                StatusCode::OK,
                json!({
                    "count": processes.len(),
                    "instances": processes,
                }),
            )
        }

        (&Method::GET, "/licenses") => match manager.licenses() {
            Ok(licenses) => json_response(StatusCode::OK, json!({ "licenses": licenses })),
            Err(e) => {
                error!(error = %e, "License listing failed");
                response(StatusCode::INTERNAL_SERVER_ERROR, "license listing failed")
            }
        },

        (&Method::POST, "/licenses") => match read_json::<NewLicense>(req.into_body()).await {
            Ok(new) => match manager.register_license(&new.key, &new.name) {
                Ok(license) => json_response(StatusCode::CREATED, json!(license)),
                Err(e @ LicenseError::InvalidKey(_)) => {
                    json_response(StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
                }
                Err(e) => {
                    error!(error = %e, "License registration failed");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "license registration failed")
                }
            },
            Err(rejection) => rejection,
        },

        (_, path) => match instance_operation(path) {
            Some((slug, _)) if !is_valid_slug(slug) => response(StatusCode::BAD_REQUEST, "invalid slug"),
            Some((slug, operation)) => {
                handle_instance_operation(&method, slug.to_string(), operation, req.into_body(), manager).await
            }
            None => response(StatusCode::NOT_FOUND, "not found"),
        },
    };

    Ok(response)
}

async fn handle_instance_operation(
    method: &Method,
    slug: String,
    operation: &str,
    body: Incoming,
    manager: Arc<InstanceManager>,
) -> Response<Full<Bytes>> {
    match (method, operation) {
        (&Method::POST, "activate") => {
            match tokio::spawn(async move { manager.activate(&slug).await }).await {
                Ok(Ok(activated)) => json_response(StatusCode::OK, json!({ "activated": activated })),
                Ok(Err(ActivationError::UnknownInstance(_))) => {
                    response(StatusCode::NOT_FOUND, "unknown instance")
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Activation failed");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "activation failed")
                }
                Err(e) => join_failed(e),
            }
        }

        (&Method::POST, "deactivate") => {
            match tokio::spawn(async move { manager.deactivate(&slug).await }).await {
                Ok(deactivated) => json_response(StatusCode::OK, json!({ "deactivated": deactivated })),
                Err(e) => join_failed(e),
            }
        }

        (&Method::GET, "active") => {
            json_response(StatusCode::OK, json!({ "active": manager.is_active(&slug) }))
        }

        (&Method::GET, "state") => {
            match tokio::spawn(async move { manager.state(&slug).await }).await {
                Ok(state) => json_response(StatusCode::OK, json!({ "state": state })),
                Err(e) => join_failed(e),
            }
        }

        (&Method::GET, "join-info") => {
            match tokio::spawn(async move { manager.get_join_info(&slug).await }).await {
                Ok(Ok(info)) => json_response(StatusCode::OK, info),
                Ok(Err(e)) => {
                    error!(error = %e, "Join info lookup failed");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "join info failed")
                }
                Err(e) => join_failed(e),
            }
        }

        (&Method::GET, "setup-info") => {
            match tokio::spawn(async move { manager.get_setup_info(&slug).await }).await {
                Ok(info) => json_response(StatusCode::OK, info),
                Err(e) => join_failed(e),
            }
        }

        (&Method::POST, "license") => {
            match tokio::spawn(async move { manager.assign_license_if_able(&slug).await }).await {
                Ok(Ok(assigned)) => json_response(StatusCode::OK, json!({ "assigned": assigned })),
                Ok(Err(ActivationError::UnknownInstance(_))) => {
                    response(StatusCode::NOT_FOUND, "unknown instance")
                }
                Ok(Err(e)) => {
                    error!(error = %e, "License assignment failed");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "license assignment failed")
                }
                Err(e) => join_failed(e),
            }
        }

        (&Method::DELETE, "license") => {
            match tokio::spawn(async move { manager.release_license(&slug).await }).await {
                Ok(Ok(released)) => json_response(StatusCode::OK, json!({ "released": released })),
                Ok(Err(e)) => {
                    error!(error = %e, "License release failed");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "license release failed")
                }
                Err(e) => join_failed(e),
            }
        }

        (&Method::GET, "worlds") => {
            match tokio::spawn(async move { manager.worlds(&slug).await }).await {
                Ok(Ok(worlds)) => json_response(StatusCode::OK, json!({ "worlds": worlds })),
                Ok(Err(e)) => {
                    warn!(error = %e, "World listing failed");
                    response(StatusCode::NOT_FOUND, "worlds unavailable")
                }
                Err(e) => join_failed(e),
            }
        }

        (&Method::POST, "world") => {
            let launch = match read_json::<WorldLaunch>(body).await {
                Ok(launch) => launch,
                Err(rejection) => return rejection,
            };
            let task = tokio::spawn(async move {
                manager.activate_world(&slug, &launch.world_id, launch.force).await
            });
            match task.await {
                Ok(Ok(launched)) => json_response(StatusCode::OK, json!({ "launched": launched })),
                Ok(Err(ActivationError::UnknownInstance(_))) => {
                    response(StatusCode::NOT_FOUND, "unknown instance")
                }
                Ok(Err(e)) => {
                    error!(error = %e, "World launch failed");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "world launch failed")
                }
                Err(e) => join_failed(e),
            }
        }

        (&Method::DELETE, "world") => {
            match tokio::spawn(async move { manager.deactivate_world(&slug).await }).await {
                Ok(stopped) => json_response(StatusCode::OK, json!({ "stopped": stopped })),
                Err(e) => join_failed(e),
            }
        }

        (&Method::POST, "sync") => {
            match tokio::spawn(async move { manager.sync_world(&slug).await }).await {
                Ok(Ok(created)) => json_response(StatusCode::OK, json!({ "created": created })),
                Ok(Err(e)) => {
                    error!(error = %e, "World sync failed");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "world sync failed")
                }
                Err(e) => join_failed(e),
            }
        }

        (&Method::POST, "companions") => {
            let new = match read_json::<NewCompanion>(body).await {
                Ok(new) => new,
                Err(rejection) => return rejection,
            };
            let companion = CompanionUser::player(&new.world_id, &new.user_name);
            match manager.store().add_companion(&slug, &companion) {
                Ok(_) => json_response(StatusCode::CREATED, json!(companion)),
                Err(e) => {
                    warn!(error = %e, "Companion registration failed");
                    response(StatusCode::BAD_REQUEST, "companion registration failed")
                }
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
