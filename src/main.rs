use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use vttgate::admin::{AdminServer, PKG_NAME, VERSION};
use vttgate::config::Config;
use vttgate::lifecycle::InstanceManager;
use vttgate::process::ProcessSupervisor;
use vttgate::proxy::{Gateway, ProxyServer};
use vttgate::rewrite::RewriteEngine;
use vttgate::store::{InstanceStore, SqliteStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vttgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store: Arc<dyn InstanceStore> = Arc::new(SqliteStore::open(&config.store.path)?);
    let supervisor = ProcessSupervisor::new(config.backend.clone(), &config.server.instance_prefix);
    let manager = InstanceManager::new(Arc::clone(&store), Arc::clone(&supervisor))?;

    let gateway = Gateway::new(
        &config,
        Arc::clone(&store),
        supervisor.clone(),
        RewriteEngine::standard(&config.templates),
    );

    let public_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(public_addr, gateway, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&manager), shutdown_rx.clone(), admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    manager.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        public_port = config.server.public_port(),
        admin_port = config.server.admin_port,
        instance_prefix = %config.server.instance_prefix,
        management_prefix = %config.server.management_prefix,
        management_upstream = ?config.server.management_upstream,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
    info!(
        host = %config.backend.host,
        launcher = ?config.backend.launcher,
        releases_dir = %config.backend.releases_dir.display(),
        data_root = %config.backend.data_root.display(),
        port_floor = config.backend.port_floor,
        port_span = config.backend.port_span,
        "Backend settings"
    );
    info!(
        startup_timeout_secs = config.backend.startup_timeout_secs,
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        probe_timeout_secs = config.backend.probe_timeout_secs,
        query_timeout_secs = config.backend.query_timeout_secs,
        correlation_offset = config.backend.correlation_offset,
        "Timeouts"
    );
}
