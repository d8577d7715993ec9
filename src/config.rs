use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener and admin API
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend process supervision
    #[serde(default)]
    pub backend: BackendConfig,

    /// Request gatekeeping
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Injected fragment templates
    #[serde(default)]
    pub templates: TemplateConfig,

    /// Instance and license persistence
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the localhost admin API used by the management layer
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Port clients see in invite links, when the gateway sits behind another forwarder
    pub public_port: Option<u16>,

    /// First path segment reserved for instances
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,

    /// First path segment reserved for the management application
    #[serde(default = "default_management_prefix")]
    pub management_prefix: String,

    /// host:port of the management application (optional)
    pub management_upstream: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend response in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest request body buffered for deny-list inspection
    #[serde(default = "default_max_inspected_body")]
    pub max_inspected_body_bytes: usize,
}

impl ServerConfig {
    pub fn public_port(&self) -> u16 {
        self.public_port.unwrap_or(self.port)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            public_port: None,
            instance_prefix: default_instance_prefix(),
            management_prefix: default_management_prefix(),
            management_upstream: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_inspected_body_bytes: default_max_inspected_body(),
        }
    }
}

/// How backend processes are launched and supervised
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Host the backends listen on
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Interpreter placed before the backend entry point (e.g. "node")
    #[serde(default = "default_launcher")]
    pub launcher: Option<String>,

    /// Directory holding one unpacked release per version
    #[serde(default = "default_releases_dir")]
    pub releases_dir: PathBuf,

    /// Directory holding one data directory per instance slug
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Lowest port handed to a backend
    #[serde(default = "default_port_floor")]
    pub port_floor: u16,

    /// Number of ports scanned above the floor
    #[serde(default = "default_port_span")]
    pub port_span: u16,

    /// Max seconds for a spawned backend to answer HTTP
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness checks in milliseconds
    #[serde(default = "default_ready_interval")]
    pub ready_check_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Timeout for a single state probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for a whole socket query exchange
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Backend socket endpoint name under the instance base path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Difference between a reply's id and the id of the request it answers
    #[serde(default)]
    pub correlation_offset: i64,
}

impl BackendConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn ready_check_interval(&self) -> Duration {
        Duration::from_millis(self.ready_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            launcher: default_launcher(),
            releases_dir: default_releases_dir(),
            data_root: default_data_root(),
            port_floor: default_port_floor(),
            port_span: default_port_span(),
            startup_timeout_secs: default_startup_timeout(),
            ready_check_interval_ms: default_ready_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            probe_timeout_secs: default_probe_timeout(),
            query_timeout_secs: default_query_timeout(),
            socket_path: default_socket_path(),
            correlation_offset: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Backend-relative path -> actions refused on POST
    #[serde(default = "default_deny")]
    pub deny: HashMap<String, Vec<String>>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            deny: default_deny(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplateConfig {
    #[serde(default = "default_template_dir")]
    pub dir: PathBuf,

    /// Fragment spliced into the player join page
    #[serde(default = "default_login_fragment")]
    pub login_fragment: String,

    /// Fragment spliced into the admin setup page
    #[serde(default = "default_admin_fragment")]
    pub admin_fragment: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            dir: default_template_dir(),
            login_fragment: default_login_fragment(),
            admin_fragment: default_admin_fragment(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_instance_prefix() -> String {
    "vtt".to_string()
}

fn default_management_prefix() -> String {
    "manage".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for backend to respond
}

fn default_max_inspected_body() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_launcher() -> Option<String> {
    Some("node".to_string())
}

fn default_releases_dir() -> PathBuf {
    PathBuf::from("releases")
}

fn default_data_root() -> PathBuf {
    PathBuf::from("instance_data")
}

fn default_port_floor() -> u16 {
    30000
}

fn default_port_span() -> u16 {
    1000
}

fn default_startup_timeout() -> u64 {
    30 // 30 seconds
}

fn default_ready_interval() -> u64 {
    100 // 100ms
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_query_timeout() -> u64 {
    5
}

fn default_socket_path() -> String {
    "socket.io".to_string()
}

fn default_deny() -> HashMap<String, Vec<String>> {
    let mut deny = HashMap::new();
    deny.insert("join".to_string(), vec!["join".to_string(), "shutdown".to_string()]);
    deny.insert(
        "setup".to_string(),
        vec!["adminAuth".to_string(), "shutdown".to_string()],
    );
    deny.insert("auth".to_string(), vec!["adminAuth".to_string()]);
    deny
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_login_fragment() -> String {
    "injected_login_button.html".to_string()
}

fn default_admin_fragment() -> String {
    "injected_admin_login.html".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("vttgate.db")
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('/')
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !valid_segment(&self.server.instance_prefix) {
            errors.push(format!(
                "server.instance_prefix '{}' must be a single non-empty path segment",
                self.server.instance_prefix
            ));
        }
        if !valid_segment(&self.server.management_prefix) {
            errors.push(format!(
                "server.management_prefix '{}' must be a single non-empty path segment",
                self.server.management_prefix
            ));
        }
        if self.server.instance_prefix == self.server.management_prefix {
            errors.push("server.instance_prefix and server.management_prefix must differ".to_string());
        }
        if self.backend.port_span == 0 {
            errors.push("backend.port_span must be greater than 0".to_string());
        }
        if u32::from(self.backend.port_floor) + u32::from(self.backend.port_span) > 65536 {
            errors.push(format!(
                "backend port range {}+{} exceeds 65535",
                self.backend.port_floor, self.backend.port_span
            ));
        }
        if !valid_segment(&self.backend.socket_path) {
            errors.push("backend.socket_path must be a single non-empty path segment".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
