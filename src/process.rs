use crate::config::BackendConfig;
use crate::model::{Instance, License};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Looks up the private port of a live instance by slug
pub trait RouteTable: Send + Sync {
    fn port_of(&self, slug: &str) -> Option<u16>;
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("instance '{0}' has no backend version assigned")]
    NoVersion(String),
    #[error("backend executable not found at {0}")]
    MissingExecutable(PathBuf),
    #[error("instance '{0}' already has a live backend")]
    AlreadyRunning(String),
    #[error("no free port in range {floor}..{end}")]
    NoFreePort { floor: u16, end: u32 },
    #[error("failed to write backend config for '{slug}': {source}")]
    Config {
        slug: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn backend for '{slug}': {source}")]
    Spawn {
        slug: String,
        #[source]
        source: std::io::Error,
    },
}

/// Hands out the lowest port at or above a floor that no live backend holds
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    floor: u16,
    span: u16,
}

impl PortAllocator {
    pub fn new(floor: u16, span: u16) -> Self {
        Self { floor, span }
    }

    pub fn allocate(&self, taken: &HashSet<u16>) -> Result<u16, SupervisorError> {
        let end = (u32::from(self.floor) + u32::from(self.span)).min(65536);
        (u32::from(self.floor)..end)
            .map(|port| port as u16)
            .find(|port| !taken.contains(port))
            .ok_or(SupervisorError::NoFreePort {
                floor: self.floor,
                end,
            })
    }
}

/// A live backend child process
struct BackendProcess {
    child: Child,
    host: String,
    port: u16,
    data_dir: PathBuf,
    args: Vec<String>,
    started_at: Instant,
}

/// Snapshot of a live backend for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub slug: String,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub data_dir: PathBuf,
    pub args: Vec<String>,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct ProcessTable {
    live: HashMap<String, BackendProcess>,
    /// Ports handed out to spawns still in progress
    reserved: HashMap<String, u16>,
}

impl ProcessTable {
    fn taken_ports(&self) -> HashSet<u16> {
        self.live
            .values()
            .map(|p| p.port)
            .chain(self.reserved.values().copied())
            .collect()
    }

    /// Drop entries whose process already exited
    fn reap(&mut self) {
        self.live.retain(|slug, process| match process.child.try_wait() {
            Ok(Some(status)) => {
                warn!(slug = %slug, port = process.port, ?status, "Backend process exited unexpectedly");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(slug = %slug, error = %e, "Failed to poll backend process");
                true
            }
        });
    }
}

/// Write `port` and `routePrefix` into the backend's `Config/options.json`,
/// keeping every other option already there, and drop any stale `admin.txt`.
pub fn inject_config(data_dir: &Path, port: u16, route_prefix: &str) -> std::io::Result<()> {
    let config_dir = data_dir.join("Config");
    std::fs::create_dir_all(&config_dir)?;

    let options_path = config_dir.join("options.json");
    let mut options = match std::fs::read_to_string(&options_path) {
        Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => {
                warn!(path = %options_path.display(), "Replacing unreadable backend options");
                serde_json::Map::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
        Err(e) => return Err(e),
    };
    options.insert("port".to_string(), port.into());
    options.insert("routePrefix".to_string(), route_prefix.into());

    let body = serde_json::to_string_pretty(&serde_json::Value::Object(options))?;
    std::fs::write(&options_path, body)?;

    let admin_path = config_dir.join("admin.txt");
    match std::fs::remove_file(&admin_path) {
        Ok(()) => debug!(path = %admin_path.display(), "Removed stale admin password file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Remove `Config/license.json` when it holds a key other than `license`.
/// Returns true if the file was removed.
pub fn clear_unmatched_license(data_dir: &Path, license: Option<&License>) -> std::io::Result<bool> {
    let path = data_dir.join("Config").join("license.json");
    let stored = match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str::<serde_json::Value>(&content)
            .ok()
            .and_then(|v| v.get("license").and_then(|k| k.as_str()).map(str::to_string)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let expected = license.map(License::compact_key);
    if stored.is_some() && stored == expected {
        return Ok(false);
    }
    std::fs::remove_file(&path)?;
    Ok(true)
}

/// Manages the live set of backend processes.
///
/// `new` returns `Arc<Self>`; the supervisor is shared by the gateway (as
/// its route table), the lifecycle manager and the admin API.
pub struct ProcessSupervisor {
    config: BackendConfig,
    instance_prefix: String,
    allocator: PortAllocator,
    table: Mutex<ProcessTable>,
}

impl ProcessSupervisor {
    pub fn new(config: BackendConfig, instance_prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            allocator: PortAllocator::new(config.port_floor, config.port_span),
            config,
            instance_prefix: instance_prefix.to_string(),
            table: Mutex::new(ProcessTable::default()),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn instance_prefix(&self) -> &str {
        &self.instance_prefix
    }

    pub fn executable_path(&self, version: &str) -> PathBuf {
        self.config
            .releases_dir
            .join(version)
            .join("resources")
            .join("app")
            .join("main.js")
    }

    pub fn data_dir(&self, slug: &str) -> PathBuf {
        self.config.data_root.join(slug)
    }

    fn reserve_port(&self, slug: &str) -> Result<u16, SupervisorError> {
        let mut table = self.table.lock();
        table.reap();
        if table.live.contains_key(slug) || table.reserved.contains_key(slug) {
            return Err(SupervisorError::AlreadyRunning(slug.to_string()));
        }
        let port = self.allocator.allocate(&table.taken_ports())?;
        table.reserved.insert(slug.to_string(), port);
        Ok(port)
    }

    /// Start a backend for `instance` on the next free port
    pub async fn spawn(&self, instance: &Instance) -> Result<ProcessInfo, SupervisorError> {
        let slug = instance.slug.as_str();
        let version = instance
            .version
            .as_deref()
            .ok_or_else(|| SupervisorError::NoVersion(slug.to_string()))?;
        let executable = self.executable_path(version);
        if !executable.is_file() {
            return Err(SupervisorError::MissingExecutable(executable));
        }

        let port = self.reserve_port(slug)?;
        let result = self.launch(instance, &executable, port).await;
        let mut table = self.table.lock();
        table.reserved.remove(slug);

        let process = result?;
        let info = Self::info(slug, &process);
        table.live.insert(slug.to_string(), process);
        Ok(info)
    }

    async fn launch(
        &self,
        instance: &Instance,
        executable: &Path,
        port: u16,
    ) -> Result<BackendProcess, SupervisorError> {
        let slug = instance.slug.as_str();
        let data_dir = self.data_dir(slug);
        inject_config(&data_dir, port, &instance.route_prefix(&self.instance_prefix)).map_err(
            |source| SupervisorError::Config {
                slug: slug.to_string(),
                source,
            },
        )?;

        let args = vec![
            format!("--dataPath={}", data_dir.display()),
            "--noupdate".to_string(),
            format!("--adminPassword={}", instance.admin_secret),
            format!("--adminKey={}", instance.admin_secret),
        ];

        let mut cmd = match self.config.launcher.as_deref().filter(|l| !l.is_empty()) {
            Some(launcher) => {
                let mut cmd = Command::new(launcher);
                cmd.arg(executable);
                cmd
            }
            None => Command::new(executable),
        };
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        info!(slug, port, executable = %executable.display(), "Starting backend");

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            slug: slug.to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(slug, pid, port, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(slug.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(slug.to_string(), "stderr", stderr);
        }

        Ok(BackendProcess {
            child,
            host: self.config.host.clone(),
            port,
            data_dir,
            args,
            started_at: Instant::now(),
        })
    }

    fn info(slug: &str, process: &BackendProcess) -> ProcessInfo {
        ProcessInfo {
            slug: slug.to_string(),
            host: process.host.clone(),
            port: process.port,
            pid: process.child.id(),
            data_dir: process.data_dir.clone(),
            // The admin secret never leaves the process table
            args: process
                .args
                .iter()
                .map(|arg| match arg.split_once('=') {
                    Some((flag, _)) if flag == "--adminPassword" || flag == "--adminKey" => {
                        format!("{flag}=***")
                    }
                    _ => arg.clone(),
                })
                .collect(),
            uptime_secs: process.started_at.elapsed().as_secs(),
        }
    }

    /// Poll the instance base URL until the backend answers HTTP.
    /// False if it exits or `timeout` passes first.
    pub async fn wait_until_ready(&self, slug: &str, timeout: Duration) -> bool {
        let path = format!("/{}/{}", self.instance_prefix, slug);
        let start = Instant::now();

        while start.elapsed() < timeout {
            let Some(port) = self.port_of(slug) else {
                warn!(slug, "Backend exited before becoming ready");
                return false;
            };
            if check_http(&self.config.host, port, &path).await {
                info!(slug, port, startup_ms = start.elapsed().as_millis(), "Backend is ready");
                return true;
            }
            tokio::time::sleep(self.config.ready_check_interval()).await;
        }

        warn!(slug, timeout_secs = timeout.as_secs(), "Backend startup timeout");
        false
    }

    /// Stop a backend: SIGTERM, bounded wait, then SIGKILL.
    /// The table entry is removed first and failures are only logged.
    pub async fn terminate(&self, slug: &str) {
        let Some(mut process) = self.table.lock().live.remove(slug) else {
            return;
        };
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = process.child.id() {
            info!(slug, pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = process.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(slug, ?status, "Backend process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(slug, error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    slug,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                if let Err(e) = process.child.kill().await {
                    error!(slug, error = %e, "Failed to kill backend process");
                }
            }
        }
    }

    /// Stop every live backend
    pub async fn stop_all(&self) {
        let slugs = self.live_slugs();
        let stops = slugs.iter().map(|slug| self.terminate(slug));
        futures::future::join_all(stops).await;
    }

    pub fn is_live(&self, slug: &str) -> bool {
        let mut table = self.table.lock();
        table.reap();
        table.live.contains_key(slug)
    }

    pub fn live_slugs(&self) -> Vec<String> {
        let mut table = self.table.lock();
        table.reap();
        let mut slugs: Vec<String> = table.live.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut table = self.table.lock();
        table.reap();
        let mut infos: Vec<ProcessInfo> = table
            .live
            .iter()
            .map(|(slug, process)| Self::info(slug, process))
            .collect();
        infos.sort_by(|a, b| a.slug.cmp(&b.slug));
        infos
    }
}

impl RouteTable for ProcessSupervisor {
    fn port_of(&self, slug: &str) -> Option<u16> {
        let mut table = self.table.lock();
        table.reap();
        table.live.get(slug).map(|p| p.port)
    }
}

fn forward_output<R>(slug: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(slug = %slug, stream, "{}", line);
        }
    });
}

/// True once anything answers the path with an HTTP status line
async fn check_http(host: &str, port: u16, path: &str) -> bool {
    let addr = format!("{}:{}", host, port);
    let connect_result =
        tokio::time::timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(&addr)).await;

    let mut stream = match connect_result {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(Duration::from_secs(2), async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // Format: "HTTP/1.1 302 Found\r\n"; redirects and errors still mean the server is up
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .is_some(),
        _ => false,
    }
}
