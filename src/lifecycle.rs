//! Instance activation and queries
//!
//! `InstanceManager` is what the management layer talks to. It ties the
//! supervisor, the license pool and the backend client together and owns the
//! per-slug locks that keep activation and deactivation of one instance from
//! interleaving.

use crate::license::{Assignment, LicenseError, LicensePool, Occupancy};
use crate::model::{CompanionUser, Instance, License, GAMEMASTER_ROLE, PLAYER_ROLE};
use crate::process::{clear_unmatched_license, ProcessSupervisor, RouteTable, SupervisorError};
use crate::state::{BackendClient, BackendSession, InstanceState};
use crate::store::InstanceStore;
use anyhow::Context;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Polls while waiting for a shut down world to reach the setup screen
const WORLD_SETTLE_TRIES: usize = 10;
const WORLD_SETTLE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),
    #[error("instance '{0}' has no backend version assigned")]
    NoVersion(String),
    #[error("no license available for '{0}'")]
    NoLicense(String),
    #[error("backend for '{0}' did not become ready")]
    NotReady(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ActivationError {
    /// Expected reasons an activation does not happen, reported as `false`
    fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::NoVersion(_) | Self::NoLicense(_) | Self::NotReady(_) | Self::Supervisor(_)
        )
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// The companion to register for the session owner reported in join data.
/// Only the first listed user is considered, and only when privileged and
/// nobody is registered for that world yet.
pub fn session_owner(instance: &Instance, join_info: &Value) -> Option<CompanionUser> {
    let world_id = join_info.pointer("/world/id").and_then(Value::as_str)?;
    if instance.privileged_companion(world_id).is_some() {
        return None;
    }
    let candidate = join_info.get("users")?.get(0)?;
    if candidate.get("role").and_then(Value::as_u64) != Some(GAMEMASTER_ROLE) {
        return None;
    }
    Some(CompanionUser {
        id: None,
        world_id: world_id.to_string(),
        user_id: candidate.get("_id").and_then(Value::as_str)?.to_string(),
        user_name: candidate
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        password: String::new(),
        privileged: true,
    })
}

pub struct InstanceManager {
    store: Arc<dyn InstanceStore>,
    supervisor: Arc<ProcessSupervisor>,
    licenses: LicensePool,
    backend: BackendClient,
    slug_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> anyhow::Result<Arc<Self>> {
        let backend = BackendClient::new(supervisor.config(), supervisor.instance_prefix())?;
        Ok(Arc::new(Self {
            licenses: LicensePool::new(store.clone()),
            store,
            supervisor,
            backend,
            slug_locks: DashMap::new(),
        }))
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    fn slug_lock(&self, slug: &str) -> Arc<Mutex<()>> {
        self.slug_locks.entry(slug.to_string()).or_default().clone()
    }

    fn instance(&self, slug: &str) -> Result<Instance, ActivationError> {
        self.store
            .lookup_instance_by_slug(slug)?
            .ok_or_else(|| ActivationError::UnknownInstance(slug.to_string()))
    }

    /// Start the backend for `slug`. True when it is live afterwards.
    ///
    /// Returns false with a logged reason when no license can be had, the
    /// port range is exhausted, or the backend never becomes ready.
    pub async fn activate(&self, slug: &str) -> Result<bool, ActivationError> {
        let lock = self.slug_lock(slug);
        let _guard = lock.lock().await;

        self.ensure_live(slug).await
    }

    /// Start the backend unless it is already live. The caller holds the slug lock.
    async fn ensure_live(&self, slug: &str) -> Result<bool, ActivationError> {
        if self.supervisor.is_live(slug) {
            debug!(slug, "Instance already active");
            return Ok(true);
        }

        match self.start(slug).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_refusal() => {
                warn!(slug, reason = %e, "Activation aborted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn start(&self, slug: &str) -> Result<(), ActivationError> {
        let instance = self.instance(slug)?;
        if instance.version.is_none() {
            return Err(ActivationError::NoVersion(slug.to_string()));
        }

        // Held until the backend is ready, so no other activation plans
        // against a holder that is bound but not yet live or answering
        let pool = self.licenses.lock().await;
        let license = self
            .assign_license(slug)
            .await?
            .ok_or_else(|| ActivationError::NoLicense(slug.to_string()))?;

        let data_dir = self.supervisor.data_dir(slug);
        match clear_unmatched_license(&data_dir, Some(&license)) {
            Ok(true) => info!(slug, "Removed on-disk license with a different key"),
            Ok(false) => {}
            Err(e) => warn!(slug, error = %e, "Failed to check on-disk license"),
        }

        let process = self.supervisor.spawn(&instance).await?;
        let timeout = self.supervisor.config().startup_timeout();
        if !self.supervisor.wait_until_ready(slug, timeout).await {
            self.supervisor.terminate(slug).await;
            return Err(ActivationError::NotReady(slug.to_string()));
        }
        drop(pool);

        self.complete_license_flow(&instance, &license, process.port).await;
        info!(slug, port = process.port, "Instance activated");
        Ok(())
    }

    /// Enter the bound key and accept the EULA when the backend asks for them
    /// and the instance allows it. Best effort.
    async fn complete_license_flow(&self, instance: &Instance, license: &License, port: u16) {
        let slug = instance.slug.as_str();
        let mut state = self.backend.probe(port, slug).await;

        if state == InstanceState::License {
            let form = [("licenseKey", license.key.as_str()), ("action", "enterKey")];
            match self.backend.post_form(port, slug, "license", &form).await {
                Ok(true) => info!(slug, "Submitted license key"),
                Ok(false) => warn!(slug, "Backend rejected license key"),
                Err(e) => warn!(slug, error = %e, "Failed to submit license key"),
            }
            state = self.backend.probe(port, slug).await;
        }

        if state == InstanceState::LicenseEula {
            if !instance.eula_accepted {
                info!(slug, "EULA not yet accepted for this instance");
                return;
            }
            match self.backend.post_form(port, slug, "license", &[("accept", "on")]).await {
                Ok(true) => info!(slug, "Accepted EULA on behalf of instance"),
                Ok(false) => warn!(slug, "Backend rejected EULA acceptance"),
                Err(e) => warn!(slug, error = %e, "Failed to accept EULA"),
            }
        }
    }

    /// Find a license for `slug`, reclaiming one from an idle instance if needed.
    /// The caller holds the pool lock.
    async fn assign_license(&self, slug: &str) -> Result<Option<License>, ActivationError> {
        let license = match self.licenses.plan(slug, self).await? {
            Assignment::AlreadyHeld(license) => license,
            Assignment::Free(license) => self.licenses.bind(license, slug)?,
            Assignment::Reclaim { license, from } => {
                info!(slug, from = %from, key = %license.key, "Reclaiming license from idle instance");
                // The idle holder's own lock is not taken here; its
                // activation may be waiting on the pool lock we hold.
                self.supervisor.terminate(&from).await;
                self.licenses.bind(license, slug)?
            }
            Assignment::Unavailable => return Ok(None),
        };
        Ok(Some(license))
    }

    pub async fn assign_license_if_able(&self, slug: &str) -> Result<bool, ActivationError> {
        self.instance(slug)?;
        let _pool = self.licenses.lock().await;
        Ok(self.assign_license(slug).await?.is_some())
    }

    pub fn register_license(&self, key: &str, name: &str) -> Result<License, LicenseError> {
        self.licenses.register(key, name)
    }

    pub fn licenses(&self) -> anyhow::Result<Vec<License>> {
        self.licenses.list()
    }

    /// Clear the binding of the license `slug` holds
    pub async fn release_license(&self, slug: &str) -> anyhow::Result<bool> {
        let _pool = self.licenses.lock().await;
        self.licenses.release(slug)
    }

    /// Stop the backend for `slug`. The license binding stays.
    pub async fn deactivate(&self, slug: &str) -> bool {
        let lock = self.slug_lock(slug);
        let _guard = lock.lock().await;

        let was_live = self.supervisor.is_live(slug);
        self.supervisor.terminate(slug).await;
        if was_live {
            info!(slug, "Instance deactivated");
        }
        was_live
    }

    pub fn is_active(&self, slug: &str) -> bool {
        self.supervisor.is_live(slug)
    }

    pub async fn state(&self, slug: &str) -> InstanceState {
        match self.supervisor.port_of(slug) {
            Some(port) => self.backend.probe(port, slug).await,
            None => InstanceState::Inactive,
        }
    }

    /// Join data of the running world, only while in `Join` state
    async fn join_data(&self, instance: &Instance) -> Option<Value> {
        let slug = instance.slug.as_str();
        let port = self.supervisor.port_of(slug)?;
        if self.backend.probe(port, slug).await != InstanceState::Join {
            return None;
        }
        let event = match instance.major_version() {
            Some(major) if major <= 8 => "getSetupData",
            _ => "getJoinData",
        };
        self.backend
            .query(port, slug, event)
            .await
            .filter(Value::is_object)
    }

    /// Session info of the running world, or an empty object.
    /// Registers the world's game master as a companion on first sight.
    pub async fn get_join_info(&self, slug: &str) -> anyhow::Result<Value> {
        let Some(instance) = self.store.lookup_instance_by_slug(slug)? else {
            return Ok(empty_object());
        };
        let Some(join_info) = self.join_data(&instance).await else {
            return Ok(empty_object());
        };

        if let Some(companion) = session_owner(&instance, &join_info) {
            info!(
                slug,
                world_id = %companion.world_id,
                user_id = %companion.user_id,
                "Registering session owner"
            );
            self.store.add_companion(slug, &companion)?;
        }
        Ok(join_info)
    }

    /// Setup data regardless of state, or an empty object
    pub async fn get_setup_info(&self, slug: &str) -> Value {
        let Some(port) = self.supervisor.port_of(slug) else {
            return empty_object();
        };
        self.backend
            .query(port, slug, "getSetupData")
            .await
            .filter(Value::is_object)
            .unwrap_or_else(empty_object)
    }

    /// Poll until the backend reports `wanted`, giving up after a few tries
    async fn settle(&self, port: u16, slug: &str, wanted: InstanceState) -> InstanceState {
        let mut state = self.backend.probe(port, slug).await;
        for _ in 0..WORLD_SETTLE_TRIES {
            if state == wanted {
                break;
            }
            tokio::time::sleep(WORLD_SETTLE_INTERVAL).await;
            state = self.backend.probe(port, slug).await;
        }
        state
    }

    /// Log into the setup screen as the instance administrator
    async fn admin_login(&self, session: &BackendSession, instance: &Instance) -> anyhow::Result<bool> {
        let path = match instance.major_version() {
            Some(major) if major <= 8 => "setup",
            _ => "auth",
        };
        let secret = instance.admin_secret.as_str();
        let form = [("adminPassword", secret), ("adminKey", secret), ("action", "adminAuth")];
        session.post_form(path, &form).await
    }

    async fn shutdown_world(&self, instance: &Instance, port: u16) -> bool {
        let slug = instance.slug.as_str();
        let secret = instance.admin_secret.as_str();
        let form = [("adminPassword", secret), ("adminKey", secret), ("action", "shutdown")];
        match self.backend.post_form(port, slug, "join", &form).await {
            Ok(true) => {
                info!(slug, "Shut down running world");
                true
            }
            Ok(false) => {
                warn!(slug, "Backend refused world shutdown");
                false
            }
            Err(e) => {
                warn!(slug, error = %e, "Failed to shut down world");
                false
            }
        }
    }

    /// Return the instance to its setup screen. True when no world is
    /// running afterwards.
    pub async fn deactivate_world(&self, slug: &str) -> bool {
        let Some(port) = self.supervisor.port_of(slug) else {
            return true;
        };
        if self.backend.probe(port, slug).await != InstanceState::Join {
            return true;
        }
        let instance = match self.instance(slug) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(slug, error = %e, "Cannot shut down world");
                return false;
            }
        };
        self.shutdown_world(&instance, port).await
    }

    /// Launch `world_id`, starting the instance first when needed. A different
    /// running world is shut down only when nobody is connected or `force` is set.
    pub async fn activate_world(&self, slug: &str, world_id: &str, force: bool) -> Result<bool, ActivationError> {
        let lock = self.slug_lock(slug);
        let _guard = lock.lock().await;

        if !self.ensure_live(slug).await? {
            return Ok(false);
        }
        let instance = self.instance(slug)?;
        let Some(port) = self.supervisor.port_of(slug) else {
            return Ok(false);
        };

        let mut state = self.backend.probe(port, slug).await;
        if state == InstanceState::Join {
            let running = self
                .join_data(&instance)
                .await
                .and_then(|info| info.pointer("/world/id").and_then(Value::as_str).map(str::to_string));
            if running.as_deref() == Some(world_id) {
                debug!(slug, world_id, "World already running");
                return Ok(true);
            }
            if !force && self.active_user_count(slug).await > 0 {
                info!(slug, world_id, "Running world has players; not switching");
                return Ok(false);
            }
            if !self.shutdown_world(&instance, port).await {
                return Ok(false);
            }
            state = self.settle(port, slug, InstanceState::Setup).await;
        }

        if state != InstanceState::Setup {
            warn!(slug, world_id, ?state, "Backend is not at the setup screen");
            return Ok(false);
        }

        let launched = async {
            let session = self.backend.session(port, slug)?;
            if !self.admin_login(&session, &instance).await? {
                warn!(slug, "Backend refused administrator login");
            }
            session
                .post_form("setup", &[("world", world_id), ("action", "launchWorld")])
                .await
        };
        match launched.await {
            Ok(true) => {
                info!(slug, world_id, "Launched world");
                Ok(true)
            }
            Ok(false) => {
                warn!(slug, world_id, "Backend refused world launch");
                Ok(false)
            }
            Err(e) => {
                warn!(slug, world_id, error = %e, "Failed to launch world");
                Ok(false)
            }
        }
    }

    /// Worlds installed in the instance's data directory, each world's
    /// `world.json` with `id` defaulted to its directory name and an
    /// `active` flag for the running one
    pub async fn worlds(&self, slug: &str) -> anyhow::Result<Vec<Value>> {
        let instance = self.instance(slug).map_err(anyhow::Error::from)?;
        let running = self
            .join_data(&instance)
            .await
            .and_then(|info| info.pointer("/world/id").and_then(Value::as_str).map(str::to_string));
        list_worlds(&self.supervisor.data_dir(slug), running.as_deref())
    }

    /// Bring the companion users of the running world in line with the
    /// backend: record the session owner, refresh names and create players
    /// that do not exist there yet. Returns how many were created.
    pub async fn sync_world(&self, slug: &str) -> anyhow::Result<usize> {
        let Some(instance) = self.store.lookup_instance_by_slug(slug)? else {
            anyhow::bail!("unknown instance '{slug}'");
        };
        let Some(join_info) = self.join_data(&instance).await else {
            return Ok(0);
        };
        let Some(world_id) = join_info.pointer("/world/id").and_then(Value::as_str) else {
            return Ok(0);
        };
        if let Some(owner) = session_owner(&instance, &join_info) {
            info!(slug, world_id, user_id = %owner.user_id, "Registering session owner");
            self.store.add_companion(slug, &owner)?;
        }

        let instance = self.instance(slug).map_err(anyhow::Error::from)?;
        let Some(owner) = instance.privileged_companion(world_id).cloned() else {
            debug!(slug, world_id, "No session owner to act as");
            return Ok(0);
        };
        let Some(port) = self.supervisor.port_of(slug) else {
            return Ok(0);
        };

        let session = self.backend.session(port, slug)?;
        let form = [
            ("userid", owner.user_id.as_str()),
            ("password", owner.password.as_str()),
            ("adminPassword", ""),
            ("action", "join"),
        ];
        if !session.post_form("join", &form).await? {
            warn!(slug, world_id, "Backend refused session owner login");
            return Ok(0);
        }

        let timeout = self.backend.query_timeout();
        let mut socket = tokio::time::timeout(timeout, session.open_socket())
            .await
            .context("Timed out opening backend socket")??;
        let players_event = match instance.major_version() {
            Some(major) if major <= 8 => "getSetupData",
            _ => "getPlayersData",
        };
        let players = tokio::time::timeout(timeout, socket.call(players_event, Vec::new()))
            .await
            .context("Timed out listing world users")??
            .unwrap_or_default();
        let known: HashMap<&str, &Value> = players
            .get("users")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|user| Some((user.get("_id")?.as_str()?, user)))
            .collect();

        let mut created = 0;
        for companion in instance
            .companions
            .iter()
            .filter(|c| !c.privileged && c.world_id == world_id)
        {
            let Some(id) = companion.id else {
                continue;
            };
            if let Some(user) = known.get(companion.user_id.as_str()) {
                let name = user.get("name").and_then(Value::as_str).unwrap_or_default();
                if !name.is_empty() && name != companion.user_name {
                    self.store.update_companion(id, &companion.user_id, name)?;
                }
                continue;
            }

            let reply = match tokio::time::timeout(
                timeout,
                socket.call("modifyDocument", vec![create_user_message(companion)]),
            )
            .await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!(slug, user = %companion.user_name, error = %e, "User creation failed");
                    break;
                }
                Err(_) => {
                    warn!(slug, user = %companion.user_name, "User creation timed out");
                    continue;
                }
            };
            let new_id = reply
                .as_ref()
                .and_then(|reply| reply.pointer("/result/0/_id"))
                .and_then(Value::as_str);
            if let Some(new_id) = new_id {
                info!(slug, world_id, user = %companion.user_name, user_id = new_id, "Created companion user");
                self.store.update_companion(id, new_id, &companion.user_name)?;
                created += 1;
            }
        }
        socket.close().await;
        Ok(created)
    }

    /// Stop every backend
    pub async fn shutdown(&self) {
        info!("Stopping all backends");
        self.supervisor.stop_all().await;
    }
}

/// `modifyDocument` payload creating `companion` as a player
pub fn create_user_message(companion: &CompanionUser) -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    json!({
        "type": "User",
        "action": "create",
        "operation": {
            "data": [{
                "name": companion.user_name,
                "role": PLAYER_ROLE,
                "_id": null,
                "password": companion.password,
                "avatar": null,
                "character": null,
                "color": "#bf28cc",
                "pronouns": "",
                "hotbar": {},
                "permissions": {},
                "flags": {}
            }],
            "options": {"temporary": false, "renderSheet": false, "render": true},
            "parent": null,
            "modifiedTime": now,
            "render": true,
            "renderSheet": false
        }
    })
}

/// Read `<data_dir>/Data/worlds/*/world.json`, sorted by directory name
pub fn list_worlds(data_dir: &Path, running: Option<&str>) -> anyhow::Result<Vec<Value>> {
    let worlds_dir = data_dir.join("Data").join("worlds");
    if !worlds_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = std::fs::read_dir(&worlds_dir)
        .with_context(|| format!("Failed to read {}", worlds_dir.display()))?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    let mut worlds = Vec::new();
    for entry in entries {
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let manifest = entry.path().join("world.json");
        let Ok(text) = std::fs::read_to_string(&manifest) else {
            continue;
        };
        let mut world = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(world)) => world,
            _ => {
                warn!(path = %manifest.display(), "Skipping unreadable world manifest");
                continue;
            }
        };
        if !world.get("id").and_then(Value::as_str).is_some_and(|id| !id.is_empty()) {
            world.insert("id".to_string(), Value::String(dir_name.clone()));
        }
        world.insert("active".to_string(), Value::Bool(running == Some(dir_name.as_str())));
        worlds.push(Value::Object(world));
    }
    Ok(worlds)
}

impl Occupancy for InstanceManager {
    fn is_active(&self, slug: &str) -> bool {
        self.supervisor.is_live(slug)
    }

    async fn active_user_count(&self, slug: &str) -> usize {
        let instance = match self.store.lookup_instance_by_slug(slug) {
            Ok(Some(instance)) => instance,
            _ => return 0,
        };
        self.join_data(&instance)
            .await
            .and_then(|info| info.get("activeUsers").and_then(Value::as_array).map(Vec::len))
            .unwrap_or(0)
    }
}
