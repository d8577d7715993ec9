//! Integration tests for activation, license arbitration and backend queries
//!
//! Backends are `sh` running a script that sleeps; the fake backend is bound
//! in advance on the single port the supervisor may hand out, so whichever
//! instance is live answers through it.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use vttgate::config::BackendConfig;
use vttgate::lifecycle::{ActivationError, InstanceManager};
use vttgate::model::{CompanionUser, Instance, License};
use vttgate::process::{ProcessSupervisor, RouteTable};
use vttgate::state::InstanceState;
use vttgate::store::{InstanceStore, SqliteStore};

const KEY: &str = "ABCD-EFGH-JKLM-NPQR-STUV-WXYZ";
const VERSION: &str = "11.315";

struct Harness {
    manager: Arc<InstanceManager>,
    store: Arc<dyn InstanceStore>,
    backend: FakeBackend,
    _root: tempfile::TempDir,
}

impl Harness {
    async fn new(landing: Landing) -> Self {
        let root = tempfile::tempdir().unwrap();
        fake_release(root.path(), VERSION, "exec sleep 30\n");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = FakeBackend::serve(listener, landing);

        let config = BackendConfig {
            launcher: Some("sh".to_string()),
            releases_dir: root.path().join("releases"),
            data_root: root.path().join("data"),
            port_floor: backend.port,
            port_span: 1,
            startup_timeout_secs: 5,
            shutdown_grace_period_secs: 2,
            probe_timeout_secs: 2,
            query_timeout_secs: 3,
            ..BackendConfig::default()
        };

        let store: Arc<dyn InstanceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let supervisor = ProcessSupervisor::new(config, "vtt");
        let manager = InstanceManager::new(Arc::clone(&store), supervisor).unwrap();

        Self {
            manager,
            store,
            backend,
            _root: root,
        }
    }

    fn add_instance(&self, slug: &str) -> Instance {
        let instance = Instance::new(slug, slug).with_version(VERSION);
        self.store.persist_instance(&instance).unwrap();
        instance
    }

    fn add_license(&self) {
        self.store.persist_license(&License::new(KEY, "Main")).unwrap();
    }

    fn holder(&self) -> Option<String> {
        self.store
            .licenses()
            .unwrap()
            .into_iter()
            .find(|license| license.key == KEY)
            .and_then(|license| license.instance)
    }
}

// ============================================================================
// Activation
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_activate_spawns_on_allocated_port() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_license();

    assert!(harness.manager.activate("bob").await.unwrap());
    assert!(harness.manager.is_active("bob"));
    assert_eq!(harness.manager.supervisor().port_of("bob"), Some(harness.backend.port));
    assert_eq!(harness.holder().as_deref(), Some("bob"));

    let options = std::fs::read_to_string(
        harness.manager.supervisor().data_dir("bob").join("Config").join("options.json"),
    )
    .unwrap();
    let options: serde_json::Value = serde_json::from_str(&options).unwrap();
    assert_eq!(options["port"], harness.backend.port);
    assert_eq!(options["routePrefix"], "vtt/bob");

    // A second activation is a no-op
    assert!(harness.manager.activate("bob").await.unwrap());

    harness.manager.shutdown().await;
    assert!(!harness.manager.is_active("bob"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_activate_without_license_is_refused() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");

    assert!(!harness.manager.activate("bob").await.unwrap());
    assert!(!harness.manager.is_active("bob"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_activate_unknown_instance_is_an_error() {
    let harness = Harness::new(Landing::Join).await;
    let result = harness.manager.activate("ghost").await;
    assert!(matches!(result, Err(ActivationError::UnknownInstance(slug)) if slug == "ghost"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_holder_is_evicted() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_instance("alice");
    harness.add_license();

    assert!(harness.manager.activate("bob").await.unwrap());
    harness.backend.state.active_users.store(0, Ordering::SeqCst);

    assert!(harness.manager.activate("alice").await.unwrap());
    assert!(harness.manager.is_active("alice"));
    assert!(!harness.manager.is_active("bob"));
    assert_eq!(harness.holder().as_deref(), Some("alice"));
    assert_eq!(harness.manager.supervisor().port_of("alice"), Some(harness.backend.port));

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_holder_keeps_license() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_instance("alice");
    harness.add_license();

    assert!(harness.manager.activate("bob").await.unwrap());
    harness.backend.state.active_users.store(2, Ordering::SeqCst);

    assert!(!harness.manager.activate("alice").await.unwrap());
    assert!(harness.manager.is_active("bob"));
    assert!(!harness.manager.is_active("alice"));
    assert_eq!(harness.holder().as_deref(), Some("bob"));

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_activations_share_one_license() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_instance("alice");
    harness.add_license();
    harness.backend.state.active_users.store(2, Ordering::SeqCst);

    let (bob, alice) = tokio::join!(harness.manager.activate("bob"), harness.manager.activate("alice"));
    let (bob, alice) = (bob.unwrap(), alice.unwrap());
    assert!(bob ^ alice, "bob={bob} alice={alice}");

    let live: Vec<&str> = ["bob", "alice"]
        .into_iter()
        .filter(|slug| harness.manager.is_active(slug))
        .collect();
    assert_eq!(live.len(), 1, "live: {live:?}");
    assert_eq!(harness.holder().as_deref(), Some(live[0]));

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deactivate_keeps_license_binding() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_license();

    assert!(harness.manager.activate("bob").await.unwrap());
    assert!(harness.manager.deactivate("bob").await);
    assert!(!harness.manager.deactivate("bob").await);
    assert_eq!(harness.holder().as_deref(), Some("bob"));
    assert_eq!(harness.manager.state("bob").await, InstanceState::Inactive);

    assert!(harness.manager.release_license("bob").await.unwrap());
    assert_eq!(harness.holder(), None);
}

// ============================================================================
// License and EULA flow
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_license_key_and_eula_are_submitted() {
    let harness = Harness::new(Landing::LicenseForm).await;
    let mut instance = harness.add_instance("bob");
    instance.eula_accepted = true;
    harness.store.persist_instance(&instance).unwrap();
    harness.add_license();

    assert!(harness.manager.activate("bob").await.unwrap());

    let posts = harness.backend.state.posts_to("license");
    assert_eq!(posts.len(), 2, "posts: {posts:?}");
    assert!(posts[0].contains(&format!("licenseKey={KEY}")));
    assert!(posts[0].contains("action=enterKey"));
    assert_eq!(posts[1], "accept=on");
    assert_eq!(harness.manager.state("bob").await, InstanceState::Setup);

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_eula_waits_for_acceptance() {
    let harness = Harness::new(Landing::LicenseForm).await;
    harness.add_instance("bob");
    harness.add_license();

    assert!(harness.manager.activate("bob").await.unwrap());

    let posts = harness.backend.state.posts_to("license");
    assert_eq!(posts.len(), 1, "posts: {posts:?}");
    assert_eq!(harness.manager.state("bob").await, InstanceState::LicenseEula);

    harness.manager.shutdown().await;
}

// ============================================================================
// Backend queries
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_join_info_registers_session_owner() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_license();
    harness.backend.state.active_users.store(1, Ordering::SeqCst);
    assert!(harness.manager.activate("bob").await.unwrap());

    let info = harness.manager.get_join_info("bob").await.unwrap();
    assert_eq!(info["world"]["id"], "world-1");
    assert_eq!(info["activeUsers"].as_array().unwrap().len(), 1);

    let instance = harness.store.lookup_instance_by_slug("bob").unwrap().unwrap();
    assert_eq!(instance.companions.len(), 1);
    let owner = &instance.companions[0];
    assert_eq!(owner.world_id, "world-1");
    assert_eq!(owner.user_id, "gm1");
    assert_eq!(owner.user_name, "Gamemaster");
    assert!(owner.privileged);

    // Known owners are not registered twice
    harness.manager.get_join_info("bob").await.unwrap();
    let instance = harness.store.lookup_instance_by_slug("bob").unwrap().unwrap();
    assert_eq!(instance.companions.len(), 1);

    let queries = harness.backend.state.socket_queries.lock().clone();
    assert!(queries.iter().all(|q| q.starts_with("session=sess-") && q.ends_with("&EIO=4&transport=websocket")));

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_info_outside_join_state_is_empty() {
    let harness = Harness::new(Landing::Setup).await;
    harness.add_instance("bob");
    harness.add_license();
    assert!(harness.manager.activate("bob").await.unwrap());

    assert_eq!(harness.manager.state("bob").await, InstanceState::Setup);
    let info = harness.manager.get_join_info("bob").await.unwrap();
    assert_eq!(info, serde_json::json!({}));

    // Setup data is answered in any state
    let setup = harness.manager.get_setup_info("bob").await;
    assert_eq!(setup["version"], "11.315");

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_of_running_instance_follows_landing() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_license();
    assert!(harness.manager.activate("bob").await.unwrap());

    assert_eq!(harness.manager.state("bob").await, InstanceState::Join);
    harness.backend.state.set_landing(Landing::Eula);
    assert_eq!(harness.manager.state("bob").await, InstanceState::LicenseEula);
    harness.backend.state.set_landing(Landing::LicenseForm);
    assert_eq!(harness.manager.state("bob").await, InstanceState::License);

    harness.manager.shutdown().await;
    assert_eq!(harness.manager.state("bob").await, InstanceState::Inactive);
    // Give the killed child a moment so the temp dir can be removed cleanly
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Worlds
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_activate_world_from_setup() {
    let harness = Harness::new(Landing::Setup).await;
    let instance = harness.add_instance("bob");
    harness.add_license();

    assert!(harness.manager.activate_world("bob", "w2", false).await.unwrap());
    assert!(harness.manager.is_active("bob"));

    let auth = harness.backend.state.posts_to("auth");
    assert_eq!(
        auth,
        vec![format!(
            "adminPassword={0}&adminKey={0}&action=adminAuth",
            instance.admin_secret
        )]
    );
    assert_eq!(harness.backend.state.posts_to("setup"), vec!["world=w2&action=launchWorld".to_string()]);

    // Login and launch share one session
    let cookies = harness.backend.state.post_cookies.lock().clone();
    assert_eq!(cookies.len(), 2);
    assert!(cookies[0].starts_with("session=sess-"));
    assert_eq!(cookies[0], cookies[1]);

    assert_eq!(harness.manager.state("bob").await, InstanceState::Join);
    assert_eq!(*harness.backend.state.world.lock(), "w2");

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_activate_world_respects_players() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_license();
    harness.backend.state.active_users.store(2, Ordering::SeqCst);

    // The running world is already the requested one
    assert!(harness.manager.activate_world("bob", "world-1", false).await.unwrap());
    assert!(harness.backend.state.posts.lock().is_empty());

    assert!(!harness.manager.activate_world("bob", "w2", false).await.unwrap());
    assert!(harness.backend.state.posts_to("join").is_empty());

    assert!(harness.manager.activate_world("bob", "w2", true).await.unwrap());
    let shutdown = harness.backend.state.posts_to("join");
    assert_eq!(shutdown.len(), 1);
    assert!(shutdown[0].ends_with("&action=shutdown"), "{shutdown:?}");
    assert_eq!(harness.backend.state.posts_to("setup"), vec!["world=w2&action=launchWorld".to_string()]);
    assert_eq!(*harness.backend.state.world.lock(), "w2");

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deactivate_world_returns_to_setup() {
    let harness = Harness::new(Landing::Join).await;
    let instance = harness.add_instance("bob");
    harness.add_license();

    // Nothing running yet
    assert!(harness.manager.deactivate_world("bob").await);

    assert!(harness.manager.activate("bob").await.unwrap());
    assert!(harness.manager.deactivate_world("bob").await);
    assert_eq!(
        harness.backend.state.posts_to("join"),
        vec![format!(
            "adminPassword={0}&adminKey={0}&action=shutdown",
            instance.admin_secret
        )]
    );
    assert_eq!(harness.manager.state("bob").await, InstanceState::Setup);

    // Already at setup: nothing more is posted
    assert!(harness.manager.deactivate_world("bob").await);
    assert_eq!(harness.backend.state.posts_to("join").len(), 1);

    harness.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worlds_listing_marks_running_world() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_license();
    assert!(harness.manager.activate("bob").await.unwrap());

    let worlds_dir = harness.manager.supervisor().data_dir("bob").join("Data").join("worlds");
    for (dir, manifest) in [
        ("world-1", r#"{"title": "First"}"#),
        ("w2", r#"{"id": "w2", "title": "Second"}"#),
        ("broken", "not json"),
    ] {
        std::fs::create_dir_all(worlds_dir.join(dir)).unwrap();
        std::fs::write(worlds_dir.join(dir).join("world.json"), manifest).unwrap();
    }
    std::fs::create_dir_all(worlds_dir.join("empty")).unwrap();
    std::fs::write(worlds_dir.join("stray.txt"), "x").unwrap();

    let worlds = harness.manager.worlds("bob").await.unwrap();
    assert_eq!(worlds.len(), 2);
    assert_eq!(worlds[0]["id"], "w2");
    assert_eq!(worlds[0]["active"], false);
    assert_eq!(worlds[1]["id"], "world-1");
    assert_eq!(worlds[1]["title"], "First");
    assert_eq!(worlds[1]["active"], true);

    harness.manager.shutdown().await;
    let worlds = harness.manager.worlds("bob").await.unwrap();
    assert!(worlds.iter().all(|world| world["active"] == false));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_world_creates_pending_players() {
    let harness = Harness::new(Landing::Join).await;
    harness.add_instance("bob");
    harness.add_license();
    assert!(harness.manager.activate("bob").await.unwrap());

    let pending = CompanionUser::player("world-1", "Rowan");
    harness.store.add_companion("bob", &pending).unwrap();
    let mut renamed = CompanionUser::player("world-1", "Old Name");
    renamed.user_id = "p1".to_string();
    harness.store.add_companion("bob", &renamed).unwrap();
    harness.store.add_companion("bob", &CompanionUser::player("other-world", "Sage")).unwrap();

    assert_eq!(harness.manager.sync_world("bob").await.unwrap(), 1);

    // The session owner logs in to act on the world
    let logins = harness.backend.state.posts_to("join");
    assert_eq!(logins, vec!["userid=gm1&password=&adminPassword=&action=join".to_string()]);

    let documents = harness.backend.state.documents.lock().clone();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0]["type"], "User");
    assert_eq!(documents[0]["action"], "create");
    let user = &documents[0]["operation"]["data"][0];
    assert_eq!(user["name"], "Rowan");
    assert_eq!(user["role"], 1);
    assert_eq!(user["password"], pending.password.as_str());

    let companions = harness.store.lookup_instance_by_slug("bob").unwrap().unwrap().companions;
    let by_name = |name: &str| companions.iter().find(|c| c.user_name == name).cloned();
    assert_eq!(by_name("Gamemaster").unwrap().user_id, "gm1");
    assert_eq!(by_name("Rowan").unwrap().user_id, "user-2");
    assert_eq!(by_name("Player").unwrap().user_id, "p1");
    assert!(by_name("Old Name").is_none());
    assert!(!by_name("Sage").unwrap().is_registered());

    // A second pass has nothing left to create
    assert_eq!(harness.manager.sync_world("bob").await.unwrap(), 0);
    assert_eq!(harness.backend.state.documents.lock().len(), 1);

    harness.manager.shutdown().await;
}
