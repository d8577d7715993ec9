//! Persistence for instances, licenses and companion users
//!
//! The management layer owns these records. The gateway core reads them and
//! writes back the few fields it changes itself: license bindings, the EULA
//! flag and registered companion users.

use crate::model::{CompanionUser, Instance, License};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Record access used by the lifecycle, gateway and admin API
pub trait InstanceStore: Send + Sync {
    fn lookup_instance_by_slug(&self, slug: &str) -> Result<Option<Instance>>;

    /// Insert or update an instance and its companion users
    fn persist_instance(&self, instance: &Instance) -> Result<()>;

    fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Insert or update a license, including its binding
    fn persist_license(&self, license: &License) -> Result<()>;

    /// All licenses in insertion order
    fn licenses(&self) -> Result<Vec<License>>;

    fn license_for(&self, slug: &str) -> Result<Option<License>>;

    /// Set the EULA flag alone. True when it was not set before.
    fn set_eula_accepted(&self, slug: &str) -> Result<bool>;

    /// Add one companion user, leaving the others untouched. False when a
    /// user with the same backend id is already registered for that world.
    fn add_companion(&self, slug: &str, companion: &CompanionUser) -> Result<bool>;

    /// Record the backend id and name of a stored companion
    fn update_companion(&self, id: i64, user_id: &str, user_name: &str) -> Result<()>;
}

/// SQLite-backed store with thread-safe access
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                slug TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                display_name TEXT,
                version TEXT,
                admin_secret TEXT NOT NULL,
                eula_accepted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS licenses (
                license_key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                instance_slug TEXT UNIQUE REFERENCES instances(slug) ON DELETE SET NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS companion_users (
                instance_slug TEXT NOT NULL REFERENCES instances(slug) ON DELETE CASCADE,
                world_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                privileged INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (instance_slug, world_id, user_id)
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: companion rows get their own id and a password, so
    /// players not yet created in the backend can be stored
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: pending companion users");

        conn.execute_batch(
            r#"
            CREATE TABLE companion_users_v2 (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_slug TEXT NOT NULL REFERENCES instances(slug) ON DELETE CASCADE,
                world_id TEXT NOT NULL,
                user_id TEXT NOT NULL DEFAULT '',
                user_name TEXT NOT NULL,
                password TEXT NOT NULL DEFAULT '',
                privileged INTEGER NOT NULL DEFAULT 0
            );

            INSERT INTO companion_users_v2 (instance_slug, world_id, user_id, user_name, privileged)
                SELECT instance_slug, world_id, user_id, user_name, privileged
                FROM companion_users ORDER BY rowid;

            DROP TABLE companion_users;
            ALTER TABLE companion_users_v2 RENAME TO companion_users;

            CREATE UNIQUE INDEX IF NOT EXISTS idx_companion_users_backend_id
                ON companion_users(instance_slug, world_id, user_id) WHERE user_id != '';

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    fn insert_companion(conn: &Connection, slug: &str, companion: &CompanionUser) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT OR IGNORE INTO companion_users
                (id, instance_slug, world_id, user_id, user_name, password, privileged)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                companion.id,
                slug,
                companion.world_id,
                companion.user_id,
                companion.user_name,
                companion.password,
                companion.privileged
            ],
        )
    }

    fn companions(conn: &Connection, slug: &str) -> Result<Vec<CompanionUser>> {
        let mut stmt = conn.prepare(
            "SELECT id, world_id, user_id, user_name, password, privileged
             FROM companion_users WHERE instance_slug = ?1 ORDER BY id",
        )?;
        let companions = stmt
            .query_map(params![slug], |row| {
                Ok(CompanionUser {
                    id: row.get(0)?,
                    world_id: row.get(1)?,
                    user_id: row.get(2)?,
                    user_name: row.get(3)?,
                    password: row.get(4)?,
                    privileged: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(companions)
    }

    fn instance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
        Ok(Instance {
            slug: row.get(0)?,
            name: row.get(1)?,
            display_name: row.get(2)?,
            version: row.get(3)?,
            admin_secret: row.get(4)?,
            eula_accepted: row.get(5)?,
            companions: Vec::new(),
        })
    }

    fn license_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<License> {
        Ok(License {
            key: row.get(0)?,
            name: row.get(1)?,
            instance: row.get(2)?,
        })
    }
}

impl InstanceStore for SqliteStore {
    fn lookup_instance_by_slug(&self, slug: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock();
        let instance = conn
            .query_row(
                "SELECT slug, name, display_name, version, admin_secret, eula_accepted
                 FROM instances WHERE slug = ?1",
                params![slug],
                Self::instance_from_row,
            )
            .optional()
            .context("Failed to get instance")?;

        match instance {
            Some(mut instance) => {
                instance.companions = Self::companions(&conn, slug)?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    fn persist_instance(&self, instance: &Instance) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO instances (slug, name, display_name, version, admin_secret, eula_accepted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                display_name = excluded.display_name,
                version = excluded.version,
                admin_secret = excluded.admin_secret,
                eula_accepted = excluded.eula_accepted",
            params![
                instance.slug,
                instance.name,
                instance.display_name,
                instance.version,
                instance.admin_secret,
                instance.eula_accepted
            ],
        )?;
        tx.execute(
            "DELETE FROM companion_users WHERE instance_slug = ?1",
            params![instance.slug],
        )?;
        for companion in &instance.companions {
            Self::insert_companion(&tx, &instance.slug, companion)?;
        }
        tx.commit().context("Failed to persist instance")?;
        Ok(())
    }

    fn list_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT slug, name, display_name, version, admin_secret, eula_accepted
             FROM instances ORDER BY slug",
        )?;
        let mut instances = stmt
            .query_map([], Self::instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for instance in &mut instances {
            instance.companions = Self::companions(&conn, &instance.slug)?;
        }
        Ok(instances)
    }

    fn persist_license(&self, license: &License) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO licenses (license_key, name, instance_slug) VALUES (?1, ?2, ?3)
             ON CONFLICT(license_key) DO UPDATE SET
                name = excluded.name,
                instance_slug = excluded.instance_slug",
            params![license.key, license.name, license.instance],
        )
        .context("Failed to persist license")?;
        Ok(())
    }

    fn licenses(&self) -> Result<Vec<License>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT license_key, name, instance_slug FROM licenses ORDER BY rowid")?;
        let licenses = stmt
            .query_map([], Self::license_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(licenses)
    }

    fn license_for(&self, slug: &str) -> Result<Option<License>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT license_key, name, instance_slug FROM licenses WHERE instance_slug = ?1",
            params![slug],
            Self::license_from_row,
        )
        .optional()
        .context("Failed to get license")
    }

    fn set_eula_accepted(&self, slug: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE instances SET eula_accepted = 1 WHERE slug = ?1 AND eula_accepted = 0",
                params![slug],
            )
            .context("Failed to record EULA acceptance")?;
        Ok(changed > 0)
    }

    fn add_companion(&self, slug: &str, companion: &CompanionUser) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = Self::insert_companion(&conn, slug, companion).context("Failed to add companion user")?;
        Ok(inserted > 0)
    }

    fn update_companion(&self, id: i64, user_id: &str, user_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE companion_users SET user_id = ?2, user_name = ?3 WHERE id = ?1",
            params![id, user_id, user_name],
        )
        .context("Failed to update companion user")?;
        Ok(())
    }
}
