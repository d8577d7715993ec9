//! Instance, license and companion user records

use rand::RngCore;
use serde::Serialize;

/// Privileged role id reported by the backend for a game master
pub const GAMEMASTER_ROLE: u64 = 4;

/// Role id given to players the gateway creates
pub const PLAYER_ROLE: u64 = 1;

/// A user the system manages inside one backend world
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanionUser {
    /// Row id once stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub world_id: String,
    /// Backend user id; empty until the user exists in the world
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub privileged: bool,
}

impl CompanionUser {
    /// A player still to be created in `world_id`
    pub fn player(world_id: &str, user_name: &str) -> Self {
        Self {
            id: None,
            world_id: world_id.to_string(),
            user_id: String::new(),
            user_name: user_name.to_string(),
            password: generate_admin_secret(),
            privileged: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        !self.user_id.is_empty()
    }
}

/// One logical game session, routed by its slug
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
    pub slug: String,
    pub name: String,
    pub display_name: Option<String>,
    /// Backend release, e.g. "11.315"
    pub version: Option<String>,
    #[serde(skip_serializing)]
    pub admin_secret: String,
    pub eula_accepted: bool,
    pub companions: Vec<CompanionUser>,
}

/// A scarce activation credential
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct License {
    pub key: String,
    pub name: String,
    /// Slug of the instance holding this license
    pub instance: Option<String>,
}

/// 32 random bytes, hex encoded
pub fn generate_admin_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Slugs are single lowercase URL path segments
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 64
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

impl Instance {
    pub fn new(slug: &str, name: &str) -> Self {
        Self {
            slug: slug.to_string(),
            name: name.to_string(),
            display_name: None,
            version: None,
            admin_secret: generate_admin_secret(),
            eula_accepted: false,
            companions: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Backend route prefix, `<instance_prefix>/<slug>`
    pub fn route_prefix(&self, instance_prefix: &str) -> String {
        format!("{}/{}", instance_prefix, self.slug)
    }

    /// Public base path, `/<instance_prefix>/<slug>`
    pub fn base_path(&self, instance_prefix: &str) -> String {
        format!("/{}", self.route_prefix(instance_prefix))
    }

    pub fn major_version(&self) -> Option<u32> {
        self.version.as_deref()?.split('.').next()?.trim().parse().ok()
    }

    pub fn privileged_companion(&self, world_id: &str) -> Option<&CompanionUser> {
        self.companions
            .iter()
            .find(|c| c.privileged && c.world_id == world_id)
    }
}

impl License {
    pub fn new(key: &str, name: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            instance: None,
        }
    }

    /// Key as the backend stores it in `license.json`
    pub fn compact_key(&self) -> String {
        self.key.replace('-', "")
    }
}
