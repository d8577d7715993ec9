//! License key validation and pool selection

use crate::model::License;
use crate::store::InstanceStore;
use anyhow::Result;
use regex::Regex;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

static KEY_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z1-9]{4}(-[A-Z1-9]{4}){5}$").expect("valid license regex"));

/// `XXXX-XXXX-XXXX-XXXX-XXXX-XXXX` with uppercase letters and digits 1-9
pub fn is_valid_key(key: &str) -> bool {
    KEY_FORMAT.is_match(key)
}

/// Trim and uppercase user input, then validate it
pub fn normalize_key(input: &str) -> Option<String> {
    let key = input.trim().to_ascii_uppercase();
    is_valid_key(&key).then_some(key)
}

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("'{0}' is not a license key of the form XXXX-XXXX-XXXX-XXXX-XXXX-XXXX")]
    InvalidKey(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What the pool knows about running instances
pub trait Occupancy {
    fn is_active(&self, slug: &str) -> bool;

    /// Users currently connected to the instance's world
    fn active_user_count(&self, slug: &str) -> impl Future<Output = usize> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// The instance is already bound to this license
    AlreadyHeld(License),
    /// Unbound, or bound to an instance that is not running
    Free(License),
    /// Held by a running instance with nobody connected
    Reclaim { license: License, from: String },
    Unavailable,
}

/// Arbitrates licenses across instances.
///
/// Callers hold [`LicensePool::lock`] from planning until the binding is
/// written so two activations never pick the same license.
pub struct LicensePool {
    store: Arc<dyn InstanceStore>,
    lock: Mutex<()>,
}

impl LicensePool {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Decide which license `slug` should get
    pub async fn plan<O: Occupancy + Sync>(&self, slug: &str, occupancy: &O) -> Result<Assignment> {
        if let Some(license) = self.store.license_for(slug)? {
            if is_valid_key(&license.key) {
                return Ok(Assignment::AlreadyHeld(license));
            }
            warn!(slug, key = %license.key, "Dropping malformed license held by instance");
            self.release(slug)?;
        }

        let licenses: Vec<License> = self
            .store
            .licenses()?
            .into_iter()
            .filter(|license| {
                let valid = is_valid_key(&license.key);
                if !valid {
                    warn!(key = %license.key, "Skipping malformed license");
                }
                valid
            })
            .collect();

        if let Some(license) = licenses.iter().find(|license| match &license.instance {
            None => true,
            Some(holder) => !occupancy.is_active(holder),
        }) {
            return Ok(Assignment::Free(license.clone()));
        }

        for license in licenses {
            let Some(holder) = license.instance.clone() else {
                continue;
            };
            if holder == slug {
                continue;
            }
            let users = occupancy.active_user_count(&holder).await;
            debug!(holder = %holder, users, "Checking license holder occupancy");
            if users == 0 {
                return Ok(Assignment::Reclaim {
                    license,
                    from: holder,
                });
            }
        }

        Ok(Assignment::Unavailable)
    }

    /// Add a license, or rename the one with the same key. The key is
    /// trimmed and uppercased before it is checked.
    pub fn register(&self, key: &str, name: &str) -> Result<License, LicenseError> {
        let key = normalize_key(key).ok_or_else(|| LicenseError::InvalidKey(key.trim().to_string()))?;
        let mut license = self
            .store
            .licenses()?
            .into_iter()
            .find(|license| license.key == key)
            .unwrap_or_else(|| License::new(&key, name));
        license.name = name.to_string();
        self.store.persist_license(&license)?;
        info!(key = %license.key, name, "Registered license");
        Ok(license)
    }

    pub fn list(&self) -> Result<Vec<License>> {
        self.store.licenses()
    }

    /// Record `license` as held by `slug`
    pub fn bind(&self, mut license: License, slug: &str) -> Result<License> {
        if let Some(previous) = license.instance.as_deref().filter(|holder| *holder != slug) {
            info!(key = %license.key, from = previous, to = slug, "Moving license");
        } else {
            info!(key = %license.key, slug, "Binding license");
        }
        license.instance = Some(slug.to_string());
        self.store.persist_license(&license)?;
        Ok(license)
    }

    /// Clear the binding of whatever license `slug` holds.
    /// The license record itself stays.
    pub fn release(&self, slug: &str) -> Result<bool> {
        let Some(mut license) = self.store.license_for(slug)? else {
            return Ok(false);
        };
        license.instance = None;
        self.store.persist_license(&license)?;
        info!(key = %license.key, slug, "Released license");
        Ok(true)
    }
}
