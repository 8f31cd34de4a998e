//! In-memory registry of S3 backends
//!
//! One entry per ProviderConfig. Entries are replaced wholesale on every
//! ProviderConfig reconcile and removed when the ProviderConfig goes away.
//! The lock is only ever held for map access; callers clone the handles out
//! and perform I/O without it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::providerconfig::HealthStatus;
use crate::s3::{BackendEndpoint, S3Backend, StsBackend};

/// A registered backend and its live client handles
#[derive(Clone)]
pub struct Backend {
    pub s3: Arc<dyn S3Backend>,
    pub sts: Option<Arc<dyn StsBackend>>,
    pub endpoint: BackendEndpoint,
    pub active: bool,
    pub health: HealthStatus,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("endpoint", &self.endpoint)
            .field("has_sts", &self.sts.is_some())
            .field("active", &self.active)
            .field("health", &self.health)
            .finish()
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `name`
    pub fn add_or_update_backend(&self, name: &str, backend: Backend) {
        self.backends.write().insert(name.to_string(), backend);
    }

    pub fn delete_backend(&self, name: &str) -> Option<Backend> {
        self.backends.write().remove(name)
    }

    /// `None` means the backend is not registered (yet)
    pub fn get_backend(&self, name: &str) -> Option<Backend> {
        self.backends.read().get(name).cloned()
    }

    pub fn get_backend_client(&self, name: &str) -> Option<Arc<dyn S3Backend>> {
        self.backends.read().get(name).map(|b| b.s3.clone())
    }

    pub fn get_sts_client(&self, name: &str) -> Option<Arc<dyn StsBackend>> {
        self.backends.read().get(name).and_then(|b| b.sts.clone())
    }

    /// Active backends among `names`; an empty slice selects every active backend
    pub fn get_active_backends(&self, names: &[String]) -> HashMap<String, Backend> {
        let backends = self.backends.read();
        if names.is_empty() {
            return backends
                .iter()
                .filter(|(_, b)| b.active)
                .map(|(n, b)| (n.clone(), b.clone()))
                .collect();
        }
        names
            .iter()
            .filter_map(|n| {
                backends
                    .get(n)
                    .filter(|b| b.active)
                    .map(|b| (n.clone(), b.clone()))
            })
            .collect()
    }

    pub fn get_all_backends(&self) -> HashMap<String, Backend> {
        self.backends.read().clone()
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_backend_active(&self, name: &str) -> bool {
        self.backends.read().get(name).is_some_and(|b| b.active)
    }

    /// Returns false when the backend is not registered
    pub fn toggle_backend_active_status(&self, name: &str, active: bool) -> bool {
        match self.backends.write().get_mut(name) {
            Some(backend) => {
                backend.active = active;
                true
            }
            None => false,
        }
    }

    /// Returns false when the backend is not registered
    pub fn set_backend_health_status(&self, name: &str, health: HealthStatus) -> bool {
        match self.backends.write().get_mut(name) {
            Some(backend) => {
                backend.health = health;
                true
            }
            None => false,
        }
    }

    pub fn get_backend_health_status(&self, name: &str) -> Option<HealthStatus> {
        self.backends.read().get(name).map(|b| b.health)
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Count of backends currently reporting Healthy
    pub fn healthy_count(&self) -> usize {
        self.backends
            .read()
            .values()
            .filter(|b| b.health == HealthStatus::Healthy)
            .count()
    }
}
