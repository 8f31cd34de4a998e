//! Process-wide cache of confirmed bucket existence

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Remembers which (backend, bucket) pairs a HeadBucket or CreateBucket
/// confirmed, so steady-state reconciles skip the existence round trip.
#[derive(Debug, Default)]
pub struct ExistenceCache {
    /// Zero keeps entries forever
    ttl: Duration,
    entries: DashMap<(String, String), Instant>,
}

impl ExistenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn is_known(&self, backend: &str, bucket: &str) -> bool {
        let key = (backend.to_string(), bucket.to_string());
        let fresh = match self.entries.get(&key) {
            Some(recorded) => self.ttl.is_zero() || recorded.elapsed() < self.ttl,
            None => return false,
        };
        if !fresh {
            self.entries.remove(&key);
        }
        fresh
    }

    pub fn record(&self, backend: &str, bucket: &str) {
        self.entries
            .insert((backend.to_string(), bucket.to_string()), Instant::now());
    }

    pub fn forget(&self, backend: &str, bucket: &str) {
        self.entries
            .remove(&(backend.to_string(), bucket.to_string()));
    }

    /// Drop every entry confirmed by `backend`
    pub fn forget_backend(&self, backend: &str) {
        self.entries.retain(|(b, _), _| b != backend);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
