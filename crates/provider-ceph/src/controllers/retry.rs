//! Retry policies for controller errors and optimistic-concurrency writes
//!
//! Reconcile failures are classified as transient or permanent and requeued
//! with exponential backoff. API-server writes use a bounded
//! read-modify-write loop that retries resource-version conflicts locally.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use kube::runtime::controller::Action;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::store::{ResourceStore, StoreError};

/// Maximum number of retries before giving up
const MAX_RETRIES: u32 = 10;

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 5;

/// Maximum delay between retries (1 hour)
const MAX_DELAY_SECS: u64 = 3600;

/// Tracks retry attempts per resource
#[derive(Debug, Default)]
pub struct RetryTracker {
    /// Map of resource UID to retry count
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment retry count for a resource and return the new count
    pub fn increment(&self, uid: &str) -> u32 {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(uid.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset retry count for a resource (call on successful reconciliation)
    pub fn reset(&self, uid: &str) {
        self.attempts.lock().remove(uid);
    }

    pub fn get(&self, uid: &str) -> u32 {
        self.attempts.lock().get(uid).copied().unwrap_or(0)
    }

    /// Clean up entries for resources that no longer exist
    pub fn cleanup(&self, active_uids: &[String]) {
        self.attempts
            .lock()
            .retain(|uid, _| active_uids.contains(uid));
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend outages, registry misses, API-server hiccups
    Transient,
    /// Invalid spec; waits for the resource to change
    Permanent,
}

/// Determine retry action based on error kind and attempt count
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient => {
            if attempt >= MAX_RETRIES {
                warn!(
                    attempt,
                    max_retries = MAX_RETRIES,
                    "Max retries exceeded, waiting for resource change"
                );
                Action::await_change()
            } else {
                // 5s, 10s, 20s, 40s, ... up to 1 hour
                let delay_secs = BASE_DELAY_SECS * 2u64.pow(attempt.saturating_sub(1));
                let capped_delay = delay_secs.min(MAX_DELAY_SECS);
                debug!(
                    attempt,
                    delay_secs = capped_delay,
                    "Scheduling retry with exponential backoff"
                );
                Action::requeue(Duration::from_secs(capped_delay))
            }
        }
        ErrorKind::Permanent => {
            warn!("Permanent error, waiting for resource change");
            Action::await_change()
        }
    }
}

/// Bounded exponential backoff with jitter for API-server writes
#[derive(Clone, Debug)]
pub struct ConflictBackoff {
    /// Total attempts, including the first
    pub steps: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay added at random
    pub jitter: f64,
}

impl Default for ConflictBackoff {
    fn default() -> Self {
        Self {
            steps: 4,
            initial_delay: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
        }
    }
}

impl ConflictBackoff {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.factor.powi(attempt.saturating_sub(1) as i32);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(base * (1.0 + jitter))
    }
}

/// Which part of the object a write replaces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateTarget {
    /// Metadata and spec
    Object,
    /// Status subresource
    Status,
}

/// Fetch the latest object, apply `mutate`, write it back.
///
/// `mutate` returns false when nothing needs writing. Conflicts are retried
/// up to `backoff.steps` attempts. A missing object yields `Ok(None)`.
pub async fn update_with_retry<K, S, F>(
    store: &S,
    backoff: &ConflictBackoff,
    name: &str,
    target: UpdateTarget,
    mut mutate: F,
) -> Result<Option<K>, StoreError>
where
    K: Clone + Send + Sync + 'static,
    S: ResourceStore<K> + ?Sized,
    F: FnMut(&mut K) -> bool + Send,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let mut obj = match store.get(name).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if !mutate(&mut obj) {
            return Ok(Some(obj));
        }

        let written = match target {
            UpdateTarget::Object => store.replace(&obj).await,
            UpdateTarget::Status => store.replace_status(&obj).await,
        };
        match written {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) if e.is_conflict() && attempt < backoff.steps => {
                let delay = backoff.delay(attempt);
                debug!(
                    name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Update conflict, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(name, attempt, error = %e, "Update failed");
                return Err(e);
            }
        }
    }
}

/// Run `operation` until it succeeds, `retryable` rejects the error, or the
/// attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    backoff: &ConflictBackoff,
    operation_name: &str,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < backoff.steps && retryable(&e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
