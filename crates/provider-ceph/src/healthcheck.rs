//! Backend liveness probe
//!
//! A probe ensures the backend's health-check bucket exists, writes a
//! timestamp object and reads it back. Any failure marks the backend
//! Unhealthy with the error text as reason.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, instrument};

use crate::providerconfig::HealthStatus;
use crate::s3::{S3Backend, S3Error};

/// Object written on every probe
pub const HEALTH_CHECK_KEY: &str = "health-check-file";

static REQUEST_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[,;]?\s*\(?\s*(?:request|host)[ _-]?id\s*[:=]\s*[^\s,;)]+\)?")
        .expect("valid regex")
});

/// Name of the S3 bucket probed for a ProviderConfig
pub fn health_check_bucket_name(provider_config: &str) -> String {
    format!("{provider_config}-health-check")
}

/// Remove request/host id tokens so reasons compare equal across probes
pub fn strip_request_id(message: &str) -> String {
    REQUEST_ID.replace_all(message, "").trim().to_string()
}

/// Whether a health change should release paused dependents
pub fn should_unpause(before: HealthStatus, after: HealthStatus) -> bool {
    after == HealthStatus::Healthy && before != HealthStatus::Healthy
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub health: HealthStatus,
    /// Empty when healthy
    pub reason: String,
}

impl ProbeOutcome {
    fn healthy() -> Self {
        Self {
            health: HealthStatus::Healthy,
            reason: String::new(),
        }
    }

    fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            health: HealthStatus::Unhealthy,
            reason: strip_request_id(&reason.into()),
        }
    }
}

/// Run one write/read round trip against `bucket`
#[instrument(skip(s3, now))]
pub async fn probe(s3: &dyn S3Backend, bucket: &str, now: DateTime<Utc>) -> ProbeOutcome {
    match round_trip(s3, bucket, now).await {
        Ok(outcome) => outcome,
        Err(e) => ProbeOutcome::unhealthy(e.to_string()),
    }
}

async fn round_trip(
    s3: &dyn S3Backend,
    bucket: &str,
    now: DateTime<Utc>,
) -> Result<ProbeOutcome, S3Error> {
    if !s3.head_bucket(bucket).await? {
        debug!(bucket, "Creating health-check bucket");
        match s3.create_bucket(bucket, false, None).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }

    let marker = now.to_rfc3339();
    s3.put_object(bucket, HEALTH_CHECK_KEY, marker.clone().into_bytes())
        .await?;
    let read_back = s3.get_object(bucket, HEALTH_CHECK_KEY).await?;
    if read_back != marker.as_bytes() {
        return Ok(ProbeOutcome::unhealthy(format!(
            "health check object mismatch: wrote {marker}, read {}",
            String::from_utf8_lossy(&read_back)
        )));
    }
    Ok(ProbeOutcome::healthy())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckState {
    NotStarted,
    InProgress,
    Done,
}

/// Runs one-time per-backend setup exactly once
#[derive(Debug, Default)]
pub struct InitialCheckTracker {
    states: Mutex<HashMap<String, CheckState>>,
}

impl InitialCheckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the work for `key`; false if it is running or already done
    pub fn begin(&self, key: &str) -> bool {
        let mut states = self.states.lock();
        match states.get(key).copied().unwrap_or(CheckState::NotStarted) {
            CheckState::NotStarted => {
                states.insert(key.to_string(), CheckState::InProgress);
                true
            }
            CheckState::InProgress | CheckState::Done => false,
        }
    }

    /// A failed attempt resets the key so the next pass retries
    pub fn finish(&self, key: &str, success: bool) {
        let mut states = self.states.lock();
        if success {
            states.insert(key.to_string(), CheckState::Done);
        } else {
            states.remove(key);
        }
    }

    pub fn state(&self, key: &str) -> CheckState {
        self.states
            .lock()
            .get(key)
            .copied()
            .unwrap_or(CheckState::NotStarted)
    }

    pub fn remove(&self, key: &str) {
        self.states.lock().remove(key);
    }

    /// Drop keys not in `keep`
    pub fn retain(&self, keep: &[String]) {
        self.states.lock().retain(|k, _| keep.contains(k));
    }
}
