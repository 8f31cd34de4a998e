//! Lease-based leader election.
//!
//! Only the replica holding the Lease runs controllers. Standbys block in
//! [`LeaderElection::acquire`]; a leader that loses the Lease exits so the
//! pod restarts as a standby.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use k8s_openapi::api::coordination::v1::Lease;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::config::LeaderElectionArgs;

/// Consecutive renewal errors tolerated before exiting
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Validated leader election settings
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderElectionConfig {
    lease_name: String,
    namespace: String,
    holder_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaderElectionConfig {
    pub fn new(
        lease_name: String,
        namespace: String,
        holder_id: String,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Result<Self> {
        ensure!(!lease_name.is_empty(), "lease_name cannot be empty");
        ensure!(!namespace.is_empty(), "namespace cannot be empty");
        ensure!(!holder_id.is_empty(), "holder_id cannot be empty");
        ensure!(
            renew_interval < lease_duration,
            "renew_interval ({:?}) must be less than lease_duration ({:?})",
            renew_interval,
            lease_duration
        );

        Ok(Self {
            lease_name,
            namespace,
            holder_id,
            lease_duration,
            renew_interval,
        })
    }

    /// `Ok(None)` when leader election is switched off
    pub fn from_args(args: &LeaderElectionArgs) -> Result<Option<Self>> {
        if !args.enabled {
            return Ok(None);
        }
        let namespace = args
            .namespace
            .clone()
            .context("POD_NAMESPACE required when leader election is enabled")?;
        let holder_id = args
            .holder_id
            .clone()
            .context("POD_NAME required when leader election is enabled")?;

        Self::new(
            args.lease_name.clone(),
            namespace,
            holder_id,
            Duration::from_secs(args.lease_duration_secs),
            Duration::from_secs(args.renew_interval_secs),
        )
        .map(Some)
    }

    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

fn holder_of(lease: Option<&Lease>) -> &str {
    lease
        .and_then(|l| l.spec.as_ref())
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or("unknown")
}

pub struct LeaderElection {
    lease_lock: LeaseLock,
    renew_interval: Duration,
}

impl LeaderElection {
    pub fn new(client: Client, config: &LeaderElectionConfig) -> Self {
        let lease_lock = LeaseLock::new(
            client,
            config.namespace(),
            LeaseLockParams {
                holder_id: config.holder_id().to_string(),
                lease_name: config.lease_name().to_string(),
                lease_ttl: config.lease_duration(),
            },
        );

        Self {
            lease_lock,
            renew_interval: config.renew_interval(),
        }
    }

    /// Block until this replica holds the Lease
    pub async fn acquire(&self) -> Result<()> {
        info!("Attempting to acquire leadership");

        loop {
            match self.lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(holder = holder_of(result.lease.as_ref()), "Leadership acquired");
                    return Ok(());
                }
                Ok(result) => {
                    info!(
                        current_holder = holder_of(result.lease.as_ref()),
                        "Another replica is leader, waiting"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check leadership, retrying");
                }
            }

            tokio::time::sleep(self.renew_interval).await;
        }
    }

    /// Renew the Lease every renew interval.
    ///
    /// Exits the process when another replica takes the Lease or after
    /// [`MAX_RENEWAL_FAILURES`] consecutive renewal errors.
    pub fn spawn_renewal_task(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.renew_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_failures: u32 = 0;

            loop {
                interval.tick().await;

                match self.lease_lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {
                        if consecutive_failures > 0 {
                            info!(
                                previous_failures = consecutive_failures,
                                "Lease renewed after transient failures"
                            );
                        }
                        consecutive_failures = 0;
                        trace!("Lease renewed");
                    }
                    Ok(result) => {
                        error!(
                            new_holder = holder_of(result.lease.as_ref()),
                            "Lost leadership, exiting"
                        );
                        std::process::exit(1);
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_RENEWAL_FAILURES {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Failed to renew lease, exiting"
                            );
                            std::process::exit(1);
                        }
                        warn!(
                            error = %e,
                            attempt = consecutive_failures,
                            max_attempts = MAX_RENEWAL_FAILURES,
                            "Transient lease renewal failure, will retry"
                        );
                    }
                }
            }
        })
    }
}
