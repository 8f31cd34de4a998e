//! Operator configuration and well-known metadata keys
//!
//! Runtime settings come from command-line flags with environment variable
//! fallbacks. Per-backend settings live on the ProviderConfig CRD.

use std::time::Duration;

use clap::{Args, Parser, ValueEnum};

/// Minimum accepted health check interval (seconds)
pub const MIN_HEALTH_CHECK_INTERVAL_SECS: u64 = 2;

/// How a Bucket with no `providers` list is resolved
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EmptyProviders {
    /// Target every active registered backend
    #[default]
    AllActive,
    /// Target nothing until providers are listed
    None,
}

/// Leader election settings
#[derive(Args, Clone, Debug)]
pub struct LeaderElectionArgs {
    /// Enable Lease-based leader election
    #[arg(long = "leader-election", env = "LEADER_ELECTION_ENABLED")]
    pub enabled: bool,

    /// Name of the Lease resource
    #[arg(
        long = "leader-lease-name",
        env = "LEADER_ELECTION_LEASE_NAME",
        default_value = "provider-ceph-leader"
    )]
    pub lease_name: String,

    /// Lease TTL (seconds)
    #[arg(
        long = "leader-lease-duration",
        env = "LEADER_ELECTION_LEASE_DURATION",
        default_value_t = 15
    )]
    pub lease_duration_secs: u64,

    /// Lease renewal interval (seconds)
    #[arg(
        long = "leader-renew-interval",
        env = "LEADER_ELECTION_RENEW_INTERVAL",
        default_value_t = 5
    )]
    pub renew_interval_secs: u64,

    /// Namespace holding the Lease
    #[arg(long = "leader-namespace", env = "POD_NAMESPACE")]
    pub namespace: Option<String>,

    /// Holder identity for the Lease
    #[arg(long = "leader-identity", env = "POD_NAME")]
    pub holder_id: Option<String>,
}

/// provider-ceph runtime configuration
#[derive(Parser, Clone, Debug)]
#[command(name = "provider-ceph")]
#[command(about = "Reconciles Buckets across multiple S3-compatible backends", long_about = None)]
pub struct OperatorConfig {
    /// Seconds between backend health checks
    #[arg(
        long,
        env = "HEALTH_CHECK_INTERVAL",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(MIN_HEALTH_CHECK_INTERVAL_SECS..)
    )]
    pub health_check_interval: u64,

    /// Timeout for a single S3 or STS operation (seconds)
    #[arg(long, env = "S3_TIMEOUT", default_value_t = 20)]
    pub s3_timeout: u64,

    /// Maximum concurrent reconciles per controller
    #[arg(long, env = "MAX_RECONCILE_RATE", default_value_t = 5)]
    pub max_reconcile_rate: u16,

    /// Global reconcile rate limit (reconciles per second, 0 disables)
    #[arg(long, env = "RECONCILE_RATE_LIMIT", default_value_t = 10)]
    pub reconcile_rate_limit: u32,

    /// Pause Buckets whose backends become unavailable
    #[arg(long, env = "AUTO_PAUSE")]
    pub auto_pause: bool,

    /// Role ARN; when set, every Bucket operation uses AssumeRole credentials
    #[arg(long, env = "ASSUME_ROLE_ARN")]
    pub assume_role_arn: Option<String>,

    /// Enable external secret stores
    #[arg(long, env = "ENABLE_EXTERNAL_SECRET_STORES")]
    pub enable_external_secret_stores: bool,

    /// Bucket existence cache TTL (seconds, 0 caches forever)
    #[arg(long, env = "EXISTENCE_CACHE_TTL", default_value_t = 0)]
    pub existence_cache_ttl: u64,

    /// Meaning of an empty `providers` list on a Bucket
    #[arg(long, env = "EMPTY_PROVIDERS", value_enum, default_value_t = EmptyProviders::AllActive)]
    pub empty_providers: EmptyProviders,

    /// Bucket resync period (seconds)
    #[arg(long, env = "SYNC_PERIOD", default_value_t = 300)]
    pub sync_period: u64,

    /// Port for the liveness/readiness server
    #[arg(long, env = "HEALTH_PORT", default_value_t = crate::health::DEFAULT_HEALTH_PORT)]
    pub health_port: u16,

    #[command(flatten)]
    pub leader: LeaderElectionArgs,
}

impl OperatorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn s3_timeout(&self) -> Duration {
        Duration::from_secs(self.s3_timeout)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period)
    }

    pub fn existence_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.existence_cache_ttl)
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::parse_from(["provider-ceph"])
    }
}

/// Annotations used by the operator
pub mod annotations {
    /// Suppresses reconciliation of a Bucket while "true"
    pub const PAUSED: &str = "crossplane.io/paused";
}

/// Labels used by the operator
pub mod labels {
    /// Prefix for per-backend membership labels
    pub const BACKEND_PREFIX: &str = "provider-ceph.backends/";
    /// Marks Buckets the Bucket controller must skip (health-check buckets)
    pub const IGNORE: &str = "provider-ceph.crossplane.io/ignore";
    /// Mirror of the pause annotation, selectable by label queries
    pub const PAUSED: &str = "provider-ceph.crossplane.io/paused";

    /// Label key recording that a Bucket lives on `backend`
    pub fn backend(backend: &str) -> String {
        format!("{BACKEND_PREFIX}{backend}")
    }

    /// Selector for Buckets on `backend` that are currently paused
    pub fn paused_on_backend(name: &str) -> String {
        format!("{}=true,{PAUSED}=true", backend(name))
    }
}

/// Finalizers owned by the operator
pub mod finalizers {
    /// Holds a Bucket until every backend has dropped its data
    pub const BUCKET: &str = "ceph.crossplane.io/bucket-cleanup";
    /// Holds a ProviderConfig until its health-check bucket is cleaned up
    pub const PROVIDER_CONFIG: &str = "ceph.crossplane.io/provider-config-cleanup";
}
