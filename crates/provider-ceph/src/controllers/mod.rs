//! Kubernetes controllers for Buckets and ProviderConfigs

pub mod bucket;
pub mod providerconfig;
pub mod ratelimit;
pub mod retry;

use std::sync::Arc;

use crate::backend::BackendRegistry;
use crate::bucket::Bucket;
use crate::config::OperatorConfig;
use crate::convergence::Converger;
use crate::credentials::CredentialResolver;
use crate::healthcheck::InitialCheckTracker;
use crate::providerconfig::ProviderConfig;
use crate::s3::ClientBuilder;
use crate::store::{ResourceStore, SecretReader};
use crate::unpause::UnpauseHandle;

use self::ratelimit::ReconcileRateLimiter;
use self::retry::{ConflictBackoff, RetryTracker};

/// Shared state for both controllers
pub struct ControllerContext {
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Live backends keyed by ProviderConfig name
    pub registry: Arc<BackendRegistry>,
    pub buckets: Arc<dyn ResourceStore<Bucket>>,
    pub provider_configs: Arc<dyn ResourceStore<ProviderConfig>>,
    pub secrets: Arc<dyn SecretReader>,
    /// Builds S3/STS clients from endpoint and credentials
    pub client_builder: Arc<dyn ClientBuilder>,
    pub credentials: Arc<CredentialResolver>,
    pub converger: Arc<Converger>,
    pub unpause: UnpauseHandle,
    pub initial_checks: Arc<InitialCheckTracker>,
    /// Per-object failure counts for exponential requeue
    pub retry_tracker: Arc<RetryTracker>,
    pub rate_limiter: Arc<ReconcileRateLimiter>,
    pub conflict_backoff: ConflictBackoff,
}
