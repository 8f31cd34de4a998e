//! ProviderConfig controller
//!
//! Each ProviderConfig is one S3 backend. A reconcile pass rebuilds the
//! backend's clients from the referenced Secret, registers them, probes the
//! backend through its health-check bucket and persists the result.
//!
//! ## Health transitions
//!
//! The pre-probe health comes from the registry (or the persisted status
//! after a restart). A move from anything but Healthy to Healthy queues an
//! unpause of the backend's dependent Buckets. Healthy to Healthy does not.
//!
//! ## Deletion Handling
//!
//! The `provider-config-cleanup` finalizer holds the resource until the
//! health-check bucket and its Bucket resource are gone and the registry
//! entry is dropped. Cleanup of the S3 side is best-effort.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{self, Action};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client as KubeClient, Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backend::Backend;
use crate::bucket::{Bucket, BucketSpec, Condition};
use crate::config::{finalizers, labels};
use crate::convergence::BackendTarget;
use crate::credentials::{build_backend_clients, CredentialError};
use crate::healthcheck::{self, health_check_bucket_name, should_unpause, ProbeOutcome};
use crate::providerconfig::{HealthStatus, ProviderConfig};
use crate::s3::S3Backend;
use crate::store::StoreError;

use super::retry::{compute_backoff, update_with_retry, ErrorKind, UpdateTarget};
use super::ControllerContext;

#[derive(Debug, Error)]
pub enum ProviderConfigError {
    #[error("credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("Kubernetes API error: {0}")]
    Store(#[from] StoreError),
}

fn has_finalizer(pc: &ProviderConfig) -> bool {
    pc.finalizers().iter().any(|f| f == finalizers::PROVIDER_CONFIG)
}

/// Bucket resource standing for the health-check bucket
fn health_check_resource(pc: &ProviderConfig) -> Bucket {
    let name = pc.name_any();
    let mut bucket = Bucket::new(
        &health_check_bucket_name(&name),
        BucketSpec {
            providers: Some(vec![name.clone()]),
            ..Default::default()
        },
    );
    bucket
        .labels_mut()
        .insert(labels::IGNORE.to_string(), "true".to_string());
    bucket
        .labels_mut()
        .insert(labels::backend(&name), "true".to_string());
    if let Some(owner) = pc.controller_owner_ref(&()) {
        bucket.owner_references_mut().push(owner);
    }
    bucket
}

/// Create the health-check Bucket resource once per backend
async fn ensure_health_check_resource(ctx: &ControllerContext, pc: &ProviderConfig) {
    let name = pc.name_any();
    if !ctx.initial_checks.begin(&name) {
        return;
    }
    let result = match ctx.buckets.create(&health_check_resource(pc)).await {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        warn!(backend = %name, error = %e, "Failed to create health-check Bucket");
    }
    ctx.initial_checks.finish(&name, result.is_ok());
}

/// Remove the health-check bucket from the backend and its Bucket resource
async fn cleanup_health_check(ctx: &ControllerContext, name: &str, s3: Option<Arc<dyn S3Backend>>) {
    let bucket = health_check_bucket_name(name);
    if let Some(client) = s3 {
        let target = BackendTarget {
            name: name.to_string(),
            client,
        };
        let results = ctx.converger.delete(&bucket, vec![target], true).await;
        if let Some(Err(e)) = results.get(name) {
            warn!(backend = %name, error = %e, "Failed to remove health-check bucket");
        }
    }
    match ctx.buckets.delete(&bucket).await {
        Ok(()) => debug!(backend = %name, "Deleted health-check Bucket"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(backend = %name, error = %e, "Failed to delete health-check Bucket"),
    }
    ctx.initial_checks.remove(name);
}

/// Write health and reason to status when they changed
async fn persist_health(
    ctx: &ControllerContext,
    name: &str,
    outcome: &ProbeOutcome,
) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    update_with_retry(
        ctx.provider_configs.as_ref(),
        &ctx.conflict_backoff,
        name,
        UpdateTarget::Status,
        |pc: &mut ProviderConfig| {
            let status = pc.status.get_or_insert_with(Default::default);
            if status.health == outcome.health && status.reason == outcome.reason {
                return false;
            }
            let ready = matches!(outcome.health, HealthStatus::Healthy | HealthStatus::Disabled);
            let condition = Condition::ready(ready, &outcome.health.to_string(), &outcome.reason)
                .since(status.conditions.iter().find(|c| c.type_ == "Ready"));
            status.health = outcome.health;
            status.reason = outcome.reason.clone();
            status.last_check_time = Some(now.clone());
            status.conditions = vec![condition];
            true
        },
    )
    .await?;
    Ok(())
}

/// Reconcile a single ProviderConfig
#[instrument(skip(pc, ctx), fields(name = %pc.name_any()))]
async fn reconcile(
    pc: Arc<ProviderConfig>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ProviderConfigError> {
    ctx.rate_limiter.acquire().await;
    let name = pc.name_any();

    if pc.metadata.deletion_timestamp.is_some() {
        return finalize(&pc, &ctx).await;
    }

    if !has_finalizer(&pc) {
        update_with_retry(
            ctx.provider_configs.as_ref(),
            &ctx.conflict_backoff,
            &name,
            UpdateTarget::Object,
            |pc: &mut ProviderConfig| {
                if has_finalizer(pc) {
                    return false;
                }
                pc.finalizers_mut()
                    .push(finalizers::PROVIDER_CONFIG.to_string());
                true
            },
        )
        .await?;
    }

    let clients = build_backend_clients(
        ctx.client_builder.as_ref(),
        ctx.secrets.as_ref(),
        &pc.spec,
    )
    .await?;

    let before = ctx
        .registry
        .get_backend_health_status(&name)
        .unwrap_or_else(|| pc.health());
    ctx.registry.add_or_update_backend(
        &name,
        Backend {
            s3: clients.s3.clone(),
            sts: clients.sts,
            endpoint: clients.endpoint,
            active: before != HealthStatus::Unhealthy,
            health: before,
        },
    );

    let outcome = if pc.spec.disable_health_check {
        // Only a backend that was being probed has a health-check bucket
        if matches!(before, HealthStatus::Healthy | HealthStatus::Unhealthy) {
            info!(backend = %name, "Health check disabled, removing health-check bucket");
            cleanup_health_check(&ctx, &name, Some(clients.s3.clone())).await;
        }
        ProbeOutcome {
            health: HealthStatus::Disabled,
            reason: String::new(),
        }
    } else {
        ensure_health_check_resource(&ctx, &pc).await;
        healthcheck::probe(
            clients.s3.as_ref(),
            &health_check_bucket_name(&name),
            Utc::now(),
        )
        .await
    };

    ctx.registry.set_backend_health_status(&name, outcome.health);
    ctx.registry
        .toggle_backend_active_status(&name, outcome.health != HealthStatus::Unhealthy);
    if outcome.health == HealthStatus::Unhealthy {
        warn!(backend = %name, reason = %outcome.reason, "Backend is unhealthy");
    } else if outcome.health != before {
        info!(backend = %name, from = %before, to = %outcome.health, "Backend health changed");
    }

    // Queued before the status write so a failed write cannot drop it
    if should_unpause(before, outcome.health)
        && !ctx.unpause.submit(&name)
        && !ctx.unpause.is_pending(&name)
    {
        // Rejected outright; replay the transition on the next pass
        ctx.registry.set_backend_health_status(&name, before);
    }

    persist_health(&ctx, &name, &outcome).await?;

    if let Some(uid) = pc.uid() {
        ctx.retry_tracker.reset(&uid);
    }

    Ok(Action::requeue(ctx.config.health_check_interval()))
}

/// Tear down a deleted ProviderConfig
async fn finalize(
    pc: &ProviderConfig,
    ctx: &ControllerContext,
) -> Result<Action, ProviderConfigError> {
    let name = pc.name_any();

    if has_finalizer(pc) {
        let s3 = if pc.spec.disable_health_check {
            None
        } else {
            match ctx.registry.get_backend_client(&name) {
                Some(client) => Some(client),
                None => match build_backend_clients(
                    ctx.client_builder.as_ref(),
                    ctx.secrets.as_ref(),
                    &pc.spec,
                )
                .await
                {
                    Ok(clients) => Some(clients.s3),
                    Err(e) => {
                        warn!(backend = %name, error = %e, "No client for health-check cleanup");
                        None
                    }
                },
            }
        };
        cleanup_health_check(ctx, &name, s3).await;
    }

    ctx.registry.delete_backend(&name);
    ctx.converger.forget_backend(&name);
    ctx.initial_checks.remove(&name);

    update_with_retry(
        ctx.provider_configs.as_ref(),
        &ctx.conflict_backoff,
        &name,
        UpdateTarget::Object,
        |pc: &mut ProviderConfig| {
            let before = pc.finalizers().len();
            pc.finalizers_mut().retain(|f| f != finalizers::PROVIDER_CONFIG);
            pc.finalizers().len() != before
        },
    )
    .await?;

    if let Some(uid) = pc.uid() {
        ctx.retry_tracker.reset(&uid);
    }
    info!(backend = %name, "Backend removed");
    Ok(Action::await_change())
}

/// Drop registry entries and bookkeeping for ProviderConfigs that no longer
/// exist. Returns the number of registry entries removed.
pub async fn collect_garbage(ctx: &ControllerContext) -> Result<usize, StoreError> {
    let pcs = ctx.provider_configs.list(None).await?;
    let names: Vec<String> = pcs.iter().map(|pc| pc.name_any()).collect();

    let mut removed = 0;
    for stale in ctx
        .registry
        .backend_names()
        .into_iter()
        .filter(|n| !names.contains(n))
    {
        ctx.registry.delete_backend(&stale);
        ctx.converger.forget_backend(&stale);
        info!(backend = %stale, "Removed orphaned backend");
        removed += 1;
    }
    ctx.initial_checks.retain(&names);

    let buckets = ctx.buckets.list(None).await?;
    let uids: HashSet<String> = pcs
        .iter()
        .filter_map(|pc| pc.uid())
        .chain(buckets.iter().filter_map(|b| b.uid()))
        .collect();
    ctx.retry_tracker
        .cleanup(&uids.into_iter().collect::<Vec<_>>());

    Ok(removed)
}

fn classify_error(error: &ProviderConfigError) -> ErrorKind {
    match error {
        // Only an edit to the ProviderConfig can supply the reference
        ProviderConfigError::Credentials(CredentialError::MissingSecretRef) => ErrorKind::Permanent,
        ProviderConfigError::Credentials(_) => ErrorKind::Transient,
        ProviderConfigError::Store(_) => ErrorKind::Transient,
    }
}

fn error_policy(
    pc: Arc<ProviderConfig>,
    error: &ProviderConfigError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let uid = pc.uid().unwrap_or_default();
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(&uid);

    warn!(
        name = %pc.name_any(),
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "ProviderConfig reconciliation failed"
    );

    compute_backoff(attempt, kind)
}

/// Start the ProviderConfig controller
pub async fn run(client: KubeClient, ctx: Arc<ControllerContext>) {
    let api: Api<ProviderConfig> = Api::all(client);
    let concurrency = ctx.config.max_reconcile_rate;

    info!(concurrency, "Starting ProviderConfig controller");

    Controller::new(api, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "ProviderConfig reconciled successfully");
                }
                Err(e) => {
                    warn!(error = %e, "ProviderConfig controller error");
                }
            }
        })
        .await;
}
