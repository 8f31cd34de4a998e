//! Bucket controller
//!
//! Converges each Bucket on the backends it targets and records the result
//! per backend in status. The Ready condition is the AND over the targeted
//! backends that are active; inactive backends are reported but excluded.
//!
//! Buckets carrying the ignore label (health-check buckets) or the pause
//! annotation are skipped.
//!
//! ## Deletion Handling
//!
//! The `bucket-cleanup` finalizer holds the resource until the bucket is gone
//! from every backend it was recorded on. Backends whose ProviderConfig no
//! longer exists are skipped. A non-empty bucket is reported with reason
//! `BucketNotEmpty` and the finalizer stays.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{self, Action};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client as KubeClient, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bucket::{BackendStatus, Bucket, BucketStatus, Condition};
use crate::config::{finalizers, labels, EmptyProviders};
use crate::convergence::{BackendOutcome, BackendTarget};
use crate::credentials::CredentialError;
use crate::providerconfig::HealthStatus;
use crate::s3::S3Error;
use crate::store::StoreError;

use super::retry::{compute_backoff, update_with_retry, ErrorKind, UpdateTarget};
use super::ControllerContext;

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("backend {0} is not registered")]
    BackendNotRegistered(String),
    #[error("credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("Kubernetes API error: {0}")]
    Store(#[from] StoreError),
    #[error("{failed} of {total} backends failed, first error: {first}")]
    PartialFailure {
        failed: usize,
        total: usize,
        first: S3Error,
    },
}

/// Backends selected for one pass
struct Targets {
    active: Vec<BackendTarget>,
    inactive: Vec<String>,
    /// Targeted backends without a usable client this pass
    unresolved: BTreeMap<String, BucketError>,
}

impl BucketError {
    /// Short machine-readable reason for per-backend conditions
    fn reason(&self) -> &'static str {
        match self {
            BucketError::BackendNotRegistered(_) => "BackendNotRegistered",
            BucketError::Credentials(_) => "CredentialsUnavailable",
            BucketError::Store(_) => "KubernetesAPIError",
            BucketError::PartialFailure { first, .. } => first.reason(),
        }
    }
}

/// Build a client for every backend concurrently, keeping failures per backend
async fn resolve_clients(
    ctx: &ControllerContext,
    bucket: &str,
    backends: Vec<String>,
) -> (Vec<BackendTarget>, BTreeMap<String, BucketError>) {
    let resolved = join_all(backends.into_iter().map(|backend| async move {
        let client = ctx.credentials.s3_client(bucket, &backend).await;
        (backend, client)
    }))
    .await;

    let mut targets = Vec::new();
    let mut unresolved = BTreeMap::new();
    for (backend, client) in resolved {
        match client {
            Ok(client) => targets.push(BackendTarget {
                name: backend,
                client,
            }),
            Err(e) => {
                warn!(backend = %backend, error = %e, "No client for backend");
                unresolved.insert(backend, BucketError::from(e));
            }
        }
    }
    (targets, unresolved)
}

/// Pick the backends to converge on
async fn resolve_targets(bucket: &Bucket, ctx: &ControllerContext) -> Option<Targets> {
    let name = bucket.name_any();
    let requested = bucket.requested_providers();
    if requested.is_empty() && ctx.config.empty_providers == EmptyProviders::None {
        return None;
    }

    let missing: Vec<String> = requested
        .iter()
        .filter(|b| ctx.registry.get_backend(b).is_none())
        .cloned()
        .collect();

    let mut active: Vec<String> = ctx
        .registry
        .get_active_backends(requested)
        .into_keys()
        .collect();
    active.sort();
    let inactive = requested
        .iter()
        .filter(|b| !active.contains(b) && !missing.contains(b))
        .cloned()
        .collect();

    let (active, mut unresolved) = resolve_clients(ctx, &name, active).await;
    for backend in missing {
        // Registration can lag the ProviderConfig
        unresolved.insert(backend.clone(), BucketError::BackendNotRegistered(backend));
    }
    Some(Targets {
        active,
        inactive,
        unresolved,
    })
}

/// Failed bucket condition, keeping the other conditions of `previous`
fn failed_backend(
    previous: Option<&BackendStatus>,
    reason: &str,
    message: &str,
) -> BackendStatus {
    BackendStatus {
        bucket_condition: Condition::unavailable(reason, message)
            .since(previous.map(|p| &p.bucket_condition)),
        lifecycle_configuration_condition: previous
            .and_then(|p| p.lifecycle_configuration_condition.clone()),
        versioning_condition: previous.and_then(|p| p.versioning_condition.clone()),
        object_lock_configuration_condition: previous
            .and_then(|p| p.object_lock_configuration_condition.clone()),
    }
}

/// Status after a pass, keeping entries for backends not visited
fn build_status(
    previous: Option<&BucketStatus>,
    targets: &Targets,
    outcomes: &BTreeMap<String, BackendOutcome>,
) -> BucketStatus {
    let previous = previous.cloned().unwrap_or_default();
    let mut backends = previous.backends.clone();

    for (backend, outcome) in outcomes {
        backends.insert(
            backend.clone(),
            outcome.to_status(previous.backends.get(backend)),
        );
    }
    for backend in &targets.inactive {
        let prev = previous.backends.get(backend);
        backends.insert(
            backend.clone(),
            failed_backend(prev, "BackendInactive", "backend is not active"),
        );
    }
    for (backend, err) in &targets.unresolved {
        let prev = previous.backends.get(backend);
        backends.insert(
            backend.clone(),
            failed_backend(prev, err.reason(), &err.to_string()),
        );
    }

    let total = outcomes.len() + targets.unresolved.len();
    let failed =
        outcomes.values().filter(|o| !o.is_ready()).count() + targets.unresolved.len();
    let ready = if total == 0 {
        Condition::unavailable("NoBackends", "no active backends to converge on")
    } else if failed == 0 {
        Condition::available()
    } else {
        Condition::unavailable(
            "ReconcileError",
            &format!("{failed} of {total} backends failed"),
        )
    };

    BucketStatus {
        conditions: vec![ready.since(previous.ready_condition())],
        backends,
    }
}

async fn write_status(
    ctx: &ControllerContext,
    name: &str,
    mut next: impl FnMut(Option<&BucketStatus>) -> BucketStatus + Send,
) -> Result<(), StoreError> {
    update_with_retry(
        ctx.buckets.as_ref(),
        &ctx.conflict_backoff,
        name,
        UpdateTarget::Status,
        |b: &mut Bucket| {
            let status = next(b.status.as_ref());
            if b.status.as_ref() == Some(&status) {
                return false;
            }
            b.status = Some(status);
            true
        },
    )
    .await?;
    Ok(())
}

/// Reconcile a single Bucket
#[instrument(skip(bucket, ctx), fields(name = %bucket.name_any()))]
async fn reconcile(
    bucket: Arc<Bucket>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, BucketError> {
    ctx.rate_limiter.acquire().await;
    let name = bucket.name_any();

    if bucket.is_ignored() {
        debug!("Bucket is ignored");
        return Ok(Action::await_change());
    }
    if bucket.metadata.deletion_timestamp.is_some() {
        return finalize(&bucket, &ctx).await;
    }
    if bucket.is_paused() {
        debug!("Bucket is paused");
        return Ok(Action::await_change());
    }

    if !bucket.has_finalizer() {
        update_with_retry(
            ctx.buckets.as_ref(),
            &ctx.conflict_backoff,
            &name,
            UpdateTarget::Object,
            |b: &mut Bucket| {
                if b.has_finalizer() {
                    return false;
                }
                b.finalizers_mut().push(finalizers::BUCKET.to_string());
                true
            },
        )
        .await?;
    }

    let Some(mut targets) = resolve_targets(&bucket, &ctx).await else {
        info!("No providers requested and empty providers resolve to none");
        let none = Targets {
            active: Vec::new(),
            inactive: Vec::new(),
            unresolved: BTreeMap::new(),
        };
        write_status(&ctx, &name, |prev| build_status(prev, &none, &BTreeMap::new())).await?;
        return Ok(Action::requeue(ctx.config.sync_period()));
    };

    let outcomes = ctx
        .converger
        .converge(&name, &bucket.spec, std::mem::take(&mut targets.active))
        .await;

    let converged: Vec<String> = outcomes
        .iter()
        .filter(|(_, o)| o.is_ready())
        .map(|(b, _)| b.clone())
        .collect();
    // Only inactive backends pause; failures on active ones back off instead
    let pause =
        !targets.inactive.is_empty() && (ctx.config.auto_pause || bucket.spec.auto_pause);
    let paused_on: &[String] = if pause { &targets.inactive } else { &[] };

    update_with_retry(
        ctx.buckets.as_ref(),
        &ctx.conflict_backoff,
        &name,
        UpdateTarget::Object,
        |b: &mut Bucket| {
            let mut changed = false;
            for backend in converged.iter().chain(paused_on) {
                changed |= b
                    .labels_mut()
                    .insert(labels::backend(backend), "true".to_string())
                    .as_deref()
                    != Some("true");
            }
            if pause {
                changed |= b.set_paused(true);
            }
            changed
        },
    )
    .await?;
    if pause {
        info!(backends = ?paused_on, "Paused bucket until its backends recover");
        // Recovered before the pause landed, so its last unpause missed this bucket
        for backend in paused_on {
            if ctx.registry.get_backend_health_status(backend) == Some(HealthStatus::Healthy) {
                ctx.unpause.submit(backend);
            }
        }
    }

    write_status(&ctx, &name, |prev| build_status(prev, &targets, &outcomes)).await?;

    let unresolved = targets.unresolved.len();
    let mut failures = outcomes.values().filter_map(|o| o.bucket.as_ref().err());
    if let Some(first) = failures.next() {
        return Err(BucketError::PartialFailure {
            failed: 1 + failures.count() + unresolved,
            total: outcomes.len() + unresolved,
            first: first.clone(),
        });
    }
    if let Some((_, err)) = targets.unresolved.into_iter().next() {
        return Err(err);
    }

    if let Some(uid) = bucket.uid() {
        ctx.retry_tracker.reset(&uid);
    }
    Ok(Action::requeue(ctx.config.sync_period()))
}

/// Delete the bucket from every backend it is recorded on
async fn finalize(bucket: &Bucket, ctx: &ControllerContext) -> Result<Action, BucketError> {
    let name = bucket.name_any();
    if !bucket.has_finalizer() {
        return Ok(Action::await_change());
    }

    let mut reachable = Vec::new();
    let mut unresolved = BTreeMap::new();
    for backend in bucket.known_backends() {
        if ctx.registry.get_backend(&backend).is_some() {
            reachable.push(backend);
            continue;
        }
        match ctx.provider_configs.get(&backend).await {
            Err(e) if e.is_not_found() => {
                info!(backend = %backend, "Backend no longer exists, skipping");
            }
            Ok(_) => {
                unresolved.insert(backend.clone(), BucketError::BackendNotRegistered(backend));
            }
            Err(e) => {
                unresolved.insert(backend, BucketError::from(e));
            }
        }
    }
    let (targets, failed_clients) = resolve_clients(ctx, &name, reachable).await;
    unresolved.extend(failed_clients);

    let results = ctx.converger.delete(&name, targets, false).await;
    let failures: BTreeMap<String, S3Error> = results
        .iter()
        .filter_map(|(b, r)| r.as_ref().err().map(|e| (b.clone(), e.clone())))
        .collect();

    if !failures.is_empty() || !unresolved.is_empty() {
        let first_reason = failures
            .values()
            .map(S3Error::reason)
            .chain(unresolved.values().map(BucketError::reason))
            .next()
            .unwrap_or("ReconcileError");
        write_status(ctx, &name, |prev| {
            let mut status = prev.cloned().unwrap_or_default();
            status
                .backends
                .retain(|b, _| !results.contains_key(b) || failures.contains_key(b));
            let reasons = failures
                .iter()
                .map(|(b, e)| (b, e.reason(), e.to_string()))
                .chain(unresolved.iter().map(|(b, e)| (b, e.reason(), e.to_string())));
            for (backend, reason, message) in reasons {
                let prev = status.backends.get(backend);
                let bucket_condition = Condition::unavailable(reason, &message)
                    .since(prev.map(|p| &p.bucket_condition));
                status.backends.insert(
                    backend.clone(),
                    BackendStatus {
                        bucket_condition,
                        lifecycle_configuration_condition: None,
                        versioning_condition: None,
                        object_lock_configuration_condition: None,
                    },
                );
            }
            let ready = Condition::unavailable(first_reason, "bucket deletion failed")
                .since(status.ready_condition());
            status.conditions = vec![ready];
            status
        })
        .await?;

        if let Some(first) = failures.values().next().cloned() {
            return Err(BucketError::PartialFailure {
                failed: failures.len() + unresolved.len(),
                total: results.len() + unresolved.len(),
                first,
            });
        }
        if let Some((_, err)) = unresolved.into_iter().next() {
            return Err(err);
        }
    }

    update_with_retry(
        ctx.buckets.as_ref(),
        &ctx.conflict_backoff,
        &name,
        UpdateTarget::Object,
        |b: &mut Bucket| {
            let before = b.finalizers().len();
            b.finalizers_mut().retain(|f| f != finalizers::BUCKET);
            b.finalizers().len() != before
        },
    )
    .await?;

    if let Some(uid) = bucket.uid() {
        ctx.retry_tracker.reset(&uid);
    }
    info!(backends = results.len(), "Bucket deleted");
    Ok(Action::await_change())
}

fn classify_error(error: &BucketError) -> ErrorKind {
    match error {
        // Registration can lag the ProviderConfig
        BucketError::BackendNotRegistered(_) => ErrorKind::Transient,
        BucketError::Credentials(_) => ErrorKind::Transient,
        BucketError::Store(_) => ErrorKind::Transient,
        BucketError::PartialFailure { .. } => ErrorKind::Transient,
    }
}

fn error_policy(bucket: Arc<Bucket>, error: &BucketError, ctx: Arc<ControllerContext>) -> Action {
    let uid = bucket.uid().unwrap_or_default();
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(&uid);

    warn!(
        name = %bucket.name_any(),
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "Bucket reconciliation failed"
    );

    compute_backoff(attempt, kind)
}

/// Start the Bucket controller
pub async fn run(client: KubeClient, ctx: Arc<ControllerContext>) {
    let api: Api<Bucket> = Api::all(client);
    let concurrency = ctx.config.max_reconcile_rate;

    info!(concurrency, "Starting Bucket controller");

    Controller::new(api, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "Bucket reconciled successfully");
                }
                Err(e) => {
                    warn!(error = %e, "Bucket controller error");
                }
            }
        })
        .await;
}
