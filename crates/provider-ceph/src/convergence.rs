//! Fan-out of bucket operations across backends
//!
//! Each backend converges independently and concurrently; one backend's
//! failure never stops the others. Within a backend the steps run in a fixed
//! order: existence, create, ACL/ownership, versioning, lifecycle, object
//! lock, policy.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::bucket::{
    normalize_lifecycle, BackendStatus, BucketParameters, BucketSpec, Condition,
    VersioningConfiguration,
};
use crate::cache::ExistenceCache;
use crate::s3::{BucketAcl, S3Backend, S3Error};

/// A backend selected for this pass and the client to reach it with
#[derive(Clone)]
pub struct BackendTarget {
    pub name: String,
    pub client: Arc<dyn S3Backend>,
}

/// Result of converging one bucket on one backend
#[derive(Clone, Debug, PartialEq)]
pub struct BackendOutcome {
    /// First failure of any step, or Ok
    pub bucket: Result<(), S3Error>,
    pub lifecycle: Option<Result<(), S3Error>>,
    pub versioning: Option<Result<(), S3Error>>,
    pub object_lock: Option<Result<(), S3Error>>,
}

impl BackendOutcome {
    fn failed(err: S3Error) -> Self {
        Self {
            bucket: Err(err),
            lifecycle: None,
            versioning: None,
            object_lock: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.bucket.is_ok()
    }

    /// Render as per-backend status, keeping unchanged transition times
    pub fn to_status(&self, previous: Option<&BackendStatus>) -> BackendStatus {
        BackendStatus {
            bucket_condition: condition(&self.bucket)
                .since(previous.map(|p| &p.bucket_condition)),
            lifecycle_configuration_condition: self.lifecycle.as_ref().map(|r| {
                let prev = previous.and_then(|p| p.lifecycle_configuration_condition.as_ref());
                condition(r).since(prev)
            }),
            versioning_condition: self.versioning.as_ref().map(|r| {
                condition(r).since(previous.and_then(|p| p.versioning_condition.as_ref()))
            }),
            object_lock_configuration_condition: self.object_lock.as_ref().map(|r| {
                let prev = previous.and_then(|p| p.object_lock_configuration_condition.as_ref());
                condition(r).since(prev)
            }),
        }
    }
}

fn condition(result: &Result<(), S3Error>) -> Condition {
    match result {
        Ok(()) => Condition::available(),
        Err(e) => Condition::unavailable(e.reason(), &e.to_string()),
    }
}

/// Combine the results of one parallel step into a single result
fn aggregate(results: Vec<Result<(), S3Error>>) -> Result<(), S3Error> {
    let total = results.len();
    let mut errors = results.into_iter().filter_map(Result::err);
    match errors.next() {
        None => Ok(()),
        Some(first) => Err(S3Error::Batch {
            failed: 1 + errors.count(),
            total,
            first: Box::new(first),
        }),
    }
}

fn versioning_differs(
    desired: &VersioningConfiguration,
    observed: &VersioningConfiguration,
) -> bool {
    (desired.status.is_some() && desired.status != observed.status)
        || (desired.mfa_delete.is_some() && desired.mfa_delete != observed.mfa_delete)
}

fn policies_equal(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<serde_json::Value>(a),
        serde_json::from_str::<serde_json::Value>(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}

pub struct Converger {
    cache: Arc<ExistenceCache>,
    /// Last ACL put per (backend, bucket); cleared whenever existence is re-checked
    applied_acls: DashMap<(String, String), BucketAcl>,
}

impl Converger {
    pub fn new(cache: Arc<ExistenceCache>) -> Self {
        Self {
            cache,
            applied_acls: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &ExistenceCache {
        &self.cache
    }

    /// Drop everything remembered about `backend`
    pub fn forget_backend(&self, backend: &str) {
        self.cache.forget_backend(backend);
        self.applied_acls.retain(|(b, _), _| b != backend);
    }

    fn forget(&self, backend: &str, bucket: &str) {
        self.cache.forget(backend, bucket);
        self.applied_acls.remove(&(backend.to_string(), bucket.to_string()));
    }

    /// Converge `bucket` on every target concurrently
    #[instrument(skip(self, spec, targets), fields(backends = targets.len()))]
    pub async fn converge(
        &self,
        bucket: &str,
        spec: &BucketSpec,
        targets: Vec<BackendTarget>,
    ) -> BTreeMap<String, BackendOutcome> {
        let tasks = targets.into_iter().map(|target| async move {
            let outcome = self.converge_backend(bucket, spec, &target).await;
            match &outcome.bucket {
                Ok(()) => debug!(backend = %target.name, "Bucket converged"),
                Err(e) => warn!(backend = %target.name, error = %e, "Bucket convergence failed"),
            }
            (target.name, outcome)
        });
        join_all(tasks).await.into_iter().collect()
    }

    async fn converge_backend(
        &self,
        bucket: &str,
        spec: &BucketSpec,
        target: &BackendTarget,
    ) -> BackendOutcome {
        let s3 = target.client.as_ref();
        let params = &spec.for_provider;

        if let Err(e) = self.ensure_exists(&target.name, s3, bucket, params).await {
            return BackendOutcome::failed(e);
        }

        let mut first_error: Option<S3Error> = None;
        let mut note = |result: &Result<(), S3Error>| {
            if let Err(e) = result {
                first_error.get_or_insert_with(|| e.clone());
            }
        };

        if params.has_acl() {
            note(&self.apply_acl(&target.name, s3, bucket, BucketAcl::from(params)).await);
        }
        if let Some(ownership) = params.object_ownership.as_deref() {
            note(&apply_ownership(s3, bucket, ownership).await);
        }

        let versioning = match &params.versioning_configuration {
            Some(desired) => Some(apply_versioning(s3, bucket, desired).await),
            None => None,
        };
        if let Some(result) = &versioning {
            note(result);
        }

        let lifecycle = apply_lifecycle(s3, bucket, spec).await;
        if let Some(result) = &lifecycle {
            note(result);
        }

        let object_lock = match &params.object_lock_configuration {
            Some(desired) => Some(apply_object_lock(s3, bucket, desired).await),
            None => None,
        };
        if let Some(result) = &object_lock {
            note(result);
        }

        note(&apply_policy(s3, bucket, params.policy.as_deref()).await);

        if matches!(first_error, Some(S3Error::NoSuchBucket)) {
            self.forget(&target.name, bucket);
        }

        BackendOutcome {
            bucket: first_error.map_or(Ok(()), Err),
            lifecycle,
            versioning,
            object_lock,
        }
    }

    async fn ensure_exists(
        &self,
        backend: &str,
        s3: &dyn S3Backend,
        bucket: &str,
        params: &BucketParameters,
    ) -> Result<(), S3Error> {
        if self.cache.is_known(backend, bucket) {
            return Ok(());
        }
        self.applied_acls.remove(&(backend.to_string(), bucket.to_string()));
        if !s3.head_bucket(bucket).await? {
            match s3
                .create_bucket(
                    bucket,
                    params.object_lock_enabled_for_bucket.unwrap_or(false),
                    params.location_constraint.clone(),
                )
                .await
            {
                Ok(()) => info!(backend, bucket, "Created bucket"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        self.cache.record(backend, bucket);
        Ok(())
    }

    async fn apply_acl(
        &self,
        backend: &str,
        s3: &dyn S3Backend,
        bucket: &str,
        acl: BucketAcl,
    ) -> Result<(), S3Error> {
        let key = (backend.to_string(), bucket.to_string());
        if self.applied_acls.get(&key).is_some_and(|applied| *applied == acl) {
            return Ok(());
        }
        s3.put_bucket_acl(bucket, &acl).await?;
        self.applied_acls.insert(key, acl);
        Ok(())
    }

    /// Delete `bucket` on every target concurrently.
    ///
    /// With `empty_first` every object and object version is removed before
    /// the bucket; otherwise a non-empty bucket yields `BucketNotEmpty`. An
    /// absent bucket counts as deleted.
    #[instrument(skip(self, targets), fields(backends = targets.len()))]
    pub async fn delete(
        &self,
        bucket: &str,
        targets: Vec<BackendTarget>,
        empty_first: bool,
    ) -> BTreeMap<String, Result<(), S3Error>> {
        let tasks = targets.into_iter().map(|target| async move {
            let result = self
                .delete_backend(bucket, target.client.as_ref(), empty_first)
                .await;
            match &result {
                Ok(()) => {
                    self.forget(&target.name, bucket);
                    info!(backend = %target.name, "Bucket deleted");
                }
                Err(e) => warn!(backend = %target.name, error = %e, "Bucket deletion failed"),
            }
            (target.name, result)
        });
        join_all(tasks).await.into_iter().collect()
    }

    async fn delete_backend(
        &self,
        bucket: &str,
        s3: &dyn S3Backend,
        empty_first: bool,
    ) -> Result<(), S3Error> {
        if empty_first {
            match empty_bucket(s3, bucket).await {
                Ok(()) => {}
                Err(S3Error::NoSuchBucket) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        match s3.delete_bucket(bucket).await {
            Ok(()) | Err(S3Error::NoSuchBucket) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn apply_ownership(s3: &dyn S3Backend, bucket: &str, desired: &str) -> Result<(), S3Error> {
    if s3.get_bucket_ownership_controls(bucket).await?.as_deref() != Some(desired) {
        s3.put_bucket_ownership_controls(bucket, desired).await?;
    }
    Ok(())
}

async fn apply_versioning(
    s3: &dyn S3Backend,
    bucket: &str,
    desired: &VersioningConfiguration,
) -> Result<(), S3Error> {
    let observed = s3.get_bucket_versioning(bucket).await?.unwrap_or_default();
    if versioning_differs(desired, &observed) {
        s3.put_bucket_versioning(bucket, desired).await?;
    }
    Ok(())
}

/// `None` when no lifecycle is wanted and none had to be removed
async fn apply_lifecycle(
    s3: &dyn S3Backend,
    bucket: &str,
    spec: &BucketSpec,
) -> Option<Result<(), S3Error>> {
    let wanted = spec
        .for_provider
        .lifecycle_configuration
        .as_ref()
        .filter(|c| !spec.lifecycle_configuration_disabled && !c.rules.is_empty());

    let observed = match s3.get_bucket_lifecycle(bucket).await {
        Ok(observed) => observed,
        Err(e) => return Some(Err(e)),
    };

    let Some(wanted) = wanted else {
        return match observed {
            Some(_) => match s3.delete_bucket_lifecycle(bucket).await {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            },
            None => None,
        };
    };

    let mut desired = wanted.clone();
    normalize_lifecycle(&mut desired);
    if let Some(mut observed) = observed {
        normalize_lifecycle(&mut observed);
        if observed == desired {
            return Some(Ok(()));
        }
    }
    Some(s3.put_bucket_lifecycle(bucket, &desired).await)
}

async fn apply_object_lock(
    s3: &dyn S3Backend,
    bucket: &str,
    desired: &crate::bucket::ObjectLockConfiguration,
) -> Result<(), S3Error> {
    let observed = s3.get_object_lock_configuration(bucket).await?;
    if observed.as_ref() != Some(desired) {
        s3.put_object_lock_configuration(bucket, desired).await?;
    }
    Ok(())
}

async fn apply_policy(
    s3: &dyn S3Backend,
    bucket: &str,
    desired: Option<&str>,
) -> Result<(), S3Error> {
    let observed = s3.get_bucket_policy(bucket).await?;
    match (desired, observed) {
        (Some(desired), Some(observed)) if policies_equal(desired, &observed) => Ok(()),
        (Some(desired), _) => s3.put_bucket_policy(bucket, desired).await,
        (None, Some(_)) => s3.delete_bucket_policy(bucket).await,
        (None, None) => Ok(()),
    }
}

/// Remove every object and object version.
///
/// Each listed page is deleted concurrently; a page with failures stops the
/// sweep with one aggregated error.
pub async fn empty_bucket(s3: &dyn S3Backend, bucket: &str) -> Result<(), S3Error> {
    let delete = |key: String, version_id: Option<String>| async move {
        match s3.delete_object(bucket, &key, version_id).await {
            Ok(()) | Err(S3Error::NoSuchKey) => Ok(()),
            Err(e) => Err(e),
        }
    };

    let mut token = None;
    loop {
        let page = s3.list_objects(bucket, token).await?;
        aggregate(join_all(page.keys.into_iter().map(|k| delete(k, None))).await)?;
        token = page.next_continuation_token;
        if token.is_none() {
            break;
        }
    }

    let (mut key_marker, mut version_marker) = (None, None);
    loop {
        let page = s3
            .list_object_versions(bucket, key_marker, version_marker)
            .await?;
        let truncated = page.is_truncated();
        aggregate(
            join_all(
                page.versions
                    .into_iter()
                    .map(|v| delete(v.key, v.version_id)),
            )
            .await,
        )?;
        if !truncated {
            break;
        }
        key_marker = page.next_key_marker;
        version_marker = page.next_version_id_marker;
    }
    Ok(())
}
