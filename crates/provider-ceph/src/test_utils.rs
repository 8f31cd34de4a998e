//! In-memory fakes for the S3 backends, the API server and Secrets

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;

use crate::backend::{Backend, BackendRegistry};
use crate::bucket::{
    Bucket, BucketLifecycleConfiguration, BucketSpec, ObjectLockConfiguration,
    VersioningConfiguration,
};
use crate::cache::ExistenceCache;
use crate::config::{labels, OperatorConfig};
use crate::controllers::ratelimit::ReconcileRateLimiter;
use crate::controllers::retry::{ConflictBackoff, RetryTracker};
use crate::controllers::ControllerContext;
use crate::convergence::Converger;
use crate::credentials::{CredentialResolver, ACCESS_KEY, SECRET_KEY};
use crate::healthcheck::InitialCheckTracker;
use crate::providerconfig::{
    CredentialsSource, HealthStatus, ProviderConfig, ProviderConfigSpec, ProviderCredentials,
    SecretReference,
};
use crate::s3::{
    BackendEndpoint, BucketAcl, ClientBuilder, MockStsBackend, ObjectPage, ObjectVersion,
    S3Backend, S3Error, StaticCredentials, StsBackend, VersionPage,
};
use crate::store::{ResourceStore, SecretReader, StoreError};
use crate::unpause::{UnpauseHandle, Unpauser};

const PAGE_SIZE: usize = 2;
const SECRET_NAMESPACE: &str = "crossplane-system";

#[derive(Default)]
struct MemBucket {
    objects: BTreeMap<String, Vec<u8>>,
    versions: BTreeSet<(String, String)>,
    versioning: Option<VersioningConfiguration>,
    lifecycle: Option<BucketLifecycleConfiguration>,
    object_lock: Option<ObjectLockConfiguration>,
    policy: Option<String>,
    acl: Option<BucketAcl>,
    ownership: Option<String>,
}

/// S3 backend held in memory, with an outage switch and per-operation counts
#[derive(Default)]
pub struct InMemoryS3 {
    buckets: Mutex<BTreeMap<String, MemBucket>>,
    unreachable: AtomicBool,
    calls: Mutex<HashMap<&'static str, usize>>,
    log: Mutex<Vec<&'static str>>,
}

impl InMemoryS3 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Every operation in call order
    pub fn ops(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.buckets.lock().contains_key(bucket)
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key).cloned())
    }

    /// Objects plus object versions
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .get(bucket)
            .map_or(0, |b| b.objects.len() + b.versions.len())
    }

    pub fn add_version(&self, bucket: &str, key: &str, version_id: &str) {
        if let Some(b) = self.buckets.lock().get_mut(bucket) {
            b.versions.insert((key.to_string(), version_id.to_string()));
        }
    }

    pub fn lifecycle(&self, bucket: &str) -> Option<BucketLifecycleConfiguration> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.lifecycle.clone())
    }

    pub fn versioning(&self, bucket: &str) -> Option<VersioningConfiguration> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.versioning.clone())
    }

    pub fn acl(&self, bucket: &str) -> Option<BucketAcl> {
        self.buckets.lock().get(bucket).and_then(|b| b.acl.clone())
    }

    pub fn ownership(&self, bucket: &str) -> Option<String> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.ownership.clone())
    }

    pub fn object_lock(&self, bucket: &str) -> Option<ObjectLockConfiguration> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.object_lock.clone())
    }

    fn enter(&self, op: &'static str) -> Result<(), S3Error> {
        *self.calls.lock().entry(op).or_default() += 1;
        self.log.lock().push(op);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(S3Error::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn with_bucket<T>(
        &self,
        op: &'static str,
        bucket: &str,
        f: impl FnOnce(&mut MemBucket) -> Result<T, S3Error>,
    ) -> Result<T, S3Error> {
        self.enter(op)?;
        let mut buckets = self.buckets.lock();
        let b = buckets.get_mut(bucket).ok_or(S3Error::NoSuchBucket)?;
        f(b)
    }
}

#[async_trait]
impl S3Backend for InMemoryS3 {
    async fn head_bucket(&self, bucket: &str) -> Result<bool, S3Error> {
        self.enter("head_bucket")?;
        Ok(self.bucket_exists(bucket))
    }

    async fn create_bucket(
        &self,
        bucket: &str,
        object_lock_enabled: bool,
        _location_constraint: Option<String>,
    ) -> Result<(), S3Error> {
        self.enter("create_bucket")?;
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Err(S3Error::BucketAlreadyOwnedByYou);
        }
        let mut created = MemBucket::default();
        if object_lock_enabled {
            created.object_lock = Some(ObjectLockConfiguration {
                object_lock_enabled: Some("Enabled".to_string()),
                rule: None,
            });
        }
        buckets.insert(bucket.to_string(), created);
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        self.enter("delete_bucket")?;
        let mut buckets = self.buckets.lock();
        let b = buckets.get(bucket).ok_or(S3Error::NoSuchBucket)?;
        if !b.objects.is_empty() || !b.versions.is_empty() {
            return Err(S3Error::BucketNotEmpty);
        }
        buckets.remove(bucket);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), S3Error> {
        self.with_bucket("put_object", bucket, |b| {
            b.objects.insert(key.to_string(), body);
            Ok(())
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, S3Error> {
        self.with_bucket("get_object", bucket, |b| {
            b.objects.get(key).cloned().ok_or(S3Error::NoSuchKey)
        })
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<String>,
    ) -> Result<(), S3Error> {
        self.with_bucket("delete_object", bucket, |b| {
            match version_id {
                Some(v) => b.versions.remove(&(key.to_string(), v)),
                None => b.objects.remove(key).is_some(),
            };
            Ok(())
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage, S3Error> {
        self.with_bucket("list_objects", bucket, |b| {
            let mut keys: Vec<String> = b
                .objects
                .keys()
                .filter(|k| continuation_token.as_ref().map_or(true, |t| *k > t))
                .take(PAGE_SIZE + 1)
                .cloned()
                .collect();
            let more = keys.len() > PAGE_SIZE;
            keys.truncate(PAGE_SIZE);
            Ok(ObjectPage {
                next_continuation_token: more.then(|| keys.last().cloned()).flatten(),
                keys,
            })
        })
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        key_marker: Option<String>,
        version_id_marker: Option<String>,
    ) -> Result<VersionPage, S3Error> {
        self.with_bucket("list_object_versions", bucket, |b| {
            let marker = key_marker.zip(version_id_marker);
            let mut page: Vec<(String, String)> = b
                .versions
                .iter()
                .filter(|v| marker.as_ref().map_or(true, |m| *v > m))
                .take(PAGE_SIZE + 1)
                .cloned()
                .collect();
            let more = page.len() > PAGE_SIZE;
            page.truncate(PAGE_SIZE);
            let last = page.last().cloned().filter(|_| more);
            Ok(VersionPage {
                versions: page
                    .into_iter()
                    .map(|(key, version_id)| ObjectVersion {
                        key,
                        version_id: Some(version_id),
                    })
                    .collect(),
                next_key_marker: last.as_ref().map(|l| l.0.clone()),
                next_version_id_marker: last.map(|l| l.1),
            })
        })
    }

    async fn put_bucket_acl(&self, bucket: &str, acl: &BucketAcl) -> Result<(), S3Error> {
        self.with_bucket("put_bucket_acl", bucket, |b| {
            b.acl = Some(acl.clone());
            Ok(())
        })
    }

    async fn get_bucket_ownership_controls(
        &self,
        bucket: &str,
    ) -> Result<Option<String>, S3Error> {
        self.with_bucket("get_bucket_ownership_controls", bucket, |b| {
            Ok(b.ownership.clone())
        })
    }

    async fn put_bucket_ownership_controls(
        &self,
        bucket: &str,
        object_ownership: &str,
    ) -> Result<(), S3Error> {
        self.with_bucket("put_bucket_ownership_controls", bucket, |b| {
            b.ownership = Some(object_ownership.to_string());
            Ok(())
        })
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>, S3Error> {
        self.with_bucket("get_bucket_policy", bucket, |b| Ok(b.policy.clone()))
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), S3Error> {
        self.with_bucket("put_bucket_policy", bucket, |b| {
            b.policy = Some(policy.to_string());
            Ok(())
        })
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<(), S3Error> {
        self.with_bucket("delete_bucket_policy", bucket, |b| {
            b.policy = None;
            Ok(())
        })
    }

    async fn get_bucket_versioning(
        &self,
        bucket: &str,
    ) -> Result<Option<VersioningConfiguration>, S3Error> {
        self.with_bucket("get_bucket_versioning", bucket, |b| Ok(b.versioning.clone()))
    }

    async fn put_bucket_versioning(
        &self,
        bucket: &str,
        config: &VersioningConfiguration,
    ) -> Result<(), S3Error> {
        self.with_bucket("put_bucket_versioning", bucket, |b| {
            b.versioning = Some(config.clone());
            Ok(())
        })
    }

    async fn get_bucket_lifecycle(
        &self,
        bucket: &str,
    ) -> Result<Option<BucketLifecycleConfiguration>, S3Error> {
        self.with_bucket("get_bucket_lifecycle", bucket, |b| Ok(b.lifecycle.clone()))
    }

    async fn put_bucket_lifecycle(
        &self,
        bucket: &str,
        config: &BucketLifecycleConfiguration,
    ) -> Result<(), S3Error> {
        self.with_bucket("put_bucket_lifecycle", bucket, |b| {
            b.lifecycle = Some(config.clone());
            Ok(())
        })
    }

    async fn delete_bucket_lifecycle(&self, bucket: &str) -> Result<(), S3Error> {
        self.with_bucket("delete_bucket_lifecycle", bucket, |b| {
            b.lifecycle = None;
            Ok(())
        })
    }

    async fn get_object_lock_configuration(
        &self,
        bucket: &str,
    ) -> Result<Option<ObjectLockConfiguration>, S3Error> {
        self.with_bucket("get_object_lock_configuration", bucket, |b| {
            Ok(b.object_lock.clone())
        })
    }

    async fn put_object_lock_configuration(
        &self,
        bucket: &str,
        config: &ObjectLockConfiguration,
    ) -> Result<(), S3Error> {
        self.with_bucket("put_object_lock_configuration", bucket, |b| {
            // Object lock can only be configured on buckets created with it
            if b.object_lock.is_none() {
                return Err(S3Error::Service {
                    code: "InvalidBucketState".to_string(),
                    message: "object lock is not enabled".to_string(),
                });
            }
            b.object_lock = Some(config.clone());
            Ok(())
        })
    }
}

/// API-server stand-in for one resource kind.
///
/// Writes check resourceVersion, deletes honour finalizers, and conflicts
/// can be injected.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    pending_conflicts: AtomicU32,
    write_attempts: AtomicU32,
    next_version: AtomicU64,
}

fn deletion_time() -> Time {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(now)).expect("valid timestamp")
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            pending_conflicts: AtomicU32::new(0),
            write_attempts: AtomicU32::new(0),
            next_version: AtomicU64::new(0),
        }
    }

    fn stamp(&self, obj: &mut K) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    /// Insert or overwrite, assigning a uid and a fresh resourceVersion
    pub fn insert(&self, mut obj: K) -> K {
        let name = obj.name_any();
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(format!("uid-{name}"));
        }
        self.stamp(&mut obj);
        self.objects.lock().insert(name, obj.clone());
        obj
    }

    pub fn get_copy(&self, name: &str) -> Option<K> {
        self.objects.lock().get(name).cloned()
    }

    /// Drop an object, bypassing finalizers
    pub fn remove(&self, name: &str) -> Option<K> {
        self.objects.lock().remove(name)
    }

    /// Fail the next `n` writes with a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Replace and status writes attempted, conflicts included
    pub fn write_attempts(&self) -> u32 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    fn write(&self, obj: &K) -> Result<K, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let name = obj.name_any();
        if self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict(format!("injected conflict on {name}")));
        }

        let mut objects = self.objects.lock();
        let current = objects
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(StoreError::Conflict(format!("stale resourceVersion on {name}")));
        }

        let mut updated = obj.clone();
        self.stamp(&mut updated);
        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.remove(&name);
        } else {
            objects.insert(name, updated.clone());
        }
        Ok(updated)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.get_copy(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>, StoreError> {
        let required: Vec<(&str, &str)> = label_selector
            .unwrap_or_default()
            .split(',')
            .filter_map(|term| term.split_once('='))
            .collect();
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|obj| {
                required
                    .iter()
                    .all(|(k, v)| obj.labels().get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        if self.objects.lock().contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        Ok(self.insert(obj.clone()))
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj)
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        self.write(obj)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        let obj = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if obj.finalizers().is_empty() {
            objects.remove(name);
        } else if obj.meta().deletion_timestamp.is_none() {
            obj.meta_mut().deletion_timestamp = Some(deletion_time());
            let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
            obj.meta_mut().resource_version = Some(version.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySecrets {
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl MemorySecrets {
    pub fn insert(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.secrets
            .lock()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.secrets
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl SecretReader for MemorySecrets {
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        self.secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("secret {namespace}/{name}")))
    }
}

/// Hands out one [`InMemoryS3`] per host
#[derive(Default)]
pub struct FakeClientBuilder {
    backends: Mutex<HashMap<String, Arc<InMemoryS3>>>,
}

impl FakeClientBuilder {
    pub fn backend(&self, host: &str) -> Arc<InMemoryS3> {
        self.backends
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(InMemoryS3::new()))
            .clone()
    }
}

impl ClientBuilder for FakeClientBuilder {
    fn s3(
        &self,
        endpoint: &BackendEndpoint,
        _credentials: &StaticCredentials,
    ) -> Result<Arc<dyn S3Backend>, S3Error> {
        Ok(self.backend(&endpoint.host_base))
    }

    fn sts(
        &self,
        _endpoint: &BackendEndpoint,
        _credentials: &StaticCredentials,
    ) -> Result<Arc<dyn StsBackend>, S3Error> {
        Ok(Arc::new(MockStsBackend::new()))
    }
}

/// A controller context wired to in-memory fakes, with a live unpause worker
pub struct TestHarness {
    pub ctx: Arc<ControllerContext>,
    pub buckets: Arc<MemoryStore<Bucket>>,
    pub provider_configs: Arc<MemoryStore<ProviderConfig>>,
    pub secrets: Arc<MemorySecrets>,
    pub builder: Arc<FakeClientBuilder>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(BackendRegistry::new());
        let buckets: Arc<MemoryStore<Bucket>> = Arc::new(MemoryStore::new());
        let provider_configs: Arc<MemoryStore<ProviderConfig>> = Arc::new(MemoryStore::new());
        let secrets = Arc::new(MemorySecrets::default());
        let builder = Arc::new(FakeClientBuilder::default());
        let existence_cache = Arc::new(ExistenceCache::new(config.existence_cache_ttl()));
        let conflict_backoff = ConflictBackoff {
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let (unpause, rx) = UnpauseHandle::channel();
        let unpauser = Arc::new(Unpauser::new(
            buckets.clone(),
            conflict_backoff.clone(),
            config.auto_pause,
        ));
        unpause.spawn_worker(rx, unpauser);

        let ctx = Arc::new(ControllerContext {
            config: config.clone(),
            registry: registry.clone(),
            buckets: buckets.clone(),
            provider_configs: provider_configs.clone(),
            secrets: secrets.clone(),
            client_builder: builder.clone(),
            credentials: Arc::new(CredentialResolver::new(
                registry,
                builder.clone(),
                config.assume_role_arn.clone(),
            )),
            converger: Arc::new(Converger::new(existence_cache)),
            unpause,
            initial_checks: Arc::new(InitialCheckTracker::new()),
            retry_tracker: Arc::new(RetryTracker::new()),
            rate_limiter: Arc::new(ReconcileRateLimiter::unlimited()),
            conflict_backoff,
        });

        Self {
            ctx,
            buckets,
            provider_configs,
            secrets,
            builder,
        }
    }

    pub fn s3(&self, host: &str) -> Arc<InMemoryS3> {
        self.builder.backend(host)
    }

    /// Store a ProviderConfig and the Secret it references
    pub fn add_provider_config(&self, name: &str, host: &str) -> ProviderConfig {
        let secret_name = format!("{name}-keys");
        self.secrets.insert(
            SECRET_NAMESPACE,
            &secret_name,
            BTreeMap::from([
                (ACCESS_KEY.to_string(), b"AKIDEXAMPLE".to_vec()),
                (SECRET_KEY.to_string(), b"wJalrXUtnFEMI".to_vec()),
            ]),
        );
        self.provider_configs.insert(ProviderConfig::new(
            name,
            ProviderConfigSpec {
                host_base: host.to_string(),
                sts_address: None,
                region: "us-east-1".to_string(),
                use_https: false,
                credentials: ProviderCredentials {
                    source: CredentialsSource::Secret,
                    secret_ref: Some(SecretReference {
                        namespace: SECRET_NAMESPACE.to_string(),
                        name: secret_name,
                    }),
                },
                disable_health_check: false,
            },
        ))
    }

    /// Store a ProviderConfig and register it as a healthy, active backend
    pub fn register_backend(&self, name: &str, host: &str) {
        let pc = self.add_provider_config(name, host);
        self.ctx.registry.add_or_update_backend(
            name,
            Backend {
                s3: self.s3(host),
                sts: None,
                endpoint: BackendEndpoint::from(&pc.spec),
                active: true,
                health: HealthStatus::Healthy,
            },
        );
    }

    /// Store a Bucket on `backend` carrying the pause marker
    pub fn insert_paused_bucket(&self, name: &str, backend: &str, auto_pause: bool) -> Bucket {
        let mut bucket = Bucket::new(
            name,
            BucketSpec {
                providers: Some(vec![backend.to_string()]),
                auto_pause,
                ..Default::default()
            },
        );
        bucket
            .labels_mut()
            .insert(labels::backend(backend), "true".to_string());
        bucket.set_paused(true);
        self.buckets.insert(bucket)
    }

    /// Mark a registered backend the way a failed probe does
    pub fn mark_unhealthy(&self, name: &str) {
        self.ctx
            .registry
            .set_backend_health_status(name, HealthStatus::Unhealthy);
        self.ctx.registry.toggle_backend_active_status(name, false);
    }

    /// Wait until the unpause worker has finished `backend`
    pub async fn wait_for_unpause(&self, backend: &str) {
        for _ in 0..200 {
            if !self.ctx.unpause.is_pending(backend) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("unpause for {backend} never finished");
    }

    pub fn unpauser(&self) -> Unpauser {
        Unpauser::new(
            self.buckets.clone(),
            self.ctx.conflict_backoff.clone(),
            self.ctx.config.auto_pause,
        )
    }
}
