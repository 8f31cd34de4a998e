//! Kubernetes API access used by the reconcilers
//!
//! Reconcilers work against [`ResourceStore`] and [`SecretReader`] so the
//! optimistic-concurrency helpers and the controllers can be exercised with
//! in-memory stores.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource version conflict: {0}")]
    Conflict(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("Kubernetes API error: {0}")]
    Kube(kube::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(ae.message)
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
            other => StoreError::Kube(other),
        }
    }
}

/// Get/list/write access to one cluster-scoped resource kind
///
/// Writes carry the object's resourceVersion; a stale version yields
/// [`StoreError::Conflict`].
#[async_trait]
pub trait ResourceStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, StoreError>;

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace metadata and spec
    async fn replace(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace the status subresource
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// [`ResourceStore`] backed by the API server
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<K, StoreError> {
        Ok(self.api.get(name).await?)
    }

    #[instrument(skip(self))]
    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<K>, StoreError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.api.list(&params).await?.items)
    }

    #[instrument(skip(self, obj), fields(name = %obj.name_any()))]
    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    #[instrument(skip(self, obj), fields(name = %obj.name_any()))]
    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        Ok(self
            .api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    #[instrument(skip(self, obj), fields(name = %obj.name_any()))]
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let value = serde_json::to_value(obj)?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        Ok(self
            .api
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Reads Secret data
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, StoreError>;
}

pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecrets {
    #[instrument(skip(self))]
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}
