//! S3 and STS capability interfaces
//!
//! Everything above this module talks to backends through [`S3Backend`] and
//! [`StsBackend`]. The aws-sdk implementations live in [`aws`]; tests use
//! in-memory or mockall doubles.

pub mod aws;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::bucket::{
    BucketLifecycleConfiguration, BucketParameters, ObjectLockConfiguration,
    VersioningConfiguration,
};
use crate::providerconfig::ProviderConfigSpec;

/// Bucket-level S3 operations used by convergence and the health probe
///
/// `get_*` calls return `Ok(None)` when the backend reports that the
/// configuration does not exist.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait S3Backend: Send + Sync {
    /// Returns false when the bucket does not exist
    async fn head_bucket(&self, bucket: &str) -> Result<bool, S3Error>;

    async fn create_bucket(
        &self,
        bucket: &str,
        object_lock_enabled: bool,
        location_constraint: Option<String>,
    ) -> Result<(), S3Error>;

    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), S3Error>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, S3Error>;

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<String>,
    ) -> Result<(), S3Error>;

    /// One page of ListObjectsV2
    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage, S3Error>;

    /// One page of ListObjectVersions, delete markers included
    async fn list_object_versions(
        &self,
        bucket: &str,
        key_marker: Option<String>,
        version_id_marker: Option<String>,
    ) -> Result<VersionPage, S3Error>;

    /// Canned ACLs cannot be read back, so there is no matching get
    async fn put_bucket_acl(&self, bucket: &str, acl: &BucketAcl) -> Result<(), S3Error>;

    async fn get_bucket_ownership_controls(
        &self,
        bucket: &str,
    ) -> Result<Option<String>, S3Error>;

    async fn put_bucket_ownership_controls(
        &self,
        bucket: &str,
        object_ownership: &str,
    ) -> Result<(), S3Error>;

    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>, S3Error>;

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), S3Error>;

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<(), S3Error>;

    async fn get_bucket_versioning(
        &self,
        bucket: &str,
    ) -> Result<Option<VersioningConfiguration>, S3Error>;

    async fn put_bucket_versioning(
        &self,
        bucket: &str,
        config: &VersioningConfiguration,
    ) -> Result<(), S3Error>;

    async fn get_bucket_lifecycle(
        &self,
        bucket: &str,
    ) -> Result<Option<BucketLifecycleConfiguration>, S3Error>;

    async fn put_bucket_lifecycle(
        &self,
        bucket: &str,
        config: &BucketLifecycleConfiguration,
    ) -> Result<(), S3Error>;

    async fn delete_bucket_lifecycle(&self, bucket: &str) -> Result<(), S3Error>;

    async fn get_object_lock_configuration(
        &self,
        bucket: &str,
    ) -> Result<Option<ObjectLockConfiguration>, S3Error>;

    async fn put_object_lock_configuration(
        &self,
        bucket: &str,
        config: &ObjectLockConfiguration,
    ) -> Result<(), S3Error>;
}

/// STS AssumeRole
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StsBackend: Send + Sync {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        tags: Vec<SessionTag>,
    ) -> Result<TemporaryCredentials, S3Error>;
}

/// Builds capability handles for one backend endpoint
#[cfg_attr(test, mockall::automock)]
pub trait ClientBuilder: Send + Sync {
    fn s3(
        &self,
        endpoint: &BackendEndpoint,
        credentials: &StaticCredentials,
    ) -> Result<Arc<dyn S3Backend>, S3Error>;

    fn sts(
        &self,
        endpoint: &BackendEndpoint,
        credentials: &StaticCredentials,
    ) -> Result<Arc<dyn StsBackend>, S3Error>;
}

/// S3 failure, classified by the vendor error code
#[derive(Clone, Debug, Error, PartialEq)]
pub enum S3Error {
    #[error("bucket already exists")]
    BucketAlreadyExists,
    #[error("bucket already owned by you")]
    BucketAlreadyOwnedByYou,
    #[error("bucket does not exist")]
    NoSuchBucket,
    #[error("bucket is not empty")]
    BucketNotEmpty,
    #[error("object does not exist")]
    NoSuchKey,
    #[error("configuration not found: {0}")]
    ConfigurationNotFound(String),
    #[error("{code}: {message}")]
    Service { code: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("{failed} of {total} operations failed, first error: {first}")]
    Batch {
        failed: usize,
        total: usize,
        first: Box<S3Error>,
    },
}

impl S3Error {
    /// Map an S3 error code onto a distinguished kind
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        match code {
            "BucketAlreadyExists" => S3Error::BucketAlreadyExists,
            "BucketAlreadyOwnedByYou" => S3Error::BucketAlreadyOwnedByYou,
            "NoSuchBucket" | "NotFound" => S3Error::NoSuchBucket,
            "BucketNotEmpty" => S3Error::BucketNotEmpty,
            "NoSuchKey" => S3Error::NoSuchKey,
            "NoSuchLifecycleConfiguration"
            | "ObjectLockConfigurationNotFoundError"
            | "NoSuchBucketPolicy"
            | "NoSuchBucketVersioning"
            | "OwnershipControlsNotFoundError" => S3Error::ConfigurationNotFound(code.to_string()),
            _ => S3Error::Service {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    /// Create errors that mean the bucket is already there
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            S3Error::BucketAlreadyExists | S3Error::BucketAlreadyOwnedByYou
        )
    }

    /// Short machine-readable reason for conditions
    pub fn reason(&self) -> &'static str {
        match self {
            S3Error::BucketNotEmpty => "BucketNotEmpty",
            S3Error::NoSuchBucket => "NoSuchBucket",
            S3Error::Transport(_) => "BackendUnreachable",
            _ => "ReconcileError",
        }
    }
}

/// Canned ACL and explicit grants
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BucketAcl {
    pub acl: Option<String>,
    pub grant_full_control: Option<String>,
    pub grant_read: Option<String>,
    pub grant_read_acp: Option<String>,
    pub grant_write: Option<String>,
    pub grant_write_acp: Option<String>,
}

impl From<&BucketParameters> for BucketAcl {
    fn from(params: &BucketParameters) -> Self {
        Self {
            acl: params.acl.clone(),
            grant_full_control: params.grant_full_control.clone(),
            grant_read: params.grant_read.clone(),
            grant_read_acp: params.grant_read_acp.clone(),
            grant_write: params.grant_write.clone(),
            grant_write_acp: params.grant_write_acp.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub next_continuation_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VersionPage {
    pub versions: Vec<ObjectVersion>,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
}

impl VersionPage {
    pub fn is_truncated(&self) -> bool {
        self.next_key_marker.is_some() || self.next_version_id_marker.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionTag {
    pub key: String,
    pub value: String,
}

/// AssumeRole response; any field may be missing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemporaryCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

/// Access keys for one backend
#[derive(Clone, PartialEq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl StaticCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Where a backend's S3 and STS endpoints live
#[derive(Clone, Debug, PartialEq)]
pub struct BackendEndpoint {
    pub host_base: String,
    pub sts_address: Option<String>,
    pub region: String,
    pub use_https: bool,
}

impl BackendEndpoint {
    pub fn url(&self) -> String {
        self.with_scheme(&self.host_base)
    }

    pub fn sts_url(&self) -> String {
        self.with_scheme(self.sts_address.as_deref().unwrap_or(&self.host_base))
    }

    fn with_scheme(&self, address: &str) -> String {
        if address.contains("://") {
            address.to_string()
        } else if self.use_https {
            format!("https://{address}")
        } else {
            format!("http://{address}")
        }
    }
}

impl From<&ProviderConfigSpec> for BackendEndpoint {
    fn from(spec: &ProviderConfigSpec) -> Self {
        Self {
            host_base: spec.host_base.clone(),
            sts_address: spec.sts_address.clone(),
            region: spec.region.clone(),
            use_https: spec.use_https,
        }
    }
}
