//! aws-sdk backed implementations of the S3 and STS capabilities

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types as s3t;
use aws_sdk_s3::Client;
use tracing::instrument;

use super::{
    BackendEndpoint, BucketAcl, ClientBuilder, ObjectPage, ObjectVersion, S3Backend, S3Error,
    SessionTag, StaticCredentials, StsBackend, TemporaryCredentials, VersionPage,
};
use crate::bucket::{
    AbortIncompleteMultipartUpload, BucketLifecycleConfiguration, DefaultRetention,
    LifecycleExpiration, LifecycleRule, LifecycleRuleAndOperator, LifecycleRuleFilter, MfaDelete,
    NoncurrentVersionExpiration, ObjectLockConfiguration, ObjectLockRule, RetentionMode,
    RuleStatus, Tag, Transition, VersioningConfiguration, VersioningStatus,
};

const PROVIDER_NAME: &str = "provider-ceph";

fn sdk_error<E, R>(err: SdkError<E, R>) -> S3Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(service) => match service.err().code() {
            Some(code) => S3Error::from_code(code, service.err().message().unwrap_or_default()),
            None => S3Error::Service {
                code: "Unknown".to_string(),
                message: DisplayErrorContext(&err).to_string(),
            },
        },
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            S3Error::Transport(DisplayErrorContext(&err).to_string())
        }
        _ => S3Error::Invalid(DisplayErrorContext(&err).to_string()),
    }
}

fn build_error(err: BuildError) -> S3Error {
    S3Error::Invalid(err.to_string())
}

/// Treat a "configuration not found" error as an absent configuration
fn not_found_as_none<T>(result: Result<T, S3Error>) -> Result<Option<T>, S3Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(S3Error::ConfigurationNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// S3 client for one backend
#[derive(Clone)]
pub struct AwsS3Backend {
    client: Client,
}

impl AwsS3Backend {
    pub fn new(
        endpoint: &BackendEndpoint,
        credentials: &StaticCredentials,
        timeout: Duration,
    ) -> Self {
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(endpoint.region.clone()))
            .credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                credentials.session_token.clone(),
                None,
                PROVIDER_NAME,
            ))
            .endpoint_url(endpoint.url())
            .force_path_style(true)
            .timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build())
            .build();
        Self {
            client: Client::from_conf(config),
        }
    }
}

#[async_trait]
impl S3Backend for AwsS3Backend {
    #[instrument(skip(self))]
    async fn head_bucket(&self, bucket: &str) -> Result<bool, S3Error> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => match sdk_error(e) {
                S3Error::NoSuchBucket => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self))]
    async fn create_bucket(
        &self,
        bucket: &str,
        object_lock_enabled: bool,
        location_constraint: Option<String>,
    ) -> Result<(), S3Error> {
        let mut request = self
            .client
            .create_bucket()
            .bucket(bucket)
            .object_lock_enabled_for_bucket(object_lock_enabled);
        if let Some(location) = location_constraint {
            let config = s3t::CreateBucketConfiguration::builder()
                .location_constraint(s3t::BucketLocationConstraint::from(location.as_str()))
                .build();
            request = request.create_bucket_configuration(config);
        }
        request.send().await.map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self, body))]
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), S3Error> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, S3Error> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| S3Error::Transport(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    #[instrument(skip(self))]
    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<String>,
    ) -> Result<(), S3Error> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage, S3Error> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(sdk_error)?;
        let keys = response
            .contents()
            .iter()
            .filter_map(|o| o.key().map(str::to_string))
            .collect();
        let next_continuation_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ObjectPage {
            keys,
            next_continuation_token,
        })
    }

    #[instrument(skip(self))]
    async fn list_object_versions(
        &self,
        bucket: &str,
        key_marker: Option<String>,
        version_id_marker: Option<String>,
    ) -> Result<VersionPage, S3Error> {
        let response = self
            .client
            .list_object_versions()
            .bucket(bucket)
            .set_key_marker(key_marker)
            .set_version_id_marker(version_id_marker)
            .send()
            .await
            .map_err(sdk_error)?;

        let mut versions: Vec<ObjectVersion> = response
            .versions()
            .iter()
            .filter_map(|v| {
                v.key().map(|key| ObjectVersion {
                    key: key.to_string(),
                    version_id: v.version_id().map(str::to_string),
                })
            })
            .collect();
        versions.extend(response.delete_markers().iter().filter_map(|m| {
            m.key().map(|key| ObjectVersion {
                key: key.to_string(),
                version_id: m.version_id().map(str::to_string),
            })
        }));

        let (next_key_marker, next_version_id_marker) =
            if response.is_truncated().unwrap_or(false) {
                (
                    response.next_key_marker().map(str::to_string),
                    response.next_version_id_marker().map(str::to_string),
                )
            } else {
                (None, None)
            };
        Ok(VersionPage {
            versions,
            next_key_marker,
            next_version_id_marker,
        })
    }

    #[instrument(skip(self))]
    async fn put_bucket_acl(&self, bucket: &str, acl: &BucketAcl) -> Result<(), S3Error> {
        self.client
            .put_bucket_acl()
            .bucket(bucket)
            .set_acl(acl.acl.as_deref().map(s3t::BucketCannedAcl::from))
            .set_grant_full_control(acl.grant_full_control.clone())
            .set_grant_read(acl.grant_read.clone())
            .set_grant_read_acp(acl.grant_read_acp.clone())
            .set_grant_write(acl.grant_write.clone())
            .set_grant_write_acp(acl.grant_write_acp.clone())
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_bucket_ownership_controls(
        &self,
        bucket: &str,
    ) -> Result<Option<String>, S3Error> {
        let result = self
            .client
            .get_bucket_ownership_controls()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)
            .map(|r| {
                r.ownership_controls()
                    .and_then(|c| c.rules().first())
                    .map(|rule| rule.object_ownership().as_str().to_string())
            });
        Ok(not_found_as_none(result)?.flatten())
    }

    #[instrument(skip(self))]
    async fn put_bucket_ownership_controls(
        &self,
        bucket: &str,
        object_ownership: &str,
    ) -> Result<(), S3Error> {
        let rule = s3t::OwnershipControlsRule::builder()
            .object_ownership(s3t::ObjectOwnership::from(object_ownership))
            .build()
            .map_err(build_error)?;
        let controls = s3t::OwnershipControls::builder()
            .rules(rule)
            .build()
            .map_err(build_error)?;
        self.client
            .put_bucket_ownership_controls()
            .bucket(bucket)
            .ownership_controls(controls)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>, S3Error> {
        let result = self
            .client
            .get_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)
            .map(|r| r.policy().map(str::to_string));
        Ok(not_found_as_none(result)?.flatten())
    }

    #[instrument(skip(self, policy))]
    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), S3Error> {
        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_bucket_policy(&self, bucket: &str) -> Result<(), S3Error> {
        self.client
            .delete_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_bucket_versioning(
        &self,
        bucket: &str,
    ) -> Result<Option<VersioningConfiguration>, S3Error> {
        let result = self
            .client
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)
            .map(|r| VersioningConfiguration {
                status: r.status().and_then(|s| match s {
                    s3t::BucketVersioningStatus::Enabled => Some(VersioningStatus::Enabled),
                    s3t::BucketVersioningStatus::Suspended => Some(VersioningStatus::Suspended),
                    _ => None,
                }),
                mfa_delete: r.mfa_delete().and_then(|m| match m {
                    s3t::MfaDeleteStatus::Enabled => Some(MfaDelete::Enabled),
                    s3t::MfaDeleteStatus::Disabled => Some(MfaDelete::Disabled),
                    _ => None,
                }),
            });
        not_found_as_none(result)
    }

    #[instrument(skip(self))]
    async fn put_bucket_versioning(
        &self,
        bucket: &str,
        config: &VersioningConfiguration,
    ) -> Result<(), S3Error> {
        let sdk_config = s3t::VersioningConfiguration::builder()
            .set_status(config.status.map(|s| match s {
                VersioningStatus::Enabled => s3t::BucketVersioningStatus::Enabled,
                VersioningStatus::Suspended => s3t::BucketVersioningStatus::Suspended,
            }))
            .set_mfa_delete(config.mfa_delete.map(|m| match m {
                MfaDelete::Enabled => s3t::MfaDelete::Enabled,
                MfaDelete::Disabled => s3t::MfaDelete::Disabled,
            }))
            .build();
        self.client
            .put_bucket_versioning()
            .bucket(bucket)
            .versioning_configuration(sdk_config)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_bucket_lifecycle(
        &self,
        bucket: &str,
    ) -> Result<Option<BucketLifecycleConfiguration>, S3Error> {
        let result = self
            .client
            .get_bucket_lifecycle_configuration()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)
            .map(|r| BucketLifecycleConfiguration {
                rules: r.rules().iter().map(lifecycle_rule_from_sdk).collect(),
            });
        not_found_as_none(result)
    }

    #[instrument(skip(self))]
    async fn put_bucket_lifecycle(
        &self,
        bucket: &str,
        config: &BucketLifecycleConfiguration,
    ) -> Result<(), S3Error> {
        let rules = config
            .rules
            .iter()
            .map(lifecycle_rule_to_sdk)
            .collect::<Result<Vec<_>, _>>()?;
        let sdk_config = s3t::BucketLifecycleConfiguration::builder()
            .set_rules(Some(rules))
            .build()
            .map_err(build_error)?;
        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(bucket)
            .lifecycle_configuration(sdk_config)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_bucket_lifecycle(&self, bucket: &str) -> Result<(), S3Error> {
        self.client
            .delete_bucket_lifecycle()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_object_lock_configuration(
        &self,
        bucket: &str,
    ) -> Result<Option<ObjectLockConfiguration>, S3Error> {
        let result = self
            .client
            .get_object_lock_configuration()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)
            .map(|r| r.object_lock_configuration().map(object_lock_from_sdk));
        Ok(not_found_as_none(result)?.flatten())
    }

    #[instrument(skip(self))]
    async fn put_object_lock_configuration(
        &self,
        bucket: &str,
        config: &ObjectLockConfiguration,
    ) -> Result<(), S3Error> {
        self.client
            .put_object_lock_configuration()
            .bucket(bucket)
            .object_lock_configuration(object_lock_to_sdk(config))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

fn tag_to_sdk(tag: &Tag) -> Result<s3t::Tag, S3Error> {
    s3t::Tag::builder()
        .key(&tag.key)
        .value(&tag.value)
        .build()
        .map_err(build_error)
}

fn tag_from_sdk(tag: &s3t::Tag) -> Tag {
    Tag {
        key: tag.key().to_string(),
        value: tag.value().to_string(),
    }
}

fn lifecycle_rule_to_sdk(rule: &LifecycleRule) -> Result<s3t::LifecycleRule, S3Error> {
    let filter = match &rule.filter {
        Some(filter) => {
            let and = match &filter.and {
                Some(and) => Some(
                    s3t::LifecycleRuleAndOperator::builder()
                        .set_prefix(and.prefix.clone())
                        .set_tags(Some(
                            and.tags.iter().map(tag_to_sdk).collect::<Result<Vec<_>, _>>()?,
                        ))
                        .set_object_size_greater_than(and.object_size_greater_than)
                        .set_object_size_less_than(and.object_size_less_than)
                        .build(),
                ),
                None => None,
            };
            Some(
                s3t::LifecycleRuleFilter::builder()
                    .set_prefix(filter.prefix.clone())
                    .set_tag(filter.tag.as_ref().map(tag_to_sdk).transpose()?)
                    .set_and(and)
                    .set_object_size_greater_than(filter.object_size_greater_than)
                    .set_object_size_less_than(filter.object_size_less_than)
                    .build(),
            )
        }
        None => None,
    };

    let transitions = rule
        .transitions
        .iter()
        .map(|t| {
            s3t::Transition::builder()
                .set_days(t.days)
                .storage_class(s3t::TransitionStorageClass::from(t.storage_class.as_str()))
                .build()
        })
        .collect::<Vec<_>>();

    s3t::LifecycleRule::builder()
        .set_id(rule.id.clone())
        .status(match rule.status {
            RuleStatus::Enabled => s3t::ExpirationStatus::Enabled,
            RuleStatus::Disabled => s3t::ExpirationStatus::Disabled,
        })
        .set_filter(filter)
        .set_expiration(rule.expiration.as_ref().map(|e| {
            s3t::LifecycleExpiration::builder()
                .set_days(e.days)
                .set_expired_object_delete_marker(e.expired_object_delete_marker)
                .build()
        }))
        .set_noncurrent_version_expiration(rule.noncurrent_version_expiration.as_ref().map(|n| {
            s3t::NoncurrentVersionExpiration::builder()
                .set_noncurrent_days(n.noncurrent_days)
                .set_newer_noncurrent_versions(n.newer_noncurrent_versions)
                .build()
        }))
        .set_abort_incomplete_multipart_upload(rule.abort_incomplete_multipart_upload.as_ref().map(
            |a| {
                s3t::AbortIncompleteMultipartUpload::builder()
                    .set_days_after_initiation(a.days_after_initiation)
                    .build()
            },
        ))
        .set_transitions((!transitions.is_empty()).then_some(transitions))
        .build()
        .map_err(build_error)
}

fn lifecycle_rule_from_sdk(rule: &s3t::LifecycleRule) -> LifecycleRule {
    LifecycleRule {
        id: rule.id().map(str::to_string),
        status: match rule.status() {
            s3t::ExpirationStatus::Enabled => RuleStatus::Enabled,
            _ => RuleStatus::Disabled,
        },
        filter: rule.filter().map(|f| LifecycleRuleFilter {
            prefix: f.prefix().map(str::to_string),
            tag: f.tag().map(tag_from_sdk),
            and: f.and().map(|a| LifecycleRuleAndOperator {
                prefix: a.prefix().map(str::to_string),
                tags: a.tags().iter().map(tag_from_sdk).collect(),
                object_size_greater_than: a.object_size_greater_than(),
                object_size_less_than: a.object_size_less_than(),
            }),
            object_size_greater_than: f.object_size_greater_than(),
            object_size_less_than: f.object_size_less_than(),
        }),
        expiration: rule.expiration().map(|e| LifecycleExpiration {
            days: e.days(),
            expired_object_delete_marker: e.expired_object_delete_marker(),
        }),
        noncurrent_version_expiration: rule.noncurrent_version_expiration().map(|n| {
            NoncurrentVersionExpiration {
                noncurrent_days: n.noncurrent_days(),
                newer_noncurrent_versions: n.newer_noncurrent_versions(),
            }
        }),
        abort_incomplete_multipart_upload: rule.abort_incomplete_multipart_upload().map(|a| {
            AbortIncompleteMultipartUpload {
                days_after_initiation: a.days_after_initiation(),
            }
        }),
        transitions: rule
            .transitions()
            .iter()
            .map(|t| Transition {
                days: t.days(),
                storage_class: t
                    .storage_class()
                    .map(|c| c.as_str().to_string())
                    .unwrap_or_default(),
            })
            .collect(),
    }
}

fn object_lock_to_sdk(config: &ObjectLockConfiguration) -> s3t::ObjectLockConfiguration {
    s3t::ObjectLockConfiguration::builder()
        .set_object_lock_enabled(
            config
                .object_lock_enabled
                .as_deref()
                .map(s3t::ObjectLockEnabled::from),
        )
        .set_rule(config.rule.as_ref().map(|r| {
            s3t::ObjectLockRule::builder()
                .set_default_retention(r.default_retention.as_ref().map(|d| {
                    s3t::DefaultRetention::builder()
                        .set_mode(d.mode.map(|m| match m {
                            RetentionMode::Governance => s3t::ObjectLockRetentionMode::Governance,
                            RetentionMode::Compliance => s3t::ObjectLockRetentionMode::Compliance,
                        }))
                        .set_days(d.days)
                        .set_years(d.years)
                        .build()
                }))
                .build()
        }))
        .build()
}

fn object_lock_from_sdk(config: &s3t::ObjectLockConfiguration) -> ObjectLockConfiguration {
    ObjectLockConfiguration {
        object_lock_enabled: config.object_lock_enabled().map(|e| e.as_str().to_string()),
        rule: config.rule().map(|r| ObjectLockRule {
            default_retention: r.default_retention().map(|d| DefaultRetention {
                mode: d.mode().and_then(|m| match m {
                    s3t::ObjectLockRetentionMode::Governance => Some(RetentionMode::Governance),
                    s3t::ObjectLockRetentionMode::Compliance => Some(RetentionMode::Compliance),
                    _ => None,
                }),
                days: d.days(),
                years: d.years(),
            }),
        }),
    }
}

/// STS client for one backend
#[derive(Clone)]
pub struct AwsStsBackend {
    client: aws_sdk_sts::Client,
}

impl AwsStsBackend {
    pub fn new(
        endpoint: &BackendEndpoint,
        credentials: &StaticCredentials,
        timeout: Duration,
    ) -> Self {
        let config = aws_sdk_sts::config::Builder::new()
            .behavior_version(aws_sdk_sts::config::BehaviorVersion::latest())
            .region(aws_sdk_sts::config::Region::new(endpoint.region.clone()))
            .credentials_provider(aws_sdk_sts::config::Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                credentials.session_token.clone(),
                None,
                PROVIDER_NAME,
            ))
            .endpoint_url(endpoint.sts_url())
            .timeout_config(
                aws_sdk_sts::config::timeout::TimeoutConfig::builder()
                    .operation_timeout(timeout)
                    .build(),
            )
            .build();
        Self {
            client: aws_sdk_sts::Client::from_conf(config),
        }
    }
}

#[async_trait]
impl StsBackend for AwsStsBackend {
    #[instrument(skip(self, tags))]
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        tags: Vec<SessionTag>,
    ) -> Result<TemporaryCredentials, S3Error> {
        let sdk_tags = tags
            .into_iter()
            .map(|t| {
                aws_sdk_sts::types::Tag::builder()
                    .key(t.key)
                    .value(t.value)
                    .build()
                    .map_err(|e| S3Error::Invalid(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let response = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .set_tags(Some(sdk_tags))
            .send()
            .await
            .map_err(sdk_error)?;

        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Ok(match response.credentials() {
            Some(c) => TemporaryCredentials {
                access_key_id: non_empty(c.access_key_id()),
                secret_access_key: non_empty(c.secret_access_key()),
                session_token: non_empty(c.session_token()),
            },
            None => TemporaryCredentials::default(),
        })
    }
}

/// Builds aws-sdk clients with a per-operation timeout
#[derive(Clone, Debug)]
pub struct AwsClientBuilder {
    timeout: Duration,
}

impl AwsClientBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientBuilder for AwsClientBuilder {
    fn s3(
        &self,
        endpoint: &BackendEndpoint,
        credentials: &StaticCredentials,
    ) -> Result<Arc<dyn S3Backend>, S3Error> {
        Ok(Arc::new(AwsS3Backend::new(endpoint, credentials, self.timeout)))
    }

    fn sts(
        &self,
        endpoint: &BackendEndpoint,
        credentials: &StaticCredentials,
    ) -> Result<Arc<dyn StsBackend>, S3Error> {
        Ok(Arc::new(AwsStsBackend::new(endpoint, credentials, self.timeout)))
    }
}
