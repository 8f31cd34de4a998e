//! Bucket CRD: desired bucket configuration replicated across backends

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::{annotations, finalizers, labels};

/// Bucket spec - one logical bucket, converged on every targeted backend
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ceph.crossplane.io",
    version = "v1alpha1",
    kind = "Bucket",
    plural = "buckets",
    shortname = "bkt",
    namespaced = false,
    status = "BucketStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    /// Backends (ProviderConfig names) to place the bucket on
    pub providers: Option<Vec<String>>,
    /// Pause this bucket when one of its backends becomes unavailable
    #[serde(default)]
    pub auto_pause: bool,
    /// Ignore lifecycleConfiguration and remove any lifecycle on the backends
    #[serde(default)]
    pub lifecycle_configuration_disabled: bool,
    #[serde(default)]
    pub for_provider: BucketParameters,
}

/// External bucket configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketParameters {
    /// Canned ACL (private, public-read, ...)
    pub acl: Option<String>,
    pub grant_full_control: Option<String>,
    pub grant_read: Option<String>,
    pub grant_read_acp: Option<String>,
    pub grant_write: Option<String>,
    pub grant_write_acp: Option<String>,
    /// BucketOwnerPreferred, ObjectWriter or BucketOwnerEnforced
    pub object_ownership: Option<String>,
    pub object_lock_enabled_for_bucket: Option<bool>,
    pub location_constraint: Option<String>,
    pub versioning_configuration: Option<VersioningConfiguration>,
    pub lifecycle_configuration: Option<BucketLifecycleConfiguration>,
    pub object_lock_configuration: Option<ObjectLockConfiguration>,
    /// Bucket policy as a JSON document
    pub policy: Option<String>,
}

impl BucketParameters {
    pub fn has_acl(&self) -> bool {
        self.acl.is_some()
            || self.grant_full_control.is_some()
            || self.grant_read.is_some()
            || self.grant_read_acp.is_some()
            || self.grant_write.is_some()
            || self.grant_write_acp.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersioningConfiguration {
    pub status: Option<VersioningStatus>,
    pub mfa_delete: Option<MfaDelete>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VersioningStatus {
    Enabled,
    Suspended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MfaDelete {
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketLifecycleConfiguration {
    #[serde(default)]
    pub rules: Vec<LifecycleRule>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRule {
    pub id: Option<String>,
    pub status: RuleStatus,
    pub filter: Option<LifecycleRuleFilter>,
    pub expiration: Option<LifecycleExpiration>,
    pub noncurrent_version_expiration: Option<NoncurrentVersionExpiration>,
    pub abort_incomplete_multipart_upload: Option<AbortIncompleteMultipartUpload>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RuleStatus {
    Enabled,
    Disabled,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRuleFilter {
    pub prefix: Option<String>,
    pub tag: Option<Tag>,
    pub and: Option<LifecycleRuleAndOperator>,
    pub object_size_greater_than: Option<i64>,
    pub object_size_less_than: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRuleAndOperator {
    pub prefix: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub object_size_greater_than: Option<i64>,
    pub object_size_less_than: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleExpiration {
    pub days: Option<i32>,
    pub expired_object_delete_marker: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NoncurrentVersionExpiration {
    pub noncurrent_days: Option<i32>,
    pub newer_noncurrent_versions: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AbortIncompleteMultipartUpload {
    pub days_after_initiation: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub days: Option<i32>,
    pub storage_class: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectLockConfiguration {
    /// "Enabled" is the only value S3 accepts
    pub object_lock_enabled: Option<String>,
    pub rule: Option<ObjectLockRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectLockRule {
    pub default_retention: Option<DefaultRetention>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DefaultRetention {
    pub mode: Option<RetentionMode>,
    pub days: Option<i32>,
    pub years: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RetentionMode {
    Governance,
    Compliance,
}

/// Sort the tags of every "And" filter by key.
///
/// Backends return tag sets in arbitrary order; sorting makes the desired
/// and observed configurations comparable. Normalizing twice is a no-op.
pub fn normalize_lifecycle(config: &mut BucketLifecycleConfiguration) {
    for rule in &mut config.rules {
        if let Some(and) = rule.filter.as_mut().and_then(|f| f.and.as_mut()) {
            and.tags.sort_by(|a, b| a.key.cmp(&b.key));
        }
    }
}

/// Bucket status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Observed state per backend
    #[serde(default)]
    pub backends: BTreeMap<String, BackendStatus>,
}

impl BucketStatus {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == "Ready")
    }
}

/// Observed state of the bucket on one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub bucket_condition: Condition,
    pub lifecycle_configuration_condition: Option<Condition>,
    pub versioning_condition: Option<Condition>,
    pub object_lock_configuration_condition: Option<Condition>,
}

/// Kubernetes-style condition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Condition {
    pub fn ready(ready: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    pub fn available() -> Self {
        Self::ready(true, "Available", "")
    }

    pub fn unavailable(reason: &str, message: &str) -> Self {
        Self::ready(false, reason, message)
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    /// Keep the previous transition time when nothing but the timestamp changed.
    pub fn since(self, previous: Option<&Condition>) -> Self {
        match previous {
            Some(prev)
                if prev.type_ == self.type_
                    && prev.status == self.status
                    && prev.reason == self.reason
                    && prev.message == self.message =>
            {
                prev.clone()
            }
            _ => self,
        }
    }
}

impl Bucket {
    /// Backends named in `spec.providers`; empty when the list is absent
    pub fn requested_providers(&self) -> &[String] {
        self.spec.providers.as_deref().unwrap_or_default()
    }

    pub fn is_paused(&self) -> bool {
        self.annotations()
            .get(annotations::PAUSED)
            .is_some_and(|v| v == "true")
    }

    pub fn is_ignored(&self) -> bool {
        self.labels().get(labels::IGNORE).is_some_and(|v| v == "true")
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == finalizers::BUCKET)
    }

    /// Backends the bucket is recorded on, from status and labels
    pub fn known_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .status
            .as_ref()
            .map(|s| s.backends.keys().cloned().collect())
            .unwrap_or_default();
        for (key, value) in self.labels() {
            if let Some(name) = key.strip_prefix(labels::BACKEND_PREFIX) {
                if value == "true" && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names
    }

    /// Set or clear the pause annotation and its mirror label.
    ///
    /// Returns true when anything changed.
    pub fn set_paused(&mut self, paused: bool) -> bool {
        fn toggle(map: &mut BTreeMap<String, String>, key: &str, on: bool) -> bool {
            if on {
                map.insert(key.to_string(), "true".to_string()).as_deref() != Some("true")
            } else {
                map.remove(key).is_some()
            }
        }

        let annotation_changed = toggle(self.annotations_mut(), annotations::PAUSED, paused);
        let label_changed = toggle(self.labels_mut(), labels::PAUSED, paused);
        annotation_changed || label_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(key: &str, value: &str) -> Tag {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn and_rule(tags: Vec<Tag>) -> LifecycleRule {
        LifecycleRule {
            id: Some("expire-tmp".to_string()),
            status: RuleStatus::Enabled,
            filter: Some(LifecycleRuleFilter {
                and: Some(LifecycleRuleAndOperator {
                    prefix: Some("tmp/".to_string()),
                    tags,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            expiration: Some(LifecycleExpiration {
                days: Some(7),
                expired_object_delete_marker: None,
            }),
            noncurrent_version_expiration: None,
            abort_incomplete_multipart_upload: None,
            transitions: vec![],
        }
    }

    #[test]
    fn test_deserialize_bucket() {
        let yaml = r#"
providers:
  - ceph-a
  - ceph-b
autoPause: true
forProvider:
  acl: private
  objectOwnership: BucketOwnerEnforced
  versioningConfiguration:
    status: Enabled
  lifecycleConfiguration:
    rules:
      - id: expire-logs
        status: Enabled
        filter:
          prefix: logs/
        expiration:
          days: 30
  objectLockConfiguration:
    objectLockEnabled: Enabled
    rule:
      defaultRetention:
        mode: GOVERNANCE
        days: 1
"#;
        let spec: BucketSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            spec.providers,
            Some(vec!["ceph-a".to_string(), "ceph-b".to_string()])
        );
        assert!(spec.auto_pause);
        let params = spec.for_provider;
        assert!(params.has_acl());
        assert_eq!(
            params.versioning_configuration.unwrap().status,
            Some(VersioningStatus::Enabled)
        );
        let lifecycle = params.lifecycle_configuration.unwrap();
        assert_eq!(lifecycle.rules.len(), 1);
        assert_eq!(lifecycle.rules[0].expiration.as_ref().unwrap().days, Some(30));
        let retention = params
            .object_lock_configuration
            .unwrap()
            .rule
            .unwrap()
            .default_retention
            .unwrap();
        assert_eq!(retention.mode, Some(RetentionMode::Governance));
    }

    #[test]
    fn test_minimal_bucket() {
        let spec: BucketSpec = serde_yaml::from_str("{}").unwrap();
        assert!(spec.providers.is_none());
        assert!(!spec.auto_pause);
        assert!(!spec.for_provider.has_acl());
    }

    #[test]
    fn test_normalize_lifecycle_sorts_and_tags() {
        let mut config = BucketLifecycleConfiguration {
            rules: vec![and_rule(vec![tag("key2", "v2"), tag("key1", "v1")])],
        };
        normalize_lifecycle(&mut config);
        let tags = &config.rules[0].filter.as_ref().unwrap().and.as_ref().unwrap().tags;
        assert_eq!(tags, &vec![tag("key1", "v1"), tag("key2", "v2")]);

        let once = config.clone();
        normalize_lifecycle(&mut config);
        assert_eq!(config, once);
    }

    #[test]
    fn test_condition_since_keeps_transition_time() {
        let mut prev = Condition::available();
        prev.last_transition_time = "2024-01-01T00:00:00+00:00".to_string();

        let same = Condition::available().since(Some(&prev));
        assert_eq!(same.last_transition_time, prev.last_transition_time);

        let changed = Condition::unavailable("ReconcileError", "boom").since(Some(&prev));
        assert_ne!(changed.last_transition_time, prev.last_transition_time);
        assert!(!changed.is_true());
    }

    #[test]
    fn test_pause_round_trip() {
        let mut bucket = Bucket::new("photos", BucketSpec::default());
        assert!(!bucket.is_paused());

        assert!(bucket.set_paused(true));
        assert!(bucket.is_paused());
        assert_eq!(
            bucket.labels().get(labels::PAUSED).map(String::as_str),
            Some("true")
        );
        assert!(!bucket.set_paused(true));

        assert!(bucket.set_paused(false));
        assert!(!bucket.is_paused());
        assert!(!bucket.labels().contains_key(labels::PAUSED));
    }

    #[test]
    fn test_known_backends_merges_labels_and_status() {
        let mut bucket = Bucket::new("photos", BucketSpec::default());
        bucket
            .labels_mut()
            .insert(labels::backend("ceph-b"), "true".to_string());
        let mut status = BucketStatus::default();
        status.backends.insert(
            "ceph-a".to_string(),
            BackendStatus {
                bucket_condition: Condition::available(),
                lifecycle_configuration_condition: None,
                versioning_condition: None,
                object_lock_configuration_condition: None,
            },
        );
        bucket.status = Some(status);
        assert_eq!(bucket.known_backends(), vec!["ceph-a", "ceph-b"]);
    }
}
