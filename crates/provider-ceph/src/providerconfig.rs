//! ProviderConfig CRD describing one S3-compatible backend

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::bucket::Condition;

/// ProviderConfig spec - connection details for a single backend
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ceph.crossplane.io",
    version = "v1alpha1",
    kind = "ProviderConfig",
    plural = "providerconfigs",
    shortname = "pc",
    namespaced = false,
    status = "ProviderConfigStatus",
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".spec.hostBase"}"#,
    printcolumn = r#"{"name":"Health", "type":"string", "jsonPath":".status.health"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    /// S3 endpoint, with or without scheme
    pub host_base: String,
    /// STS endpoint (defaults to hostBase)
    pub sts_address: Option<String>,
    /// Signing region
    #[serde(default = "default_region")]
    pub region: String,
    /// Use https when hostBase carries no scheme
    #[serde(default)]
    pub use_https: bool,
    /// Where the access keys come from
    #[serde(default)]
    pub credentials: ProviderCredentials,
    /// Skip the periodic health probe
    #[serde(default)]
    pub disable_health_check: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    #[serde(default)]
    pub source: CredentialsSource,
    pub secret_ref: Option<SecretReference>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CredentialsSource {
    #[default]
    Secret,
    None,
}

/// Reference to a Secret holding `access_key` and `secret_key`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

/// Health of a backend as last observed by the probe
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
    Disabled,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Unhealthy => "Unhealthy",
            HealthStatus::Unknown => "Unknown",
            HealthStatus::Disabled => "Disabled",
        };
        f.write_str(s)
    }
}

/// ProviderConfig status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigStatus {
    #[serde(default)]
    pub health: HealthStatus,
    /// Failure reason from the last probe, empty when healthy
    #[serde(default)]
    pub reason: String,
    pub last_check_time: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ProviderConfig {
    pub fn health(&self) -> HealthStatus {
        self.status.as_ref().map(|s| s.health).unwrap_or_default()
    }
}
