//! Backend credentials and S3 client resolution
//!
//! Static mode builds clients once per ProviderConfig reconcile from the
//! referenced Secret and caches them in the registry. AssumeRole mode builds a
//! short-lived client per call from temporary STS credentials.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::backend::BackendRegistry;
use crate::providerconfig::{CredentialsSource, ProviderConfigSpec};
use crate::s3::{
    BackendEndpoint, ClientBuilder, S3Backend, S3Error, SessionTag, StaticCredentials, StsBackend,
    TemporaryCredentials,
};
use crate::store::{SecretReader, StoreError};

/// Secret key holding the access key id
pub const ACCESS_KEY: &str = "access_key";
/// Secret key holding the secret access key
pub const SECRET_KEY: &str = "secret_key";

/// Service prefix of every role session name
pub const ROLE_SESSION_SERVICE: &str = "provider-ceph";

const MAX_SERVICE_NAME_LEN: usize = 29;
const SESSION_SUFFIX_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionNameError {
    #[error("service name required")]
    Empty,
    #[error("service name too long")]
    TooLong,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("backend {0} is not registered")]
    BackendNotRegistered(String),
    #[error("no STS client registered for backend {0}")]
    NoStsClient(String),
    #[error("assume role failed: {0}")]
    AssumeRole(#[source] S3Error),
    #[error("assume role response is missing {field}")]
    MissingCredential { field: &'static str },
    #[error("role session name: {0}")]
    SessionName(#[from] SessionNameError),
    #[error("credentials secret is not referenced")]
    MissingSecretRef,
    #[error("credentials secret has no {0} key")]
    MissingSecretKey(&'static str),
    #[error("failed to read credentials secret: {0}")]
    Secret(#[from] StoreError),
    #[error("failed to build client: {0}")]
    Build(#[source] S3Error),
}

/// Role session name `<service>-<YYYYMMDDThhmmssZ>-<16 alphanumerics>`
pub fn role_session_name(service: &str) -> Result<String, SessionNameError> {
    role_session_name_at(service, Utc::now(), &mut rand::thread_rng())
}

pub fn role_session_name_at<R: Rng>(
    service: &str,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<String, SessionNameError> {
    if service.is_empty() {
        return Err(SessionNameError::Empty);
    }
    if service.len() > MAX_SERVICE_NAME_LEN {
        return Err(SessionNameError::TooLong);
    }
    let suffix: String = rng
        .sample_iter(&Alphanumeric)
        .take(SESSION_SUFFIX_LEN)
        .map(char::from)
        .collect();
    Ok(format!(
        "{service}-{}-{suffix}",
        now.format("%Y%m%dT%H%M%SZ")
    ))
}

/// Read access keys from Secret data
pub fn static_credentials_from_secret(
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<StaticCredentials, CredentialError> {
    let read = |key: &'static str| {
        data.get(key)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(CredentialError::MissingSecretKey(key))
    };
    Ok(StaticCredentials::new(read(ACCESS_KEY)?, read(SECRET_KEY)?))
}

fn temporary_to_static(creds: TemporaryCredentials) -> Result<StaticCredentials, CredentialError> {
    let access_key_id = creds
        .access_key_id
        .ok_or(CredentialError::MissingCredential {
            field: "access key",
        })?;
    let secret_access_key = creds
        .secret_access_key
        .ok_or(CredentialError::MissingCredential {
            field: "secret key",
        })?;
    let session_token = creds
        .session_token
        .ok_or(CredentialError::MissingCredential {
            field: "session token",
        })?;
    Ok(StaticCredentials {
        access_key_id,
        secret_access_key,
        session_token: Some(session_token),
    })
}

/// Clients built for one ProviderConfig
pub struct BackendClients {
    pub s3: Arc<dyn S3Backend>,
    pub sts: Option<Arc<dyn StsBackend>>,
    pub endpoint: BackendEndpoint,
}

/// Build the S3 and STS clients a ProviderConfig describes
#[instrument(skip(builder, secrets, spec), fields(host = %spec.host_base))]
pub async fn build_backend_clients(
    builder: &dyn ClientBuilder,
    secrets: &dyn SecretReader,
    spec: &ProviderConfigSpec,
) -> Result<BackendClients, CredentialError> {
    let credentials = match spec.credentials.source {
        CredentialsSource::Secret => {
            let secret_ref = spec
                .credentials
                .secret_ref
                .as_ref()
                .ok_or(CredentialError::MissingSecretRef)?;
            let data = secrets
                .get_secret_data(&secret_ref.namespace, &secret_ref.name)
                .await?;
            static_credentials_from_secret(&data)?
        }
        CredentialsSource::None => StaticCredentials::new("", ""),
    };

    let endpoint = BackendEndpoint::from(spec);
    let s3 = builder
        .s3(&endpoint, &credentials)
        .map_err(CredentialError::Build)?;
    let sts = builder
        .sts(&endpoint, &credentials)
        .map_err(CredentialError::Build)?;
    Ok(BackendClients {
        s3,
        sts: Some(sts),
        endpoint,
    })
}

/// Resolves the S3 client a Bucket operation runs with
pub struct CredentialResolver {
    registry: Arc<BackendRegistry>,
    builder: Arc<dyn ClientBuilder>,
    assume_role_arn: Option<String>,
}

impl CredentialResolver {
    pub fn new(
        registry: Arc<BackendRegistry>,
        builder: Arc<dyn ClientBuilder>,
        assume_role_arn: Option<String>,
    ) -> Self {
        Self {
            registry,
            builder,
            assume_role_arn,
        }
    }

    #[instrument(skip(self))]
    pub async fn s3_client(
        &self,
        bucket: &str,
        backend: &str,
    ) -> Result<Arc<dyn S3Backend>, CredentialError> {
        let Some(role_arn) = self.assume_role_arn.as_deref() else {
            return self
                .registry
                .get_backend_client(backend)
                .ok_or_else(|| CredentialError::BackendNotRegistered(backend.to_string()));
        };

        let entry = self
            .registry
            .get_backend(backend)
            .ok_or_else(|| CredentialError::BackendNotRegistered(backend.to_string()))?;
        let sts = entry
            .sts
            .ok_or_else(|| CredentialError::NoStsClient(backend.to_string()))?;

        let session_name = role_session_name(ROLE_SESSION_SERVICE)?;
        let tags = vec![
            SessionTag {
                key: "bucket".to_string(),
                value: bucket.to_string(),
            },
            SessionTag {
                key: "backend".to_string(),
                value: backend.to_string(),
            },
        ];
        debug!(session = %session_name, "Assuming role for bucket operation");
        let temporary = sts
            .assume_role(role_arn, &session_name, tags)
            .await
            .map_err(CredentialError::AssumeRole)?;
        let credentials = temporary_to_static(temporary)?;

        self.builder
            .s3(&entry.endpoint, &credentials)
            .map_err(CredentialError::Build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::backend::Backend;
    use crate::providerconfig::{HealthStatus, ProviderCredentials, SecretReference};
    use crate::s3::{MockClientBuilder, MockS3Backend, MockStsBackend};
    use crate::store::MockSecretReader;

    fn endpoint() -> BackendEndpoint {
        BackendEndpoint {
            host_base: "ceph-a:80".to_string(),
            sts_address: None,
            region: "us-east-1".to_string(),
            use_https: false,
        }
    }

    fn register(registry: &BackendRegistry, sts: Option<Arc<dyn StsBackend>>) {
        registry.add_or_update_backend(
            "ceph-a",
            Backend {
                s3: Arc::new(MockS3Backend::new()),
                sts,
                endpoint: endpoint(),
                active: true,
                health: HealthStatus::Healthy,
            },
        );
    }

    #[test]
    fn test_role_session_name_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let name = role_session_name_at("bucketcrud", now, &mut rng).unwrap();

        let prefix = "bucketcrud-20240309T070501Z-";
        assert!(name.starts_with(prefix), "{name}");
        let suffix = &name[prefix.len()..];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_role_session_name_is_unique() {
        let a = role_session_name("bucketcrud").unwrap();
        let b = role_session_name("bucketcrud").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_session_name_validation() {
        let err = role_session_name("").unwrap_err();
        assert_eq!(err.to_string(), "service name required");

        let long = "s".repeat(30);
        let err = role_session_name(&long).unwrap_err();
        assert_eq!(err.to_string(), "service name too long");

        assert!(role_session_name(&"s".repeat(29)).is_ok());
    }

    #[test]
    fn test_static_credentials_from_secret() {
        let mut data = BTreeMap::new();
        data.insert(ACCESS_KEY.to_string(), b"AKID\n".to_vec());
        assert!(matches!(
            static_credentials_from_secret(&data),
            Err(CredentialError::MissingSecretKey(SECRET_KEY))
        ));

        data.insert(SECRET_KEY.to_string(), b"shh".to_vec());
        let creds = static_credentials_from_secret(&data).unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(creds.secret_access_key, "shh");
        assert!(creds.session_token.is_none());
    }

    #[tokio::test]
    async fn test_build_backend_clients_reads_secret() {
        let mut secrets = MockSecretReader::new();
        secrets
            .expect_get_secret_data()
            .withf(|ns, name| ns == "crossplane-system" && name == "ceph-a-keys")
            .times(1)
            .returning(|_, _| {
                let mut data = BTreeMap::new();
                data.insert(ACCESS_KEY.to_string(), b"AKID".to_vec());
                data.insert(SECRET_KEY.to_string(), b"shh".to_vec());
                Ok(data)
            });

        let mut builder = MockClientBuilder::new();
        builder
            .expect_s3()
            .withf(|_, creds| creds.access_key_id == "AKID")
            .times(1)
            .returning(|_, _| Ok(Arc::new(MockS3Backend::new()) as Arc<dyn S3Backend>));
        builder
            .expect_sts()
            .times(1)
            .returning(|_, _| Ok(Arc::new(MockStsBackend::new()) as Arc<dyn StsBackend>));

        let spec = ProviderConfigSpec {
            host_base: "ceph-a:80".to_string(),
            sts_address: None,
            region: "us-east-1".to_string(),
            use_https: false,
            credentials: ProviderCredentials {
                source: CredentialsSource::Secret,
                secret_ref: Some(SecretReference {
                    namespace: "crossplane-system".to_string(),
                    name: "ceph-a-keys".to_string(),
                }),
            },
            disable_health_check: false,
        };
        let clients = build_backend_clients(&builder, &secrets, &spec).await.unwrap();
        assert!(clients.sts.is_some());
        assert_eq!(clients.endpoint.url(), "http://ceph-a:80");
    }

    #[tokio::test]
    async fn test_static_mode_uses_registry() {
        let registry = Arc::new(BackendRegistry::new());
        let resolver =
            CredentialResolver::new(registry.clone(), Arc::new(MockClientBuilder::new()), None);

        let err = resolver.s3_client("photos", "ceph-a").await.err().unwrap();
        assert!(matches!(err, CredentialError::BackendNotRegistered(_)));

        register(&registry, None);
        assert!(resolver.s3_client("photos", "ceph-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_assume_role_without_sts_client() {
        let registry = Arc::new(BackendRegistry::new());
        register(&registry, None);
        let resolver = CredentialResolver::new(
            registry,
            Arc::new(MockClientBuilder::new()),
            Some("arn:aws:iam::1:role/r".to_string()),
        );
        let err = resolver.s3_client("photos", "ceph-a").await.err().unwrap();
        assert!(matches!(err, CredentialError::NoStsClient(_)));
    }

    #[tokio::test]
    async fn test_assume_role_builds_short_lived_client() {
        let mut sts = MockStsBackend::new();
        sts.expect_assume_role()
            .withf(|arn, session, tags| {
                arn == "arn:aws:iam::1:role/r"
                    && session.starts_with("provider-ceph-")
                    && tags.iter().any(|t| t.key == "bucket" && t.value == "photos")
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(TemporaryCredentials {
                    access_key_id: Some("ASIA".to_string()),
                    secret_access_key: Some("tmp".to_string()),
                    session_token: Some("token".to_string()),
                })
            });

        let mut builder = MockClientBuilder::new();
        builder
            .expect_s3()
            .withf(|_, creds| {
                creds.access_key_id == "ASIA" && creds.session_token.as_deref() == Some("token")
            })
            .times(1)
            .returning(|_, _| Ok(Arc::new(MockS3Backend::new()) as Arc<dyn S3Backend>));

        let registry = Arc::new(BackendRegistry::new());
        register(&registry, Some(Arc::new(sts) as Arc<dyn StsBackend>));
        let resolver = CredentialResolver::new(
            registry,
            Arc::new(builder),
            Some("arn:aws:iam::1:role/r".to_string()),
        );
        assert!(resolver.s3_client("photos", "ceph-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_assume_role_failures_are_distinguished() {
        let mut sts = MockStsBackend::new();
        let mut calls = 0;
        sts.expect_assume_role().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(S3Error::from_code("AccessDenied", "not allowed"))
            } else {
                Ok(TemporaryCredentials {
                    access_key_id: Some("ASIA".to_string()),
                    secret_access_key: Some("tmp".to_string()),
                    session_token: None,
                })
            }
        });

        let registry = Arc::new(BackendRegistry::new());
        register(&registry, Some(Arc::new(sts) as Arc<dyn StsBackend>));
        let resolver = CredentialResolver::new(
            registry,
            Arc::new(MockClientBuilder::new()),
            Some("arn:aws:iam::1:role/r".to_string()),
        );

        let err = resolver.s3_client("photos", "ceph-a").await.err().unwrap();
        assert!(matches!(err, CredentialError::AssumeRole(_)));

        let err = resolver.s3_client("photos", "ceph-a").await.err().unwrap();
        assert!(matches!(
            err,
            CredentialError::MissingCredential {
                field: "session token"
            }
        ));
    }
}
