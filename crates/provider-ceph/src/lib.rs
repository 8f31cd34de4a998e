//! provider-ceph: Kubernetes operator reconciling Buckets across multiple
//! S3-compatible backends

pub mod backend;
pub mod bucket;
pub mod cache;
pub mod config;
pub mod controllers;
pub mod convergence;
pub mod credentials;
pub mod health;
pub mod healthcheck;
pub mod leader;
pub mod providerconfig;
pub mod s3;
pub mod store;
pub mod unpause;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bucket::Bucket;
pub use config::OperatorConfig;
pub use providerconfig::ProviderConfig;
