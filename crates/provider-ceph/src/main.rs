use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::Client;
use tokio::select;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use provider_ceph::backend::BackendRegistry;
use provider_ceph::cache::ExistenceCache;
use provider_ceph::controllers::providerconfig::collect_garbage;
use provider_ceph::controllers::ratelimit::ReconcileRateLimiter;
use provider_ceph::controllers::retry::{ConflictBackoff, RetryTracker};
use provider_ceph::controllers::{self, ControllerContext};
use provider_ceph::convergence::Converger;
use provider_ceph::credentials::CredentialResolver;
use provider_ceph::health::{run_health_server, HealthState};
use provider_ceph::healthcheck::InitialCheckTracker;
use provider_ceph::leader::{LeaderElection, LeaderElectionConfig};
use provider_ceph::s3::aws::AwsClientBuilder;
use provider_ceph::store::{KubeSecrets, KubeStore};
use provider_ceph::unpause::{UnpauseHandle, Unpauser};
use provider_ceph::{Bucket, OperatorConfig, ProviderConfig};

const GC_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = OperatorConfig::parse();
    info!(
        health_check_interval = config.health_check_interval,
        auto_pause = config.auto_pause,
        assume_role = config.assume_role_arn.is_some(),
        empty_providers = ?config.empty_providers,
        "provider-ceph starting"
    );
    if config.enable_external_secret_stores {
        warn!("External secret stores requested; credentials are still read from Secrets");
    }

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let leader_config = LeaderElectionConfig::from_args(&config.leader)
        .context("Invalid leader election configuration")?;

    let ctx = build_context(kube_client.clone(), config);

    let health = Arc::new(HealthState::new(ctx.registry.clone()));
    let health_port = ctx.config.health_port;
    let health_server = tokio::spawn(run_health_server(health, health_port));

    if let Some(leader_config) = leader_config {
        let election = LeaderElection::new(kube_client.clone(), &leader_config);
        election.acquire().await?;
        election.spawn_renewal_task();
    }

    info!("Starting controllers");
    let pc_controller = tokio::spawn(controllers::providerconfig::run(
        kube_client.clone(),
        ctx.clone(),
    ));
    let bucket_controller = tokio::spawn(controllers::bucket::run(kube_client, ctx.clone()));

    // Controllers stop on SIGTERM/SIGINT via shutdown_on_signal
    select! {
        result = pc_controller => handle_controller_exit("ProviderConfig", result),
        result = bucket_controller => handle_controller_exit("Bucket", result),
        _ = run_garbage_collection(ctx.clone()) => {
            bail!("Garbage collection loop exited unexpectedly");
        }
        result = health_server => {
            match result {
                Ok(Ok(())) => bail!("Health server exited unexpectedly"),
                Ok(Err(e)) => Err(e).context("Health server failed"),
                Err(e) => bail!("Health server task failed: {}", e),
            }
        }
    }
}

fn build_context(kube_client: Client, config: OperatorConfig) -> Arc<ControllerContext> {
    let config = Arc::new(config);
    let registry = Arc::new(BackendRegistry::new());
    let client_builder = Arc::new(AwsClientBuilder::new(config.s3_timeout()));
    let buckets: Arc<KubeStore<Bucket>> = Arc::new(KubeStore::new(kube_client.clone()));
    let existence_cache = Arc::new(ExistenceCache::new(config.existence_cache_ttl()));
    let conflict_backoff = ConflictBackoff::default();

    let (unpause, rx) = UnpauseHandle::channel();
    let unpauser = Arc::new(Unpauser::new(
        buckets.clone(),
        conflict_backoff.clone(),
        config.auto_pause,
    ));
    unpause.spawn_worker(rx, unpauser);

    Arc::new(ControllerContext {
        registry: registry.clone(),
        buckets,
        provider_configs: Arc::new(KubeStore::<ProviderConfig>::new(kube_client.clone())),
        secrets: Arc::new(KubeSecrets::new(kube_client)),
        client_builder: client_builder.clone(),
        credentials: Arc::new(CredentialResolver::new(
            registry,
            client_builder,
            config.assume_role_arn.clone(),
        )),
        converger: Arc::new(Converger::new(existence_cache)),
        unpause,
        initial_checks: Arc::new(InitialCheckTracker::new()),
        retry_tracker: Arc::new(RetryTracker::new()),
        rate_limiter: Arc::new(ReconcileRateLimiter::new(config.reconcile_rate_limit)),
        conflict_backoff,
        config,
    })
}

/// A controller stream only ends on shutdown; anything else restarts the pod
fn handle_controller_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            info!(controller = name, "Controller stopped, shutting down");
            Ok(())
        }
        Err(e) if e.is_panic() => {
            error!(controller = name, "Controller panicked");
            bail!("{} controller panicked: {:?}", name, e.into_panic())
        }
        Err(e) => {
            error!(controller = name, error = ?e, "Controller task failed");
            bail!("{} controller task failed: {}", name, e)
        }
    }
}

async fn run_garbage_collection(ctx: Arc<ControllerContext>) {
    let mut gc_interval = interval(Duration::from_secs(GC_INTERVAL_SECS));
    gc_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(interval_secs = GC_INTERVAL_SECS, "Starting garbage collection loop");

    loop {
        gc_interval.tick().await;
        match collect_garbage(&ctx).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Garbage collection removed orphaned backends"),
            Err(e) => error!(error = %e, "Garbage collection cycle failed"),
        }
    }
}
