//! Liveness and readiness endpoints for the kubelet.
//!
//! `/healthz` answers as long as the process runs. `/readyz` answers once the
//! server is bound and reports how many backends are registered and healthy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::backend::BackendRegistry;

/// Default port for the probe server
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

pub struct HealthState {
    started: AtomicBool,
    registry: Arc<BackendRegistry>,
}

impl HealthState {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            started: AtomicBool::new(false),
            registry,
        }
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Registered and healthy backend counts
    pub fn backend_counts(&self) -> (usize, usize) {
        (self.registry.len(), self.registry.healthy_count())
    }
}

/// Serve the probe endpoints until a fatal I/O error.
///
/// The operator counts as started only once the listener is bound.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    // kubelet probes reach the pod on localhost
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port, "Health check server listening");

    state.mark_started();
    axum::serve(listener, app).await
}

async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Ready once started. Backend health is reported on the ProviderConfigs,
/// so an unhealthy backend does not take the operator out of service.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    let (registered, healthy) = state.backend_counts();
    debug!(registered, healthy, "Readiness probe: OK");
    StatusCode::OK
}
