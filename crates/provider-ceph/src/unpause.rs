//! Releases buckets paused on a backend once it becomes healthy again
//!
//! Health transitions enqueue the backend name on a bounded channel; a
//! background worker drains it. Submissions for a backend already queued or
//! running are coalesced, so the health reconciler never blocks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::bucket::Bucket;
use crate::config::labels;
use crate::controllers::retry::{
    retry_with_backoff, update_with_retry, ConflictBackoff, UpdateTarget,
};
use crate::store::{ResourceStore, StoreError};

/// Queue depth of pending unpause jobs
pub const QUEUE_CAPACITY: usize = 64;
/// Upper bound on one unpause job
pub const JOB_TIMEOUT: Duration = Duration::from_secs(120);

pub struct Unpauser {
    buckets: Arc<dyn ResourceStore<Bucket>>,
    backoff: ConflictBackoff,
    auto_pause: bool,
}

impl Unpauser {
    pub fn new(
        buckets: Arc<dyn ResourceStore<Bucket>>,
        backoff: ConflictBackoff,
        auto_pause: bool,
    ) -> Self {
        Self {
            buckets,
            backoff,
            auto_pause,
        }
    }

    /// Clear the pause marker on every bucket paused on `backend` whose
    /// auto-pause setting allows it. Returns how many were released.
    #[instrument(skip(self))]
    pub async fn unpause(&self, backend: &str) -> Result<usize, StoreError> {
        let selector = labels::paused_on_backend(backend);
        let store = self.buckets.as_ref();
        let candidates = retry_with_backoff(
            &self.backoff,
            "list paused buckets",
            |e: &StoreError| !e.is_not_found(),
            || store.list(Some(&selector)),
        )
        .await?;

        let mut released = 0;
        for bucket in candidates {
            if !(self.auto_pause || bucket.spec.auto_pause) || !bucket.is_paused() {
                continue;
            }
            let name = bucket.name_any();
            let unpaused = update_with_retry(
                store,
                &self.backoff,
                &name,
                UpdateTarget::Object,
                |b: &mut Bucket| b.set_paused(false),
            )
            .await;
            match unpaused {
                Ok(Some(_)) => {
                    debug!(bucket = %name, "Unpaused bucket");
                    released += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(bucket = %name, error = %e, "Failed to unpause bucket");
                }
            }
        }

        info!(backend, released, "Unpaused dependent buckets");
        Ok(released)
    }
}

/// Cheap handle the health reconciler submits unpause jobs through
#[derive(Clone)]
pub struct UnpauseHandle {
    tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl UnpauseHandle {
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self {
                tx,
                pending: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Queue `backend`; false when it was already pending or the queue is full
    pub fn submit(&self, backend: &str) -> bool {
        let mut pending = self.pending.lock();
        if !pending.insert(backend.to_string()) {
            debug!(backend, "Unpause already pending");
            return false;
        }
        match self.tx.try_send(backend.to_string()) {
            Ok(()) => true,
            Err(e) => {
                pending.remove(backend);
                warn!(backend, error = %e, "Unpause queue rejected job");
                false
            }
        }
    }

    pub fn is_pending(&self, backend: &str) -> bool {
        self.pending.lock().contains(backend)
    }

    /// Drain `rx` until every handle is dropped
    pub fn spawn_worker(
        &self,
        mut rx: mpsc::Receiver<String>,
        unpauser: Arc<Unpauser>,
    ) -> JoinHandle<()> {
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while let Some(backend) = rx.recv().await {
                let job = {
                    let unpauser = unpauser.clone();
                    let backend = backend.clone();
                    tokio::spawn(async move {
                        tokio::time::timeout(JOB_TIMEOUT, unpauser.unpause(&backend)).await
                    })
                };
                match job.await {
                    Ok(Ok(Ok(_))) => {}
                    Ok(Ok(Err(e))) => error!(backend = %backend, error = %e, "Unpause failed"),
                    Ok(Err(_)) => error!(backend = %backend, "Unpause timed out"),
                    Err(e) => error!(backend = %backend, error = %e, "Unpause task panicked"),
                }
                pending.lock().remove(&backend);
            }
            debug!("Unpause worker stopped");
        })
    }
}
