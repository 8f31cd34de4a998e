//! Global reconcile rate limit shared by both controllers

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Spaces reconcile starts evenly at `per_second`; zero disables the limit
pub struct ReconcileRateLimiter {
    ticker: Option<Mutex<Interval>>,
}

impl ReconcileRateLimiter {
    pub fn new(per_second: u32) -> Self {
        let ticker = (per_second > 0).then(|| {
            let mut ticker = interval(Duration::from_secs(1) / per_second);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Mutex::new(ticker)
        });
        Self { ticker }
    }

    pub fn unlimited() -> Self {
        Self { ticker: None }
    }

    /// Wait for the next reconcile slot
    pub async fn acquire(&self) {
        if let Some(ticker) = &self.ticker {
            ticker.lock().await.tick().await;
        }
    }
}
