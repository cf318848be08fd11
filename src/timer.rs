//! Expiry sweeper
//!
//! The selection timer's prompt path is a per-request delayed task, but
//! the deadline itself is persisted on the request, so expirations are
//! re-derivable after a restart. This background worker is the safety
//! net: it periodically scans the store for armed timers past their
//! deadline and funnels them into the engine's status-guarded `expire`,
//! which keeps a double firing harmless. It also garbage-collects
//! unpaid pending requests that outlived their abandonment TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::engine::MatchingEngine;

/// Configuration for the expiry sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to scan for overdue timers
    pub scan_interval: Duration,
    /// Maximum expirations to process per scan
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            batch_size: 100,
        }
    }
}

/// Background worker that settles overdue selection timers
pub struct ExpirySweeper {
    engine: Arc<MatchingEngine>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<MatchingEngine>, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    pub fn with_defaults(engine: Arc<MatchingEngine>) -> Self {
        Self::new(engine, SweeperConfig::default())
    }

    /// Run the sweep loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "Starting expiry sweeper"
        );

        loop {
            let swept = self.sweep_once();
            if swept > 0 {
                info!(count = swept, "Expired overdue selection timers");
            }

            let purged = self.engine.store().purge_abandoned(Utc::now());
            if !purged.is_empty() {
                info!(count = purged.len(), "Purged abandoned pending requests");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Single scan-and-expire cycle; returns how many timers this pass
    /// actually fired.
    pub fn sweep_once(&self) -> usize {
        let due = self.engine.store().find_due_timers(Utc::now());
        if due.is_empty() {
            debug!("No overdue timers");
            return 0;
        }

        let mut fired = 0;
        for request_id in due.into_iter().take(self.config.batch_size) {
            match self.engine.expire(request_id) {
                // The scheduled task may have beaten us here; both paths
                // share the same guarded transition
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(%request_id, error = %e, "Sweeper could not expire request");
                }
            }
        }
        fired
    }
}
