//! Background recovery of stuck jobs.
//!
//! A job is stuck when it is still `Running` but its lease expired and no
//! heartbeat has arrived within the staleness window. Such jobs are failed
//! with a fixed reason so the user can retry them.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::JobStore;

const RECOVERY_REASON: &str = "Recovered stuck job (no heartbeat ≥ 10m)";
const BATCH_LIMIT: i64 = 25;

pub struct RecoveryLoop {
    store: Arc<dyn JobStore>,
    stale_after: Duration,
    cadence: Duration,
}

impl RecoveryLoop {
    pub fn new(store: Arc<dyn JobStore>, stale_after: Duration) -> Self {
        Self {
            store,
            stale_after,
            cadence: Duration::from_secs(60),
        }
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(cadence_secs = self.cadence.as_secs(), "recovery loop started");
        let mut ticker = interval(self.cadence);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("recovery loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    pub async fn tick(&self) {
        let stuck = match self.store.find_stuck(self.stale_after, BATCH_LIMIT).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(%err, "failed to scan for stuck jobs");
                return;
            }
        };
        for job in stuck {
            warn!(
                job_id = %job.id,
                tenant = %job.tenant,
                phase = ?job.phase,
                "recovering stuck job"
            );
            if let Err(err) = self.store.recover_stuck(job.id, RECOVERY_REASON).await {
                error!(job_id = %job.id, %err, "failed to recover stuck job");
            }
        }
    }
}
