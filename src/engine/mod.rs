//! The job orchestration engine: dispatcher, the two phases, recovery, and
//! the producer-side operations.

pub mod dispatcher;
pub mod generate;
pub mod producer;
pub mod publish;
pub mod recovery;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use tracing::warn;
use uuid::Uuid;

use crate::clients::{GeneratorClient, StoreApiClient};
use crate::config::EngineConfig;
use crate::entities::{Job, MessageKind};
use crate::lock::TenantLock;
use crate::queue::Broker;
use crate::retry::RetryObserver;
use crate::store::{CounterDeltas, JobStore};

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use producer::{CreateJobRequest, Producer, PublishRequest};
pub use recovery::RecoveryLoop;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tenant_lock_ttl: Duration,
    pub tenant_lock_retry_delay: Duration,
    pub lease_ttl: Duration,
    pub stuck_after: Duration,
    pub free_monthly_limit: i32,
    pub free_timezone: Tz,
    pub generate_item_pause: Duration,
    pub publish_item_pause: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            tenant_lock_ttl: config.tenant_lock_ttl,
            tenant_lock_retry_delay: config.tenant_lock_retry_delay,
            lease_ttl: config.lease_ttl,
            stuck_after: config.stuck_after,
            free_monthly_limit: config.free_monthly_limit,
            free_timezone: config.free_timezone,
            ..Self::default()
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tenant_lock_ttl: Duration::from_secs(15 * 60),
            tenant_lock_retry_delay: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(5 * 60),
            stuck_after: Duration::from_secs(10 * 60),
            free_monthly_limit: 10,
            free_timezone: chrono_tz::Europe::Istanbul,
            generate_item_pause: Duration::from_millis(450),
            publish_item_pause: Duration::from_millis(350),
        }
    }
}

/// Everything a worker needs to run phases. Cloned cheaply via `Arc`.
pub struct EngineContext {
    pub store: Arc<dyn JobStore>,
    pub lock: Arc<dyn TenantLock>,
    pub broker: Arc<dyn Broker>,
    pub generator: GeneratorClient,
    pub store_api: StoreApiClient,
    pub settings: EngineSettings,
}

/// Mirrors client retry progress into durable state: attempt counters on the
/// item and job, retry narration on the job's `last_error`, and lease/lock
/// refresh while throttle pacing keeps the worker waiting. All writes are
/// best-effort; telemetry must never fail the work item.
pub(crate) struct ItemTelemetry<'a> {
    ctx: &'a EngineContext,
    job: &'a Job,
    item_id: i64,
    phase: MessageKind,
    service: &'static str,
    worker_id: Uuid,
}

impl<'a> ItemTelemetry<'a> {
    pub(crate) fn new(
        ctx: &'a EngineContext,
        job: &'a Job,
        item_id: i64,
        phase: MessageKind,
        service: &'static str,
        worker_id: Uuid,
    ) -> Self {
        Self { ctx, job, item_id, phase, service, worker_id }
    }
}

#[async_trait]
impl RetryObserver for ItemTelemetry<'_> {
    async fn on_attempt(&self, _attempt: u32) {
        let store = self.ctx.store.as_ref();
        if let Err(err) = store.record_item_attempt(self.item_id, self.phase).await {
            warn!(item_id = self.item_id, %err, "failed to record attempt");
        }
        if let Err(err) = store
            .increment_counters(self.job.id, CounterDeltas::attempts(1))
            .await
        {
            warn!(job_id = %self.job.id, %err, "failed to bump attempt counter");
        }
    }

    async fn on_retry(&self, wait: Duration, reason: &str) {
        let store = self.ctx.store.as_ref();
        let wait_ms = wait.as_millis() as i64;
        if let Err(err) = store.record_item_retry(self.item_id, self.phase, wait_ms).await {
            warn!(item_id = self.item_id, %err, "failed to record retry wait");
        }
        if let Err(err) = store
            .increment_counters(self.job.id, CounterDeltas::retry_wait(wait_ms))
            .await
        {
            warn!(job_id = %self.job.id, %err, "failed to bump retry wait counter");
        }
        let narration = format!(
            "Retrying {} in {}s ({reason})",
            self.service,
            wait.as_secs_f64().ceil() as u64
        );
        if let Err(err) = store.set_last_error(self.job.id, &narration).await {
            warn!(job_id = %self.job.id, %err, "failed to record retry narration");
        }
    }

    async fn on_throttle(&self, _wait: Duration) {
        // The pacing sleep counts against the lease; refresh both claims so a
        // long throttle never looks like a dead worker.
        let _ = self
            .ctx
            .store
            .touch_lease(self.job.id, self.worker_id, self.ctx.settings.lease_ttl)
            .await;
        let _ = self
            .ctx
            .lock
            .refresh(&self.job.tenant, self.worker_id, self.ctx.settings.tenant_lock_ttl)
            .await;
    }
}
