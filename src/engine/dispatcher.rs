//! Message dispatch: tenant lock, job lease, preflight checks, phase routing,
//! and release on every exit path.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::{Job, JobPhase, MessageKind, QueueMessage};
use crate::lock::TenantLock as _;
use crate::store::{JobStore as _, ReserveOutcome};
use crate::usage::month_key;

use super::{EngineContext, generate, publish};

const FREE_LIMIT_MESSAGE: &str = "Free plan limit exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Message handled (including silently-dropped stale messages).
    Done,
    /// Another worker holds the tenant lock; redeliver later without
    /// consuming an attempt.
    TenantBusy,
}

pub struct Dispatcher {
    ctx: Arc<EngineContext>,
    worker_id: Uuid,
}

impl Dispatcher {
    pub fn new(ctx: Arc<EngineContext>, worker_id: Uuid) -> Self {
        Self { ctx, worker_id }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub async fn dispatch(&self, message: &QueueMessage) -> Result<DispatchOutcome> {
        // A message for a deleted job is stale, not an error.
        let Some(job) = self.ctx.store.job(message.job_id).await? else {
            debug!(job_id = %message.job_id, "message for unknown job, dropping");
            return Ok(DispatchOutcome::Done);
        };

        let acquired = self
            .ctx
            .lock
            .acquire(&job.tenant, self.worker_id, self.ctx.settings.tenant_lock_ttl)
            .await?;
        if !acquired {
            info!(job_id = %job.id, tenant = %job.tenant, "tenant lock busy, bouncing message");
            return Ok(DispatchOutcome::TenantBusy);
        }

        let result = self.run_locked(&job, message.kind).await;

        if let Err(err) = self.ctx.lock.release(&job.tenant, self.worker_id).await {
            warn!(tenant = %job.tenant, %err, "failed to release tenant lock");
        }
        result
    }

    async fn run_locked(&self, job: &Job, kind: MessageKind) -> Result<DispatchOutcome> {
        let acquired = self
            .ctx
            .store
            .acquire_lease(job.id, self.worker_id, self.ctx.settings.lease_ttl)
            .await?;
        if !acquired {
            // Another worker owns this job; its lease will finish the work.
            debug!(job_id = %job.id, "job lease held elsewhere, dropping message");
            return Ok(DispatchOutcome::Done);
        }

        let result = self.run_leased(job, kind).await;

        if let Err(err) = self.ctx.store.release_lease(job.id, self.worker_id).await {
            warn!(job_id = %job.id, %err, "failed to release job lease");
        }
        result.map(|_| DispatchOutcome::Done)
    }

    async fn run_leased(&self, job: &Job, kind: MessageKind) -> Result<()> {
        let store = self.ctx.store.as_ref();

        if store.is_cancelled(job.id).await? {
            info!(job_id = %job.id, "job already cancelled");
            return Ok(());
        }

        // Self-heal a drifted total before anything reads it.
        let count = store.item_count(job.id).await? as i32;
        if count != job.total {
            warn!(job_id = %job.id, stored = job.total, actual = count, "healing drifted total");
            store.set_total(job.id, count).await?;
        }

        match kind {
            MessageKind::Generate => {
                if job.phase != JobPhase::Generating {
                    debug!(job_id = %job.id, phase = ?job.phase, "stale generate message");
                    return Ok(());
                }
                if !job.usage_reserved && !self.reserve_usage(job).await? {
                    return Ok(());
                }
                generate::run(&self.ctx, job, self.worker_id).await
            }
            MessageKind::Publish => {
                if job.phase == JobPhase::Generating {
                    debug!(job_id = %job.id, "publish message for ungenerated job, dropping");
                    return Ok(());
                }
                publish::run(&self.ctx, job, self.worker_id).await
            }
        }
    }

    /// Debit the tenant's monthly quota exactly once per job lifetime.
    /// Returns false when the job was failed for exceeding the limit.
    async fn reserve_usage(&self, job: &Job) -> Result<bool> {
        let store = self.ctx.store.as_ref();
        let key = month_key(job.created_at, self.ctx.settings.free_timezone);
        let outcome = store
            .reserve_usage(
                &job.tenant,
                &key,
                job.usage_count,
                self.ctx.settings.free_monthly_limit,
            )
            .await?;
        match outcome {
            ReserveOutcome::Reserved { used, remaining } => {
                debug!(job_id = %job.id, used, remaining, "usage reserved");
                store.mark_usage_reserved(job.id, job.usage_count).await?;
                Ok(true)
            }
            ReserveOutcome::LimitExceeded { used, remaining } => {
                warn!(job_id = %job.id, used, remaining, "free plan limit exceeded");
                store
                    .fail_job(job.id, FREE_LIMIT_MESSAGE, MessageKind::Generate)
                    .await?;
                Ok(false)
            }
        }
    }
}
