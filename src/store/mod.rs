//! Durable job/item state.
//!
//! The engine never caches job rows: every mutation here is an atomic
//! compare-and-set against the database, so concurrent workers can only
//! interleave at row granularity. `PgJobStore` is the production
//! implementation; `MemoryJobStore` backs hermetic tests and local demos.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{Draft, Job, JobItem, JobPhase, JobStatus, JobType, MessageKind, TargetType};

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant: String,
    pub job_type: JobType,
    pub language: String,
    pub meta_title: bool,
    pub meta_description: bool,
    pub generation_hints: serde_json::Value,
    /// Pro-plan jobs are created with the reservation already settled so the
    /// dispatcher never debits a counter for them.
    pub usage_reserved: bool,
    pub items: Vec<NewItem>,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub target_type: TargetType,
    pub target_id: String,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub media_id: Option<String>,
    pub image_url: Option<String>,
    /// Live alt text at creation time; stored as the image item's baseline.
    pub baseline_alt: Option<String>,
}

impl NewItem {
    pub fn product(target_id: impl Into<String>, title: Option<String>) -> Self {
        Self {
            target_type: TargetType::Product,
            target_id: target_id.into(),
            parent_id: None,
            title,
            media_id: None,
            image_url: None,
            baseline_alt: None,
        }
    }

    pub fn article(target_id: impl Into<String>, title: Option<String>) -> Self {
        Self {
            target_type: TargetType::Article,
            target_id: target_id.into(),
            parent_id: None,
            title,
            media_id: None,
            image_url: None,
            baseline_alt: None,
        }
    }

    pub fn image(
        target_id: impl Into<String>,
        parent_id: impl Into<String>,
        media_id: impl Into<String>,
        image_url: Option<String>,
        product_title: Option<String>,
        baseline_alt: Option<String>,
    ) -> Self {
        Self {
            target_type: TargetType::Image,
            target_id: target_id.into(),
            parent_id: Some(parent_id.into()),
            title: product_title,
            media_id: Some(media_id.into()),
            image_url,
            baseline_alt,
        }
    }
}

/// Atomic counter increments; unset fields stay untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDeltas {
    pub ok: i32,
    pub failed: i32,
    pub publish_ok: i32,
    pub publish_failed: i32,
    pub attempts: i32,
    pub retry_wait_ms: i64,
}

impl CounterDeltas {
    pub fn ok(n: i32) -> Self {
        Self { ok: n, ..Self::default() }
    }
    pub fn failed(n: i32) -> Self {
        Self { failed: n, ..Self::default() }
    }
    pub fn publish_ok(n: i32) -> Self {
        Self { publish_ok: n, ..Self::default() }
    }
    pub fn publish_failed(n: i32) -> Self {
        Self { publish_failed: n, ..Self::default() }
    }
    pub fn attempts(n: i32) -> Self {
        Self { attempts: n, ..Self::default() }
    }
    pub fn retry_wait(ms: i64) -> Self {
        Self { retry_wait_ms: ms, ..Self::default() }
    }
}

/// Job phase transitions with their timestamp bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    /// `phase = Generating`, `status = Running`, stamps `started_at` once.
    GenerateStarted,
    /// `phase = Generated`, `status = Success`, stamps `finished_at`.
    GenerateFinished,
    /// `phase = Publishing`, `status = Running`, stamps `publish_started_at`.
    PublishStarted,
    /// `phase = Published`, `status = Success`, stamps `publish_finished_at`.
    PublishFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { used: i32, remaining: i32 },
    LimitExceeded { used: i32, remaining: i32 },
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub phase: Option<JobPhase>,
    pub job_type: Option<JobType>,
    /// Free-text match against the job id.
    pub id_query: Option<String>,
    pub cursor: Option<String>,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub next_cursor: Option<String>,
}

/// Keyset cursor over `(created_at DESC, id)`.
pub(crate) fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    format!("{}|{}", created_at.to_rfc3339(), id)
}

pub(crate) fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, Uuid)> {
    let (ts, id) = cursor.split_once('|')?;
    let created_at = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    let id = id.parse().ok()?;
    Some((created_at, id))
}

#[async_trait]
pub trait JobStore: Send + Sync {
    // --- creation & lookup ---
    async fn create_job(&self, new_job: NewJob) -> Result<Job>;
    async fn job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn items(&self, job_id: Uuid) -> Result<Vec<JobItem>>;
    async fn item_count(&self, job_id: Uuid) -> Result<i64>;
    async fn set_total(&self, job_id: Uuid, total: i32) -> Result<()>;

    // --- ownership lease ---
    /// CAS acquire: succeeds when unowned, expired, or already ours.
    async fn acquire_lease(&self, job_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool>;
    /// Extends the lease and bumps the heartbeat, owner-matched.
    async fn touch_lease(&self, job_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool>;
    /// Owner-matched release; releasing someone else's lease is a no-op.
    async fn release_lease(&self, job_id: Uuid, owner: Uuid) -> Result<()>;

    // --- item iteration & per-phase markers ---
    /// Items eligible for the phase (generate: `Queued`/`Failed` status,
    /// publish: `Queued`/`Failed` publish status), ascending id.
    async fn next_items(&self, job_id: Uuid, phase: MessageKind, limit: i64) -> Result<Vec<JobItem>>;
    async fn mark_item_running(&self, item_id: i64, phase: MessageKind) -> Result<()>;
    async fn finish_generate_ok(&self, item_id: i64, draft: &Draft) -> Result<()>;
    async fn finish_generate_err(&self, item_id: i64, error: &str) -> Result<()>;
    /// Publish success; image items also copy the published alt into their
    /// live-alt baseline column.
    async fn finish_publish_ok(&self, item_id: i64) -> Result<()>;
    async fn finish_publish_err(&self, item_id: i64, error: &str) -> Result<()>;
    async fn record_item_attempt(&self, item_id: i64, phase: MessageKind) -> Result<()>;
    async fn record_item_retry(&self, item_id: i64, phase: MessageKind, wait_ms: i64) -> Result<()>;

    // --- job state ---
    async fn increment_counters(&self, job_id: Uuid, deltas: CounterDeltas) -> Result<()>;
    async fn set_phase(&self, job_id: Uuid, transition: PhaseTransition) -> Result<()>;
    async fn set_last_error(&self, job_id: Uuid, message: &str) -> Result<()>;
    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool>;
    /// Cancel: terminal unless already terminal; in-flight items fail with
    /// "Cancelled by user". Returns whether the job was actually cancelled.
    async fn cancel_job(&self, job_id: Uuid) -> Result<bool>;
    /// Fail the job and all its pending/running items for the phase in one
    /// step (limit rejections, recovery). Clears the lease.
    async fn fail_job(&self, job_id: Uuid, reason: &str, phase: MessageKind) -> Result<()>;

    // --- recovery ---
    async fn find_stuck(&self, stale_after: Duration, limit: i64) -> Result<Vec<Job>>;
    async fn recover_stuck(&self, job_id: Uuid, reason: &str) -> Result<()>;

    // --- listing ---
    async fn list_jobs(&self, tenant: &str, filter: JobFilter) -> Result<JobPage>;

    // --- publish selection & user retry ---
    /// Selected generated items become `Queued` for publish, everything else
    /// `Skipped`; publish counters and timestamps reset. Returns the queued
    /// count.
    async fn select_for_publish(
        &self,
        job_id: Uuid,
        selected: &[i64],
        apply_only_changed: bool,
    ) -> Result<u64>;
    /// Demote already-queued items to `Skipped` (no-change pruning).
    async fn skip_publish_items(&self, item_ids: &[i64]) -> Result<()>;
    /// User retry: failed items of the phase return to `Queued`, the job
    /// reopens, and the phase counters are recomputed from item state.
    async fn retry_failed_items(&self, job_id: Uuid, phase: MessageKind) -> Result<u64>;

    // --- free-tier usage ---
    /// Serializable reserve-or-reject against `(tenant, month_key)`.
    async fn reserve_usage(
        &self,
        tenant: &str,
        month_key: &str,
        n: i32,
        limit: i32,
    ) -> Result<ReserveOutcome>;
    async fn mark_usage_reserved(&self, job_id: Uuid, n: i32) -> Result<()>;
    async fn usage_used(&self, tenant: &str, month_key: &str) -> Result<i32>;

    // --- tenant removal ---
    async fn clear_tenant(&self, tenant: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let cursor = encode_cursor(now, id);
        let (ts, decoded) = decode_cursor(&cursor).unwrap();
        assert_eq!(decoded, id);
        assert!((ts - now).num_milliseconds().abs() < 1);
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        assert!(decode_cursor("not a cursor").is_none());
        assert!(decode_cursor("2024-01-01T00:00:00Z|not-a-uuid").is_none());
    }
}
