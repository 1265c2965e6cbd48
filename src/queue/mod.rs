//! At-least-once work queue with delayed delivery and deterministic external
//! ids.
//!
//! Messages carry `{ job_id, kind }`. The external id `<kind>-<job id>`
//! (colons stripped) is unique while a message is live, so re-enqueueing an
//! already-queued `(job, kind)` pair is a no-op and re-enqueueing after
//! completion creates a fresh message. Rows are deleted on completion and on
//! final failure.

pub mod memory;
pub mod postgres;
pub mod worker;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{MessageKind, QueueMessage};

pub use memory::MemoryBroker;
pub use postgres::PgBroker;
pub use worker::{WorkerConfig, WorkerSupervisor};

/// Delivery policy: a message is retried this many times with exponential
/// backoff before it is dropped.
pub const MAX_DELIVERY_ATTEMPTS: i32 = 3;
pub const DELIVERY_BACKOFF_BASE: Duration = Duration::from_secs(2);

pub fn external_id(job_id: Uuid, kind: MessageKind) -> String {
    let safe: String = job_id
        .to_string()
        .chars()
        .filter(|c| *c != ':')
        .collect();
    format!("{}-{}", kind.as_str(), safe)
}

pub(crate) fn delivery_backoff(failed_attempts: i32) -> Duration {
    let exponent = failed_attempts.max(1) as u32 - 1;
    DELIVERY_BACKOFF_BASE.saturating_mul(2_u32.saturating_pow(exponent))
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue for immediate delivery. Idempotent while an identical message
    /// is still live.
    async fn enqueue(&self, job_id: Uuid, kind: MessageKind) -> Result<()>;
    /// Enqueue for delivery no earlier than `delay` from now.
    async fn enqueue_in(&self, job_id: Uuid, kind: MessageKind, delay: Duration) -> Result<()>;
    /// Best-effort removal by deterministic id; silent when the message is
    /// already gone or active.
    async fn remove(&self, job_id: Uuid, kind: MessageKind) -> Result<()>;

    /// Reserve up to `limit` due messages for `worker_id`. Reservations expire
    /// after `visibility` so a crashed consumer's messages get redelivered.
    async fn next_batch(
        &self,
        limit: i64,
        worker_id: Uuid,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>>;
    /// Push a reserved message back with a new due time WITHOUT consuming a
    /// delivery attempt (tenant-lock busy bounce).
    async fn delay_message(&self, message_id: Uuid, delay: Duration) -> Result<()>;
    /// Successful handling; the message row is removed.
    async fn complete(&self, message_id: Uuid) -> Result<()>;
    /// Failed handling; consumes an attempt and either schedules redelivery
    /// with exponential backoff or drops the message.
    async fn fail(&self, message_id: Uuid, error: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_is_deterministic_and_colon_free() {
        let job_id = Uuid::new_v4();
        let a = external_id(job_id, MessageKind::Generate);
        let b = external_id(job_id, MessageKind::Generate);
        assert_eq!(a, b);
        assert!(a.starts_with("generate-"));
        assert!(!a.contains(':'));
        assert_ne!(a, external_id(job_id, MessageKind::Publish));
    }

    #[test]
    fn delivery_backoff_doubles() {
        assert_eq!(delivery_backoff(1), Duration::from_secs(2));
        assert_eq!(delivery_backoff(2), Duration::from_secs(4));
        assert_eq!(delivery_backoff(3), Duration::from_secs(8));
    }
}
