//! Per-tenant mutual exclusion.
//!
//! At most one job per tenant may run at a time across every worker process,
//! so the lock lives in an external KV store rather than in-process. Losing
//! the KV only risks temporary double-work, which item-level state tolerates.

pub mod memory;
pub mod redis;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub use memory::MemoryTenantLock;
pub use redis::RedisTenantLock;

#[async_trait]
pub trait TenantLock: Send + Sync {
    /// Take the tenant mutex for `ttl`. Returns false when another owner
    /// holds it.
    async fn acquire(&self, tenant: &str, owner: Uuid, ttl: Duration) -> Result<bool>;
    /// Extend the TTL, only when `owner` still holds the lock.
    async fn refresh(&self, tenant: &str, owner: Uuid, ttl: Duration) -> Result<bool>;
    /// Drop the lock, only when `owner` still holds it.
    async fn release(&self, tenant: &str, owner: Uuid) -> Result<()>;
}
