use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::TenantLock;

/// Single-process tenant lock for tests and demos. Production workers must
/// use the Redis-backed lock; an in-process mutex cannot exclude other
/// processes.
#[derive(Default)]
pub struct MemoryTenantLock {
    held: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl MemoryTenantLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantLock for MemoryTenantLock {
    async fn acquire(&self, tenant: &str, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();
        match held.get(tenant) {
            Some((current, expires)) if *expires > now && *current != owner => Ok(false),
            _ => {
                held.insert(tenant.to_string(), (owner, now + ttl));
                Ok(true)
            }
        }
    }

    async fn refresh(&self, tenant: &str, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();
        match held.get_mut(tenant) {
            Some((current, expires)) if *current == owner && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, tenant: &str, owner: Uuid) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        if held.get(tenant).is_some_and(|(current, _)| *current == owner) {
            held.remove(tenant);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutual_exclusion_and_owner_checked_release() {
        let lock = MemoryTenantLock::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(30);

        assert!(lock.acquire("shop-1", a, ttl).await.unwrap());
        assert!(!lock.acquire("shop-1", b, ttl).await.unwrap());
        // Different tenant is unaffected.
        assert!(lock.acquire("shop-2", b, ttl).await.unwrap());

        // Wrong-owner release keeps the lock.
        lock.release("shop-1", b).await.unwrap();
        assert!(!lock.acquire("shop-1", b, ttl).await.unwrap());

        lock.release("shop-1", a).await.unwrap();
        assert!(lock.acquire("shop-1", b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken() {
        let lock = MemoryTenantLock::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(lock.acquire("shop-1", a, Duration::from_millis(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.acquire("shop-1", b, Duration::from_secs(30)).await.unwrap());
        // The original owner's refresh now fails.
        assert!(!lock.refresh("shop-1", a, Duration::from_secs(30)).await.unwrap());
    }
}
