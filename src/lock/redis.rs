use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, SetExpiry, SetOptions, Script};
use uuid::Uuid;

use super::TenantLock;

/// Owner-checked TTL extension (compare-and-pexpire).
static REFRESH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("pexpire", KEYS[1], ARGV[2])
        else
            return 0
        end
        "#,
    )
});

/// Owner-checked delete.
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
        "#,
    )
});

#[derive(Clone)]
pub struct RedisTenantLock {
    redis: ConnectionManager,
}

impl RedisTenantLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn connect(kv_url: &str) -> Result<Self> {
        let client = redis::Client::open(kv_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager))
    }

    fn key(tenant: &str) -> String {
        format!("tenant-lock:{}", tenant)
    }
}

#[async_trait]
impl TenantLock for RedisTenantLock {
    async fn acquire(&self, tenant: &str, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        let options = SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl.as_millis() as u64));
        let set: Option<String> = conn
            .set_options(Self::key(tenant), owner.to_string(), options)
            .await?;
        Ok(set.is_some())
    }

    async fn refresh(&self, tenant: &str, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        let extended: i64 = REFRESH_SCRIPT
            .key(Self::key(tenant))
            .arg(owner.to_string())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, tenant: &str, owner: Uuid) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = RELEASE_SCRIPT
            .key(Self::key(tenant))
            .arg(owner.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
