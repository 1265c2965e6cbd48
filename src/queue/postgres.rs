use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::{MessageKind, QueueMessage};

use super::{Broker, MAX_DELIVERY_ATTEMPTS, delivery_backoff, external_id};

#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, job_id: Uuid, kind: MessageKind, delay: Duration) -> Result<()> {
        let run_at = Utc::now() + chrono::Duration::from_std(delay)?;
        sqlx::query(
            r#"
            INSERT INTO queue_messages (external_id, job_id, kind, run_at, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(external_id(job_id, kind))
        .bind(job_id)
        .bind(kind)
        .bind(run_at)
        .bind(MAX_DELIVERY_ATTEMPTS)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(&self, job_id: Uuid, kind: MessageKind) -> Result<()> {
        self.insert(job_id, kind, Duration::ZERO).await
    }

    async fn enqueue_in(&self, job_id: Uuid, kind: MessageKind, delay: Duration) -> Result<()> {
        self.insert(job_id, kind, delay).await
    }

    async fn remove(&self, job_id: Uuid, kind: MessageKind) -> Result<()> {
        sqlx::query(
            "DELETE FROM queue_messages WHERE external_id = $1 AND status = 'queued'::queue_status",
        )
        .bind(external_id(job_id, kind))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_batch(
        &self,
        limit: i64,
        worker_id: Uuid,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let visibility_till = Utc::now() + chrono::Duration::from_std(visibility)?;
        let messages = sqlx::query_as::<_, QueueMessage>(
            r#"
            UPDATE queue_messages
            SET status = 'running'::queue_status,
                visibility_till = $3,
                reserved_by = $2,
                updated_at = now()
            WHERE id IN (
                SELECT id
                FROM queue_messages
                WHERE (status = 'queued'::queue_status OR
                      (status = 'running'::queue_status AND visibility_till < now()))
                  AND run_at <= now()
                ORDER BY run_at
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .bind(visibility_till)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn delay_message(&self, message_id: Uuid, delay: Duration) -> Result<()> {
        let run_at = Utc::now() + chrono::Duration::from_std(delay)?;
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'queued'::queue_status,
                run_at = $2,
                visibility_till = NULL,
                reserved_by = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, message_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, message_id: Uuid, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i32, i32)> = sqlx::query_as(
            "SELECT attempts, max_attempts FROM queue_messages WHERE id = $1 FOR UPDATE",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((attempts, max_attempts)) = row else {
            return Ok(());
        };

        let failed_attempts = attempts + 1;
        if failed_attempts >= max_attempts {
            sqlx::query("DELETE FROM queue_messages WHERE id = $1")
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
        } else {
            let run_at =
                Utc::now() + chrono::Duration::from_std(delivery_backoff(failed_attempts))?;
            sqlx::query(
                r#"
                UPDATE queue_messages
                SET status = 'queued'::queue_status,
                    attempts = $2,
                    last_error = $3,
                    run_at = $4,
                    visibility_till = NULL,
                    reserved_by = NULL,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(failed_attempts)
            .bind(error)
            .bind(run_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
