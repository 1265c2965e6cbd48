use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::time::sleep;
use uuid::Uuid;

use crate::classify::truncate_error;
use crate::entities::{Draft, Job, JobItem, MessageKind};

use super::{
    CounterDeltas, JobFilter, JobPage, JobStore, NewJob, PhaseTransition, ReserveOutcome,
    decode_cursor, encode_cursor,
};

const LAST_ERROR_MAX_CHARS: usize = 900;
const USAGE_TXN_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_reserve(
        &self,
        tenant: &str,
        month_key: &str,
        n: i32,
        limit: i32,
    ) -> Result<ReserveOutcome, sqlx::Error> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO usage_monthly (tenant, month_key, used)
            VALUES ($1, $2, 0)
            ON CONFLICT (tenant, month_key) DO NOTHING
            "#,
        )
        .bind(tenant)
        .bind(month_key)
        .execute(&mut *tx)
        .await?;

        let used: i32 =
            sqlx::query_scalar("SELECT used FROM usage_monthly WHERE tenant = $1 AND month_key = $2")
                .bind(tenant)
                .bind(month_key)
                .fetch_one(&mut *tx)
                .await?;

        if used + n > limit {
            tx.rollback().await?;
            return Ok(ReserveOutcome::LimitExceeded {
                used,
                remaining: (limit - used).max(0),
            });
        }

        sqlx::query("UPDATE usage_monthly SET used = used + $3 WHERE tenant = $1 AND month_key = $2")
            .bind(tenant)
            .bind(month_key)
            .bind(n)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ReserveOutcome::Reserved {
            used: used + n,
            remaining: (limit - used - n).max(0),
        })
    }
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("40001"),
        _ => false,
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job_id = Uuid::new_v4();
        let total = new_job.items.len() as i32;

        let job: Job = sqlx::query_as(
            r#"
            INSERT INTO jobs (
                id, tenant, job_type, phase, status, total,
                language, meta_title, meta_description, generation_hints,
                usage_reserved, usage_count
            )
            VALUES ($1, $2, $3, 'generating', 'queued', $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(&new_job.tenant)
        .bind(new_job.job_type)
        .bind(total)
        .bind(&new_job.language)
        .bind(new_job.meta_title)
        .bind(new_job.meta_description)
        .bind(&new_job.generation_hints)
        .bind(new_job.usage_reserved)
        .bind(total)
        .fetch_one(&mut *tx)
        .await?;

        for item in &new_job.items {
            sqlx::query(
                r#"
                INSERT INTO job_items (
                    job_id, target_type, target_id, parent_id, title,
                    media_id, image_url, seo_description
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(job_id)
            .bind(item.target_type)
            .bind(&item.target_id)
            .bind(&item.parent_id)
            .bind(&item.title)
            .bind(&item.media_id)
            .bind(&item.image_url)
            .bind(&item.baseline_alt)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(job)
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn items(&self, job_id: Uuid) -> Result<Vec<JobItem>> {
        let items =
            sqlx::query_as::<_, JobItem>("SELECT * FROM job_items WHERE job_id = $1 ORDER BY id")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(items)
    }

    async fn item_count(&self, job_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM job_items WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn set_total(&self, job_id: Uuid, total: i32) -> Result<()> {
        sqlx::query("UPDATE jobs SET total = $2 WHERE id = $1")
            .bind(job_id)
            .bind(total)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn acquire_lease(&self, job_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = $2, lock_expires_at = $3, last_heartbeat_at = now()
            WHERE id = $1
              AND (lock_owner IS NULL OR lock_expires_at < now() OR lock_owner = $2)
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn touch_lease(&self, job_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_expires_at = $3, last_heartbeat_at = now()
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, job_id: Uuid, owner: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = NULL, lock_expires_at = NULL
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_items(&self, job_id: Uuid, phase: MessageKind, limit: i64) -> Result<Vec<JobItem>> {
        let query = match phase {
            MessageKind::Generate => {
                r#"
                SELECT * FROM job_items
                WHERE job_id = $1 AND status IN ('queued'::item_status, 'failed'::item_status)
                ORDER BY id
                LIMIT $2
                "#
            }
            MessageKind::Publish => {
                r#"
                SELECT * FROM job_items
                WHERE job_id = $1
                  AND publish_status IN ('queued'::publish_status, 'failed'::publish_status)
                ORDER BY id
                LIMIT $2
                "#
            }
        };
        let items = sqlx::query_as::<_, JobItem>(query)
            .bind(job_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn mark_item_running(&self, item_id: i64, phase: MessageKind) -> Result<()> {
        let query = match phase {
            MessageKind::Generate => {
                "UPDATE job_items SET status = 'running', started_at = now(), error = NULL WHERE id = $1"
            }
            MessageKind::Publish => {
                "UPDATE job_items SET publish_status = 'running', publish_error = NULL WHERE id = $1"
            }
        };
        sqlx::query(query).bind(item_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn finish_generate_ok(&self, item_id: i64, draft: &Draft) -> Result<()> {
        match draft {
            Draft::Seo { title, description } => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'success', finished_at = now(), error = NULL,
                        seo_title = $2, seo_description = $3
                    WHERE id = $1
                    "#,
                )
                .bind(item_id)
                .bind(title)
                .bind(description)
                .execute(&self.pool)
                .await?;
            }
            // Alt drafts leave the live-alt baseline column untouched.
            Draft::Alt(alt) => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'success', finished_at = now(), error = NULL, seo_title = $2
                    WHERE id = $1
                    "#,
                )
                .bind(item_id)
                .bind(alt)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn finish_generate_err(&self, item_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE job_items SET status = 'failed', finished_at = now(), error = $2 WHERE id = $1",
        )
        .bind(item_id)
        .bind(truncate_error(error, LAST_ERROR_MAX_CHARS))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_publish_ok(&self, item_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_items
            SET publish_status = 'success', published_at = now(), publish_error = NULL,
                seo_description = CASE
                    WHEN target_type = 'image'::target_type THEN seo_title
                    ELSE seo_description
                END
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_publish_err(&self, item_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE job_items SET publish_status = 'failed', publish_error = $2 WHERE id = $1",
        )
        .bind(item_id)
        .bind(truncate_error(error, LAST_ERROR_MAX_CHARS))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_item_attempt(&self, item_id: i64, phase: MessageKind) -> Result<()> {
        let query = match phase {
            MessageKind::Generate => {
                "UPDATE job_items SET gen_attempts = gen_attempts + 1 WHERE id = $1"
            }
            MessageKind::Publish => {
                "UPDATE job_items SET publish_attempts = publish_attempts + 1 WHERE id = $1"
            }
        };
        sqlx::query(query).bind(item_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn record_item_retry(&self, item_id: i64, phase: MessageKind, wait_ms: i64) -> Result<()> {
        let query = match phase {
            MessageKind::Generate => {
                "UPDATE job_items SET gen_retry_wait_ms = gen_retry_wait_ms + $2 WHERE id = $1"
            }
            MessageKind::Publish => {
                "UPDATE job_items SET publish_retry_wait_ms = publish_retry_wait_ms + $2 WHERE id = $1"
            }
        };
        sqlx::query(query)
            .bind(item_id)
            .bind(wait_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_counters(&self, job_id: Uuid, deltas: CounterDeltas) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET ok_count = ok_count + $2,
                failed_count = failed_count + $3,
                publish_ok_count = publish_ok_count + $4,
                publish_failed_count = publish_failed_count + $5,
                total_attempts = total_attempts + $6,
                total_retry_wait_ms = total_retry_wait_ms + $7
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(deltas.ok)
        .bind(deltas.failed)
        .bind(deltas.publish_ok)
        .bind(deltas.publish_failed)
        .bind(deltas.attempts)
        .bind(deltas.retry_wait_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_phase(&self, job_id: Uuid, transition: PhaseTransition) -> Result<()> {
        let query = match transition {
            PhaseTransition::GenerateStarted => {
                r#"
                UPDATE jobs
                SET phase = 'generating', status = 'running',
                    started_at = COALESCE(started_at, now())
                WHERE id = $1 AND status <> 'cancelled'
                "#
            }
            PhaseTransition::GenerateFinished => {
                r#"
                UPDATE jobs
                SET phase = 'generated', status = 'success', finished_at = now()
                WHERE id = $1 AND status <> 'cancelled'
                "#
            }
            PhaseTransition::PublishStarted => {
                r#"
                UPDATE jobs
                SET phase = 'publishing', status = 'running', publish_started_at = now()
                WHERE id = $1 AND status <> 'cancelled'
                "#
            }
            PhaseTransition::PublishFinished => {
                r#"
                UPDATE jobs
                SET phase = 'published', status = 'success', publish_finished_at = now()
                WHERE id = $1 AND status <> 'cancelled'
                "#
            }
        };
        sqlx::query(query).bind(job_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn set_last_error(&self, job_id: Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET last_error = $2 WHERE id = $1")
            .bind(job_id)
            .bind(truncate_error(message, LAST_ERROR_MAX_CHARS))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        let cancelled: Option<bool> =
            sqlx::query_scalar("SELECT status = 'cancelled'::job_status FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cancelled.unwrap_or(false))
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled'
            WHERE id = $1 AND status IN ('queued'::job_status, 'running'::job_status)
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE job_items
            SET status = 'failed', error = 'Cancelled by user', finished_at = now()
            WHERE job_id = $1 AND status = 'running'::item_status
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            UPDATE job_items
            SET publish_status = 'failed', publish_error = 'Cancelled by user'
            WHERE job_id = $1 AND publish_status = 'running'::publish_status
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn fail_job(&self, job_id: Uuid, reason: &str, phase: MessageKind) -> Result<()> {
        let reason = truncate_error(reason, LAST_ERROR_MAX_CHARS);
        let affected = match phase {
            MessageKind::Generate => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'failed', error = $2, finished_at = now()
                    WHERE job_id = $1
                      AND status IN ('queued'::item_status, 'running'::item_status)
                    "#,
                )
                .bind(job_id)
                .bind(&reason)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            MessageKind::Publish => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET publish_status = 'failed', publish_error = $2
                    WHERE job_id = $1
                      AND publish_status IN ('queued'::publish_status, 'running'::publish_status)
                    "#,
                )
                .bind(job_id)
                .bind(&reason)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };

        let (failed_col, finished_col) = match phase {
            MessageKind::Generate => ("failed_count", "finished_at"),
            MessageKind::Publish => ("publish_failed_count", "publish_finished_at"),
        };
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $2, {failed_col} = {failed_col} + $3,
                {finished_col} = COALESCE({finished_col}, now()),
                lock_owner = NULL, lock_expires_at = NULL
            WHERE id = $1
            "#
        );
        sqlx::query(&query)
            .bind(job_id)
            .bind(&reason)
            .bind(affected as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_stuck(&self, stale_after: Duration, limit: i64) -> Result<Vec<Job>> {
        let stale_before = Utc::now() - chrono::Duration::from_std(stale_after)?;
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'running'::job_status
              AND lock_expires_at IS NOT NULL AND lock_expires_at < now()
              AND (
                  last_heartbeat_at < $1
                  OR (last_heartbeat_at IS NULL
                      AND started_at IS NULL
                      AND publish_started_at IS NULL)
              )
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn recover_stuck(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let Some(job) = self.job(job_id).await? else {
            return Ok(());
        };
        let phase = match job.phase {
            crate::entities::JobPhase::Publishing | crate::entities::JobPhase::Published => {
                MessageKind::Publish
            }
            _ => MessageKind::Generate,
        };
        // Only running items were in flight when the worker died; queued ones
        // stay eligible for a user retry.
        match phase {
            MessageKind::Generate => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'failed', error = $2, finished_at = now()
                    WHERE job_id = $1 AND status = 'running'::item_status
                    "#,
                )
                .bind(job_id)
                .bind(reason)
                .execute(&self.pool)
                .await?;
            }
            MessageKind::Publish => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET publish_status = 'failed', publish_error = $2
                    WHERE job_id = $1 AND publish_status = 'running'::publish_status
                    "#,
                )
                .bind(job_id)
                .bind(reason)
                .execute(&self.pool)
                .await?;
            }
        }

        let finished_col = match phase {
            MessageKind::Generate => "finished_at",
            MessageKind::Publish => "publish_finished_at",
        };
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $2,
                {finished_col} = COALESCE({finished_col}, now()),
                lock_owner = NULL, lock_expires_at = NULL
            WHERE id = $1 AND status = 'running'::job_status
            "#
        );
        sqlx::query(&query)
            .bind(job_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, tenant: &str, filter: JobFilter) -> Result<JobPage> {
        let limit = if filter.limit <= 0 { 50 } else { filter.limit.min(100) };
        let cursor = filter.cursor.as_deref().and_then(decode_cursor);
        let (cursor_at, cursor_id) = match cursor {
            Some((at, id)) => (Some(at), Some(id)),
            None => (None, None),
        };

        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE tenant = $1
              AND ($2::job_status IS NULL OR status = $2)
              AND ($3::job_phase IS NULL OR phase = $3)
              AND ($4::job_type IS NULL OR job_type = $4)
              AND ($5::text IS NULL OR id::text ILIKE '%' || $5 || '%')
              AND ($6::timestamptz IS NULL OR (created_at, id) < ($6, $7))
            ORDER BY created_at DESC, id DESC
            LIMIT $8
            "#,
        )
        .bind(tenant)
        .bind(filter.status)
        .bind(filter.phase)
        .bind(filter.job_type)
        .bind(&filter.id_query)
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let next_cursor = if jobs.len() as i64 == limit {
            jobs.last().map(|j| encode_cursor(j.created_at, j.id))
        } else {
            None
        };
        Ok(JobPage { jobs, next_cursor })
    }

    async fn select_for_publish(
        &self,
        job_id: Uuid,
        selected: &[i64],
        apply_only_changed: bool,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE job_items
            SET publish_status = CASE
                    WHEN id = ANY($2) AND status = 'success'::item_status
                        THEN 'queued'::publish_status
                    ELSE 'skipped'::publish_status
                END,
                publish_error = NULL,
                published_at = NULL
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(selected)
        .execute(&mut *tx)
        .await?;

        let queued: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM job_items WHERE job_id = $1 AND publish_status = 'queued'::publish_status",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET apply_only_changed = $2,
                publish_ok_count = 0, publish_failed_count = 0,
                publish_started_at = NULL, publish_finished_at = NULL,
                status = 'queued', phase = 'generated'
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(apply_only_changed)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(queued as u64)
    }

    async fn skip_publish_items(&self, item_ids: &[i64]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_items
            SET publish_status = 'skipped'
            WHERE id = ANY($1) AND publish_status = 'queued'::publish_status
            "#,
        )
        .bind(item_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_failed_items(&self, job_id: Uuid, phase: MessageKind) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let retried = match phase {
            MessageKind::Generate => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET status = 'queued', error = NULL, started_at = NULL, finished_at = NULL
                    WHERE job_id = $1 AND status = 'failed'::item_status
                    "#,
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
            MessageKind::Publish => {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET publish_status = 'queued', publish_error = NULL, published_at = NULL
                    WHERE job_id = $1 AND publish_status = 'failed'::publish_status
                    "#,
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await?
                .rows_affected()
            }
        };

        if retried > 0 {
            let query = match phase {
                MessageKind::Generate => {
                    r#"
                    UPDATE jobs
                    SET status = 'queued', phase = 'generating',
                        finished_at = NULL, last_error = NULL,
                        ok_count = (SELECT count(*) FROM job_items
                                    WHERE job_id = $1 AND status = 'success'::item_status),
                        failed_count = (SELECT count(*) FROM job_items
                                        WHERE job_id = $1 AND status = 'failed'::item_status)
                    WHERE id = $1
                    "#
                }
                MessageKind::Publish => {
                    r#"
                    UPDATE jobs
                    SET status = 'queued', phase = 'generated',
                        publish_finished_at = NULL, last_error = NULL,
                        publish_ok_count = (SELECT count(*) FROM job_items
                                            WHERE job_id = $1
                                              AND publish_status = 'success'::publish_status),
                        publish_failed_count = (SELECT count(*) FROM job_items
                                                WHERE job_id = $1
                                                  AND publish_status = 'failed'::publish_status)
                    WHERE id = $1
                    "#
                }
            };
            sqlx::query(query).bind(job_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(retried)
    }

    async fn reserve_usage(
        &self,
        tenant: &str,
        month_key: &str,
        n: i32,
        limit: i32,
    ) -> Result<ReserveOutcome> {
        let mut attempt = 1;
        loop {
            match self.try_reserve(tenant, month_key, n, limit).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_serialization_conflict(&err) && attempt < USAGE_TXN_ATTEMPTS => {
                    sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn mark_usage_reserved(&self, job_id: Uuid, n: i32) -> Result<()> {
        sqlx::query("UPDATE jobs SET usage_reserved = TRUE, usage_count = $2 WHERE id = $1")
            .bind(job_id)
            .bind(n)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn usage_used(&self, tenant: &str, month_key: &str) -> Result<i32> {
        let used: Option<i32> =
            sqlx::query_scalar("SELECT used FROM usage_monthly WHERE tenant = $1 AND month_key = $2")
                .bind(tenant)
                .bind(month_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(used.unwrap_or(0))
    }

    async fn clear_tenant(&self, tenant: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE tenant = $1")
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
