//! In-memory `JobStore` with the same observable semantics as the Postgres
//! implementation. Used by hermetic tests and local demos; a single mutex
//! stands in for row-level atomicity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::classify::truncate_error;
use crate::entities::{
    Draft, ItemStatus, Job, JobItem, JobPhase, JobStatus, MessageKind, PublishStatus, TargetType,
};

use super::{
    CounterDeltas, JobFilter, JobPage, JobStore, NewJob, PhaseTransition, ReserveOutcome,
    decode_cursor, encode_cursor,
};

const LAST_ERROR_MAX_CHARS: usize = 900;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    items: BTreeMap<i64, JobItem>,
    usage: HashMap<(String, String), i32>,
    next_item_id: i64,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn eligible(item: &JobItem, job_id: Uuid, phase: MessageKind) -> bool {
    if item.job_id != job_id {
        return false;
    }
    match phase {
        MessageKind::Generate => matches!(item.status, ItemStatus::Queued | ItemStatus::Failed),
        MessageKind::Publish => matches!(
            item.publish_status,
            PublishStatus::Queued | PublishStatus::Failed
        ),
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job_id = Uuid::new_v4();
        let total = new_job.items.len() as i32;
        let job = Job {
            id: job_id,
            tenant: new_job.tenant,
            job_type: new_job.job_type,
            phase: JobPhase::Generating,
            status: JobStatus::Queued,
            total,
            ok_count: 0,
            failed_count: 0,
            publish_ok_count: 0,
            publish_failed_count: 0,
            total_attempts: 0,
            total_retry_wait_ms: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            publish_started_at: None,
            publish_finished_at: None,
            last_heartbeat_at: None,
            lock_owner: None,
            lock_expires_at: None,
            language: new_job.language,
            meta_title: new_job.meta_title,
            meta_description: new_job.meta_description,
            generation_hints: new_job.generation_hints,
            apply_only_changed: false,
            usage_reserved: new_job.usage_reserved,
            usage_count: total,
            last_error: None,
        };
        for item in new_job.items {
            inner.next_item_id += 1;
            let id = inner.next_item_id;
            inner.items.insert(
                id,
                JobItem {
                    id,
                    job_id,
                    target_type: item.target_type,
                    target_id: item.target_id,
                    parent_id: item.parent_id,
                    title: item.title,
                    media_id: item.media_id,
                    image_url: item.image_url,
                    status: ItemStatus::Queued,
                    started_at: None,
                    finished_at: None,
                    error: None,
                    gen_attempts: 0,
                    gen_retry_wait_ms: 0,
                    seo_title: None,
                    seo_description: item.baseline_alt,
                    publish_status: PublishStatus::Skipped,
                    published_at: None,
                    publish_error: None,
                    publish_attempts: 0,
                    publish_retry_wait_ms: 0,
                },
            );
        }
        inner.jobs.insert(job_id, job.clone());
        Ok(job)
    }

    async fn job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn items(&self, job_id: Uuid) -> Result<Vec<JobItem>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .items
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn item_count(&self, job_id: Uuid) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.items.values().filter(|i| i.job_id == job_id).count() as i64)
    }

    async fn set_total(&self, job_id: Uuid, total: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.total = total;
        }
        Ok(())
    }

    async fn acquire_lease(&self, job_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        let free = match (job.lock_owner, job.lock_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (_, Some(expires)) => expires < now,
            _ => false,
        };
        if free {
            job.lock_owner = Some(owner);
            job.lock_expires_at = Some(now + chrono::Duration::from_std(ttl)?);
            job.last_heartbeat_at = Some(now);
        }
        Ok(free)
    }

    async fn touch_lease(&self, job_id: Uuid, owner: Uuid, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.lock_owner == Some(owner) {
            job.lock_expires_at = Some(now + chrono::Duration::from_std(ttl)?);
            job.last_heartbeat_at = Some(now);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lease(&self, job_id: Uuid, owner: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id)
            && job.lock_owner == Some(owner)
        {
            job.lock_owner = None;
            job.lock_expires_at = None;
        }
        Ok(())
    }

    async fn next_items(&self, job_id: Uuid, phase: MessageKind, limit: i64) -> Result<Vec<JobItem>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .items
            .values()
            .filter(|i| eligible(i, job_id, phase))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_item_running(&self, item_id: i64, phase: MessageKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            match phase {
                MessageKind::Generate => {
                    item.status = ItemStatus::Running;
                    item.started_at = Some(Utc::now());
                    item.error = None;
                }
                MessageKind::Publish => {
                    item.publish_status = PublishStatus::Running;
                    item.publish_error = None;
                }
            }
        }
        Ok(())
    }

    async fn finish_generate_ok(&self, item_id: i64, draft: &Draft) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            item.status = ItemStatus::Success;
            item.finished_at = Some(Utc::now());
            item.error = None;
            match draft {
                Draft::Seo { title, description } => {
                    item.seo_title = title.clone();
                    item.seo_description = description.clone();
                }
                Draft::Alt(alt) => {
                    item.seo_title = Some(alt.clone());
                }
            }
        }
        Ok(())
    }

    async fn finish_generate_err(&self, item_id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            item.status = ItemStatus::Failed;
            item.finished_at = Some(Utc::now());
            item.error = Some(truncate_error(error, LAST_ERROR_MAX_CHARS));
        }
        Ok(())
    }

    async fn finish_publish_ok(&self, item_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            item.publish_status = PublishStatus::Success;
            item.published_at = Some(Utc::now());
            item.publish_error = None;
            if item.target_type == TargetType::Image {
                item.seo_description = item.seo_title.clone();
            }
        }
        Ok(())
    }

    async fn finish_publish_err(&self, item_id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            item.publish_status = PublishStatus::Failed;
            item.publish_error = Some(truncate_error(error, LAST_ERROR_MAX_CHARS));
        }
        Ok(())
    }

    async fn record_item_attempt(&self, item_id: i64, phase: MessageKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            match phase {
                MessageKind::Generate => item.gen_attempts += 1,
                MessageKind::Publish => item.publish_attempts += 1,
            }
        }
        Ok(())
    }

    async fn record_item_retry(&self, item_id: i64, phase: MessageKind, wait_ms: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(&item_id) {
            match phase {
                MessageKind::Generate => item.gen_retry_wait_ms += wait_ms,
                MessageKind::Publish => item.publish_retry_wait_ms += wait_ms,
            }
        }
        Ok(())
    }

    async fn increment_counters(&self, job_id: Uuid, deltas: CounterDeltas) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.ok_count += deltas.ok;
            job.failed_count += deltas.failed;
            job.publish_ok_count += deltas.publish_ok;
            job.publish_failed_count += deltas.publish_failed;
            job.total_attempts += deltas.attempts;
            job.total_retry_wait_ms += deltas.retry_wait_ms;
        }
        Ok(())
    }

    async fn set_phase(&self, job_id: Uuid, transition: PhaseTransition) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Cancelled {
                return Ok(());
            }
            match transition {
                PhaseTransition::GenerateStarted => {
                    job.phase = JobPhase::Generating;
                    job.status = JobStatus::Running;
                    job.started_at.get_or_insert(now);
                }
                PhaseTransition::GenerateFinished => {
                    job.phase = JobPhase::Generated;
                    job.status = JobStatus::Success;
                    job.finished_at = Some(now);
                }
                PhaseTransition::PublishStarted => {
                    job.phase = JobPhase::Publishing;
                    job.status = JobStatus::Running;
                    job.publish_started_at = Some(now);
                }
                PhaseTransition::PublishFinished => {
                    job.phase = JobPhase::Published;
                    job.status = JobStatus::Success;
                    job.publish_finished_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn set_last_error(&self, job_id: Uuid, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.last_error = Some(truncate_error(message, LAST_ERROR_MAX_CHARS));
        }
        Ok(())
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .get(&job_id)
            .is_some_and(|j| j.status == JobStatus::Cancelled))
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        let now = Utc::now();
        for item in inner.items.values_mut().filter(|i| i.job_id == job_id) {
            if item.status == ItemStatus::Running {
                item.status = ItemStatus::Failed;
                item.error = Some("Cancelled by user".to_string());
                item.finished_at = Some(now);
            }
            if item.publish_status == PublishStatus::Running {
                item.publish_status = PublishStatus::Failed;
                item.publish_error = Some("Cancelled by user".to_string());
            }
        }
        Ok(true)
    }

    async fn fail_job(&self, job_id: Uuid, reason: &str, phase: MessageKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let reason = truncate_error(reason, LAST_ERROR_MAX_CHARS);
        let now = Utc::now();
        let mut affected = 0;
        for item in inner.items.values_mut().filter(|i| i.job_id == job_id) {
            match phase {
                MessageKind::Generate => {
                    if matches!(item.status, ItemStatus::Queued | ItemStatus::Running) {
                        item.status = ItemStatus::Failed;
                        item.error = Some(reason.clone());
                        item.finished_at = Some(now);
                        affected += 1;
                    }
                }
                MessageKind::Publish => {
                    if matches!(
                        item.publish_status,
                        PublishStatus::Queued | PublishStatus::Running
                    ) {
                        item.publish_status = PublishStatus::Failed;
                        item.publish_error = Some(reason.clone());
                        affected += 1;
                    }
                }
            }
        }
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.status = JobStatus::Failed;
            job.last_error = Some(reason);
            match phase {
                MessageKind::Generate => {
                    job.failed_count += affected;
                    job.finished_at.get_or_insert(now);
                }
                MessageKind::Publish => {
                    job.publish_failed_count += affected;
                    job.publish_finished_at.get_or_insert(now);
                }
            }
            job.lock_owner = None;
            job.lock_expires_at = None;
        }
        Ok(())
    }

    async fn find_stuck(&self, stale_after: Duration, limit: i64) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let stale_before = now - chrono::Duration::from_std(stale_after)?;
        let mut stuck: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.lock_expires_at.is_some_and(|e| e < now)
                    && (j.last_heartbeat_at.is_some_and(|h| h < stale_before)
                        || (j.last_heartbeat_at.is_none()
                            && j.started_at.is_none()
                            && j.publish_started_at.is_none()))
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.created_at);
        stuck.truncate(limit.max(0) as usize);
        Ok(stuck)
    }

    async fn recover_stuck(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(phase) = inner.jobs.get(&job_id).map(|j| match j.phase {
            JobPhase::Publishing | JobPhase::Published => MessageKind::Publish,
            _ => MessageKind::Generate,
        }) else {
            return Ok(());
        };
        for item in inner.items.values_mut().filter(|i| i.job_id == job_id) {
            match phase {
                MessageKind::Generate if item.status == ItemStatus::Running => {
                    item.status = ItemStatus::Failed;
                    item.error = Some(reason.to_string());
                    item.finished_at = Some(now);
                }
                MessageKind::Publish if item.publish_status == PublishStatus::Running => {
                    item.publish_status = PublishStatus::Failed;
                    item.publish_error = Some(reason.to_string());
                }
                _ => {}
            }
        }
        if let Some(job) = inner.jobs.get_mut(&job_id)
            && job.status == JobStatus::Running
        {
            job.status = JobStatus::Failed;
            job.last_error = Some(reason.to_string());
            match phase {
                MessageKind::Generate => {
                    job.finished_at.get_or_insert(now);
                }
                MessageKind::Publish => {
                    job.publish_finished_at.get_or_insert(now);
                }
            }
            job.lock_owner = None;
            job.lock_expires_at = None;
        }
        Ok(())
    }

    async fn list_jobs(&self, tenant: &str, filter: JobFilter) -> Result<JobPage> {
        let inner = self.inner.lock().unwrap();
        let limit = if filter.limit <= 0 { 50 } else { filter.limit.min(100) } as usize;
        let cursor = filter.cursor.as_deref().and_then(decode_cursor);

        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.tenant == tenant)
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| filter.phase.is_none_or(|p| j.phase == p))
            .filter(|j| filter.job_type.is_none_or(|t| j.job_type == t))
            .filter(|j| {
                filter
                    .id_query
                    .as_deref()
                    .is_none_or(|q| j.id.to_string().contains(q))
            })
            .filter(|j| {
                cursor.is_none_or(|(at, id)| (j.created_at, j.id) < (at, id))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        jobs.truncate(limit);

        let next_cursor = if jobs.len() == limit {
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
        let mut inner = self.inner.lock().unwrap();
        let mut queued = 0;
        for item in inner.items.values_mut().filter(|i| i.job_id == job_id) {
            item.publish_error = None;
            item.published_at = None;
            if selected.contains(&item.id) && item.status == ItemStatus::Success {
                item.publish_status = PublishStatus::Queued;
                queued += 1;
            } else {
                item.publish_status = PublishStatus::Skipped;
            }
        }
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.apply_only_changed = apply_only_changed;
            job.publish_ok_count = 0;
            job.publish_failed_count = 0;
            job.publish_started_at = None;
            job.publish_finished_at = None;
            job.status = JobStatus::Queued;
            job.phase = JobPhase::Generated;
        }
        Ok(queued)
    }

    async fn skip_publish_items(&self, item_ids: &[i64]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in item_ids {
            if let Some(item) = inner.items.get_mut(id)
                && item.publish_status == PublishStatus::Queued
            {
                item.publish_status = PublishStatus::Skipped;
            }
        }
        Ok(())
    }

    async fn retry_failed_items(&self, job_id: Uuid, phase: MessageKind) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut retried = 0;
        for item in inner.items.values_mut().filter(|i| i.job_id == job_id) {
            match phase {
                MessageKind::Generate if item.status == ItemStatus::Failed => {
                    item.status = ItemStatus::Queued;
                    item.error = None;
                    item.started_at = None;
                    item.finished_at = None;
                    retried += 1;
                }
                MessageKind::Publish if item.publish_status == PublishStatus::Failed => {
                    item.publish_status = PublishStatus::Queued;
                    item.publish_error = None;
                    item.published_at = None;
                    retried += 1;
                }
                _ => {}
            }
        }
        if retried > 0 {
            let (ok, failed, publish_ok, publish_failed) = {
                let items: Vec<&JobItem> =
                    inner.items.values().filter(|i| i.job_id == job_id).collect();
                (
                    items.iter().filter(|i| i.status == ItemStatus::Success).count() as i32,
                    items.iter().filter(|i| i.status == ItemStatus::Failed).count() as i32,
                    items
                        .iter()
                        .filter(|i| i.publish_status == PublishStatus::Success)
                        .count() as i32,
                    items
                        .iter()
                        .filter(|i| i.publish_status == PublishStatus::Failed)
                        .count() as i32,
                )
            };
            if let Some(job) = inner.jobs.get_mut(&job_id) {
                job.status = JobStatus::Queued;
                job.last_error = None;
                match phase {
                    MessageKind::Generate => {
                        job.phase = JobPhase::Generating;
                        job.finished_at = None;
                        job.ok_count = ok;
                        job.failed_count = failed;
                    }
                    MessageKind::Publish => {
                        job.phase = JobPhase::Generated;
                        job.publish_finished_at = None;
                        job.publish_ok_count = publish_ok;
                        job.publish_failed_count = publish_failed;
                    }
                }
            }
        }
        Ok(retried)
    }

    async fn reserve_usage(
        &self,
        tenant: &str,
        month_key: &str,
        n: i32,
        limit: i32,
    ) -> Result<ReserveOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let used = inner
            .usage
            .entry((tenant.to_string(), month_key.to_string()))
            .or_insert(0);
        if *used + n > limit {
            Ok(ReserveOutcome::LimitExceeded {
                used: *used,
                remaining: (limit - *used).max(0),
            })
        } else {
            *used += n;
            Ok(ReserveOutcome::Reserved {
                used: *used,
                remaining: (limit - *used).max(0),
            })
        }
    }

    async fn mark_usage_reserved(&self, job_id: Uuid, n: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.usage_reserved = true;
            job.usage_count = n;
        }
        Ok(())
    }

    async fn usage_used(&self, tenant: &str, month_key: &str) -> Result<i32> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .usage
            .get(&(tenant.to_string(), month_key.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn clear_tenant(&self, tenant: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.tenant == tenant)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            inner.jobs.remove(id);
        }
        inner.items.retain(|_, item| !ids.contains(&item.job_id));
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewItem;

    fn new_job(tenant: &str, n: usize) -> NewJob {
        NewJob {
            tenant: tenant.to_string(),
            job_type: crate::entities::JobType::ProductSeo,
            language: "en".to_string(),
            meta_title: true,
            meta_description: true,
            generation_hints: serde_json::json!({}),
            usage_reserved: false,
            items: (0..n)
                .map(|i| NewItem::product(format!("gid://store/Product/{i}"), None))
                .collect(),
        }
    }

    #[tokio::test]
    async fn lease_is_owner_checked() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("t1", 1)).await.unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease(job.id, a, ttl).await.unwrap());
        assert!(!store.acquire_lease(job.id, b, ttl).await.unwrap());
        // Re-entrant for the same owner.
        assert!(store.acquire_lease(job.id, a, ttl).await.unwrap());
        // Touching from the wrong owner fails.
        assert!(!store.touch_lease(job.id, b, ttl).await.unwrap());
        // Releasing a lease you do not own is a no-op.
        store.release_lease(job.id, b).await.unwrap();
        assert!(store.job(job.id).await.unwrap().unwrap().lock_owner == Some(a));
        store.release_lease(job.id, a).await.unwrap();
        assert!(store.acquire_lease(job.id, b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn next_items_orders_by_id() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job("t1", 3)).await.unwrap();
        let items = store
            .next_items(job.id, MessageKind::Generate, 100)
            .await
            .unwrap();
        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn reserve_usage_is_all_or_nothing() {
        let store = MemoryJobStore::new();
        match store.reserve_usage("t1", "2026-08", 8, 10).await.unwrap() {
            ReserveOutcome::Reserved { used, remaining } => {
                assert_eq!(used, 8);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        match store.reserve_usage("t1", "2026-08", 5, 10).await.unwrap() {
            ReserveOutcome::LimitExceeded { used, remaining } => {
                assert_eq!(used, 8);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.usage_used("t1", "2026-08").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn publish_success_syncs_image_baseline() {
        let store = MemoryJobStore::new();
        let mut request = new_job("t1", 0);
        request.job_type = crate::entities::JobType::ImageAlt;
        request.items.push(NewItem::image(
            "gid://store/MediaImage/9",
            "gid://store/Product/1",
            "gid://store/MediaImage/9",
            None,
            Some("Shirt".to_string()),
            Some("old alt".to_string()),
        ));
        let job = store.create_job(request).await.unwrap();
        let item = &store.items(job.id).await.unwrap()[0];
        store
            .finish_generate_ok(item.id, &Draft::Alt("new alt".to_string()))
            .await
            .unwrap();
        store
            .select_for_publish(job.id, &[item.id], false)
            .await
            .unwrap();
        store.finish_publish_ok(item.id).await.unwrap();

        let item = &store.items(job.id).await.unwrap()[0];
        assert_eq!(item.seo_title.as_deref(), Some("new alt"));
        assert_eq!(item.seo_description.as_deref(), Some("new alt"));
        assert_eq!(item.publish_status, PublishStatus::Success);
        assert!(item.published_at.is_some());
    }
}
