//! Producer-side operations: job creation, cancellation, user retry, publish
//! selection, and tenant clearing. These run in the API process, not in the
//! worker, but they own the same stores and broker.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::{LiveSeo, StoreApiClient, gid};
use crate::entities::{
    DraftView, ItemStatus, Job, JobItem, JobStatus, JobType, MessageKind, PublishStatus, TargetType,
};
use crate::queue::Broker;
use crate::retry::NoopObserver;
use crate::store::{JobStore, NewItem, NewJob};

#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub tenant: String,
    pub job_type: JobType,
    /// BCP-47 primary subtag ("en", "tr", …).
    pub language: String,
    pub meta_title: bool,
    pub meta_description: bool,
    pub generation_hints: Value,
    pub pro_plan: bool,
    /// Product ids for `ProductSeo`/`ImageAlt`, article ids for `BlogSeo`.
    /// Numeric or GID form.
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    /// Item ids to publish; `None` selects every successfully generated item.
    pub item_ids: Option<Vec<i64>>,
    /// Skip items whose draft matches the live value at selection time.
    pub apply_only_changed: bool,
}

pub struct Producer {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    store_api: StoreApiClient,
}

impl Producer {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>, store_api: StoreApiClient) -> Self {
        Self { store, broker, store_api }
    }

    pub async fn create_job(&self, request: CreateJobRequest) -> Result<Job> {
        if request.tenant.trim().is_empty() {
            bail!("tenant must not be empty");
        }
        if request.targets.is_empty() {
            bail!("at least one target is required");
        }
        let language = request.language.trim().to_lowercase();
        if language.is_empty() || language.len() > 3 || !language.chars().all(|c| c.is_ascii_alphabetic()) {
            bail!("language must be a primary BCP-47 subtag");
        }

        let items = self.build_items(&request).await?;
        if items.is_empty() {
            bail!("no work items could be derived from the given targets");
        }

        let job = self
            .store
            .create_job(NewJob {
                tenant: request.tenant,
                job_type: request.job_type,
                language,
                meta_title: request.meta_title,
                meta_description: request.meta_description,
                generation_hints: request.generation_hints,
                usage_reserved: request.pro_plan,
                items,
            })
            .await?;

        self.broker
            .enqueue(job.id, MessageKind::Generate)
            .await
            .context("failed to enqueue generate message")?;
        info!(job_id = %job.id, tenant = %job.tenant, total = job.total, "job created");
        Ok(job)
    }

    async fn build_items(&self, request: &CreateJobRequest) -> Result<Vec<NewItem>> {
        match request.job_type {
            JobType::ProductSeo => Ok(request
                .targets
                .iter()
                .map(|id| NewItem::product(gid::normalize("Product", id), None))
                .collect()),
            JobType::BlogSeo => Ok(request
                .targets
                .iter()
                .map(|id| NewItem::article(gid::normalize("Article", id), None))
                .collect()),
            // Image jobs expand each product into its images up front so the
            // item list (and the usage count) is fixed at creation.
            JobType::ImageAlt => {
                let mut items = Vec::new();
                for product_id in &request.targets {
                    let product_gid = gid::normalize("Product", product_id);
                    let images = self
                        .store_api
                        .fetch_images(&product_gid, &NoopObserver)
                        .await
                        .with_context(|| format!("failed to list images of {product_gid}"))?;
                    for image in images {
                        items.push(NewItem::image(
                            image.media_id.clone(),
                            product_gid.clone(),
                            image.media_id,
                            image.url,
                            Some(image.product_title),
                            image.alt,
                        ));
                    }
                }
                Ok(items)
            }
        }
    }

    /// Cancel a job and best-effort remove its queued messages. Messages that
    /// are already being consumed are caught by the phases' cancellation
    /// checks instead.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let cancelled = self.store.cancel_job(job_id).await?;
        if cancelled {
            for kind in [MessageKind::Generate, MessageKind::Publish] {
                if let Err(err) = self.broker.remove(job_id, kind).await {
                    warn!(job_id = %job_id, kind = kind.as_str(), %err, "failed to remove queued message");
                }
            }
            info!(job_id = %job_id, "job cancelled");
        }
        Ok(cancelled)
    }

    /// Put failed items of the phase back in the queue and re-enqueue the
    /// job. Returns how many items were retried.
    pub async fn retry_failed(&self, job_id: Uuid, phase: MessageKind) -> Result<u64> {
        let retried = self.store.retry_failed_items(job_id, phase).await?;
        if retried > 0 {
            self.broker.enqueue(job_id, phase).await?;
            info!(job_id = %job_id, phase = phase.as_str(), retried, "failed items requeued");
        }
        Ok(retried)
    }

    /// Select items for publishing and enqueue the publish message. Returns
    /// the number of items that will be written.
    pub async fn start_publish(&self, job_id: Uuid, request: PublishRequest) -> Result<u64> {
        let job = self.store.job(job_id).await?.context("job not found")?;
        if job.status == JobStatus::Running {
            bail!("job is currently running");
        }
        if job.phase == crate::entities::JobPhase::Generating && job.status != JobStatus::Failed {
            bail!("job has no generated drafts to publish yet");
        }

        let items = self.store.items(job_id).await?;
        let selected: Vec<i64> = match request.item_ids {
            Some(ids) => ids,
            None => items
                .iter()
                .filter(|i| i.status == ItemStatus::Success)
                .map(|i| i.id)
                .collect(),
        };

        let mut queued = self
            .store
            .select_for_publish(job_id, &selected, request.apply_only_changed)
            .await?;

        if request.apply_only_changed && queued > 0 {
            let skipped = self.prune_unchanged(&job).await?;
            queued = queued.saturating_sub(skipped);
        }

        self.broker.enqueue(job_id, MessageKind::Publish).await?;
        info!(job_id = %job_id, queued, "publish selected and enqueued");
        Ok(queued)
    }

    /// Compare queued drafts against live state and demote the unchanged ones
    /// to `Skipped`. The live read and the later write are not atomic; this
    /// prunes what was visibly unchanged at selection time and accepts the
    /// race.
    async fn prune_unchanged(&self, job: &Job) -> Result<u64> {
        let items = self.store.items(job.id).await?;
        let queued: Vec<&JobItem> = items
            .iter()
            .filter(|i| i.publish_status == PublishStatus::Queued)
            .collect();
        if queued.is_empty() {
            return Ok(0);
        }

        let product_ids: Vec<String> = queued
            .iter()
            .filter(|i| i.target_type == TargetType::Product)
            .map(|i| i.target_id.clone())
            .collect();
        let article_ids: Vec<String> = queued
            .iter()
            .filter(|i| i.target_type == TargetType::Article)
            .map(|i| i.target_id.clone())
            .collect();

        let mut live: HashMap<String, LiveSeo> = self
            .store_api
            .fetch_product_seo_batch(&product_ids, &NoopObserver)
            .await?;
        live.extend(
            self.store_api
                .fetch_article_seo_batch(&article_ids, &NoopObserver)
                .await?,
        );

        let mut skip = Vec::new();
        for item in queued {
            let unchanged = match item.draft() {
                // An image draft matching the live-alt baseline is a no-op.
                DraftView::ImageAlt { draft_alt, live_alt } => {
                    draft_alt.map(str::trim) == live_alt.map(str::trim)
                }
                DraftView::Seo { title, description } => {
                    let Some(current) = live.get(&item.target_id) else {
                        continue;
                    };
                    let title_unchanged = !job.meta_title
                        || title.map(str::trim).filter(|s| !s.is_empty())
                            == current.effective_title();
                    let description_unchanged = !job.meta_description
                        || description.map(str::trim).filter(|s| !s.is_empty())
                            == current.effective_description();
                    title_unchanged && description_unchanged
                }
            };
            if unchanged {
                skip.push(item.id);
            }
        }

        if !skip.is_empty() {
            info!(job_id = %job.id, skipped = skip.len(), "pruned unchanged items");
            self.store.skip_publish_items(&skip).await?;
        }
        Ok(skip.len() as u64)
    }

    /// Bulk removal of every job of a tenant (tenant offboarding).
    pub async fn clear_tenant(&self, tenant: &str) -> Result<u64> {
        let removed = self.store.clear_tenant(tenant).await?;
        info!(%tenant, removed, "tenant jobs cleared");
        Ok(removed)
    }
}
