//! Publish phase: write approved drafts back to the store, one item at a
//! time.

use anyhow::Result;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::{ClientError, classify};
use crate::clients::FieldToggles;
use crate::entities::{DraftView, Job, JobItem, MessageKind, TargetType};
use crate::lock::TenantLock as _;
use crate::retry::RetryObserver;
use crate::store::{CounterDeltas, JobStore as _, PhaseTransition};

use super::{EngineContext, ItemTelemetry};

pub async fn run(ctx: &EngineContext, job: &Job, worker_id: Uuid) -> Result<()> {
    let store = ctx.store.as_ref();
    store.set_phase(job.id, PhaseTransition::PublishStarted).await?;

    let items = store.next_items(job.id, MessageKind::Publish, i64::MAX).await?;
    if items.is_empty() {
        // Nothing selected (or everything pruned as unchanged): complete
        // immediately so the job never hangs in `Publishing`.
        store.set_phase(job.id, PhaseTransition::PublishFinished).await?;
        info!(job_id = %job.id, "publish phase had no eligible items");
        return Ok(());
    }
    info!(job_id = %job.id, count = items.len(), "publish phase started");

    for item in &items {
        if store.is_cancelled(job.id).await? {
            info!(job_id = %job.id, "job cancelled, stopping publish phase");
            return Ok(());
        }

        let _ = store.touch_lease(job.id, worker_id, ctx.settings.lease_ttl).await;
        let _ = ctx
            .lock
            .refresh(&job.tenant, worker_id, ctx.settings.tenant_lock_ttl)
            .await;

        store.mark_item_running(item.id, MessageKind::Publish).await?;
        let telemetry =
            ItemTelemetry::new(ctx, job, item.id, MessageKind::Publish, "store api", worker_id);

        match publish_one(ctx, job, item, &telemetry).await {
            Ok(()) => {
                store.finish_publish_ok(item.id).await?;
                store.increment_counters(job.id, CounterDeltas::publish_ok(1)).await?;
            }
            Err(err) => {
                let message = classify(&err).user_message;
                warn!(item_id = item.id, %message, "item publish failed");
                store.finish_publish_err(item.id, &message).await?;
                store
                    .increment_counters(job.id, CounterDeltas::publish_failed(1))
                    .await?;
                store.set_last_error(job.id, &message).await?;
            }
        }

        sleep(ctx.settings.publish_item_pause).await;
    }

    if !store.is_cancelled(job.id).await? {
        store.set_phase(job.id, PhaseTransition::PublishFinished).await?;
        info!(job_id = %job.id, "publish phase finished");
    }
    Ok(())
}

async fn publish_one(
    ctx: &EngineContext,
    job: &Job,
    item: &JobItem,
    observer: &dyn RetryObserver,
) -> Result<(), ClientError> {
    match item.target_type {
        TargetType::Product | TargetType::Article => {
            let DraftView::Seo { title, description } = item.draft() else {
                return Err(ClientError::Api("item draft is not SEO metadata".to_string()));
            };
            let toggles = FieldToggles {
                meta_title: job.meta_title,
                meta_description: job.meta_description,
            };
            if item.target_type == TargetType::Product {
                ctx.store_api
                    .write_product_seo(&item.target_id, title, description, toggles, observer)
                    .await
            } else {
                ctx.store_api
                    .write_article_seo(&item.target_id, title, description, toggles, observer)
                    .await
            }
        }
        TargetType::Image => {
            let DraftView::ImageAlt { draft_alt, .. } = item.draft() else {
                return Err(ClientError::Api("item draft is not alt text".to_string()));
            };
            let alt = draft_alt
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ClientError::Api("empty alt text draft".to_string()))?;
            let media_id = item
                .media_id
                .as_deref()
                .ok_or_else(|| ClientError::Api("missing media id for image item".to_string()))?;
            let product_id = item
                .parent_id
                .as_deref()
                .ok_or_else(|| ClientError::Api("missing parent product for image item".to_string()))?;
            ctx.store_api
                .write_image_alt(product_id, media_id, alt, observer)
                .await
        }
    }
}
