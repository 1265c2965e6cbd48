//! Generate phase: fill drafts for every eligible item, one at a time.

use anyhow::Result;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::classify;
use crate::clients::{GeneratedFields, GenerationHints, TargetPayload};
use crate::entities::{Draft, Job, JobItem, MessageKind, TargetType};
use crate::lock::TenantLock as _;
use crate::retry::{NoopObserver, RetryObserver};
use crate::store::{CounterDeltas, JobStore as _, PhaseTransition};

use super::{EngineContext, ItemTelemetry};

pub async fn run(ctx: &EngineContext, job: &Job, worker_id: Uuid) -> Result<()> {
    let store = ctx.store.as_ref();
    store.set_phase(job.id, PhaseTransition::GenerateStarted).await?;

    // One snapshot of eligible items per run; failed items re-enter only via
    // an explicit user retry that re-enqueues the job.
    let items = store.next_items(job.id, MessageKind::Generate, i64::MAX).await?;
    info!(job_id = %job.id, count = items.len(), "generate phase started");

    for item in &items {
        if store.is_cancelled(job.id).await? {
            info!(job_id = %job.id, "job cancelled, stopping generate phase");
            return Ok(());
        }

        let _ = store.touch_lease(job.id, worker_id, ctx.settings.lease_ttl).await;
        let _ = ctx
            .lock
            .refresh(&job.tenant, worker_id, ctx.settings.tenant_lock_ttl)
            .await;

        store.mark_item_running(item.id, MessageKind::Generate).await?;
        let telemetry =
            ItemTelemetry::new(ctx, job, item.id, MessageKind::Generate, "generator", worker_id);

        match generate_one(ctx, job, item, &telemetry).await {
            Ok(draft) => {
                store.finish_generate_ok(item.id, &draft).await?;
                store.increment_counters(job.id, CounterDeltas::ok(1)).await?;
            }
            Err(err) => {
                let message = classify(&err).user_message;
                warn!(item_id = item.id, %message, "item generation failed");
                store.finish_generate_err(item.id, &message).await?;
                store.increment_counters(job.id, CounterDeltas::failed(1)).await?;
                store.set_last_error(job.id, &message).await?;
            }
        }

        // Cooperative pacing against both services.
        sleep(ctx.settings.generate_item_pause).await;
    }

    if !store.is_cancelled(job.id).await? {
        store.set_phase(job.id, PhaseTransition::GenerateFinished).await?;
        info!(job_id = %job.id, "generate phase finished");
    }
    Ok(())
}

async fn generate_one(
    ctx: &EngineContext,
    job: &Job,
    item: &JobItem,
    observer: &dyn RetryObserver,
) -> Result<Draft, crate::classify::ClientError> {
    let hints = GenerationHints::from_value(&job.generation_hints);
    // The attempt/wait counters track the generator call; the target read
    // retries on its own without inflating them.
    let target = load_target(ctx, item, &NoopObserver).await?;
    let fields = ctx
        .generator
        .generate(job.job_type, &job.language, &hints, &target, observer)
        .await?;

    Ok(match fields {
        GeneratedFields::Seo { seo_title, seo_description } => Draft::Seo {
            title: Some(seo_title),
            description: Some(seo_description),
        },
        GeneratedFields::Alt { alt_text } => Draft::Alt(alt_text),
    })
}

async fn load_target(
    ctx: &EngineContext,
    item: &JobItem,
    observer: &dyn RetryObserver,
) -> Result<TargetPayload, crate::classify::ClientError> {
    match item.target_type {
        TargetType::Product => {
            let product = ctx.store_api.fetch_product(&item.target_id, observer).await?;
            Ok(TargetPayload::Product {
                title: product.title,
                description: product.description,
            })
        }
        TargetType::Article => {
            let article = ctx.store_api.fetch_article(&item.target_id, observer).await?;
            Ok(TargetPayload::Article { title: article.title, body: article.body })
        }
        // Image context was captured at creation; only fall back to the
        // parent product when the title is missing.
        TargetType::Image => {
            let product_title = match (&item.title, &item.parent_id) {
                (Some(title), _) => title.clone(),
                (None, Some(parent)) => {
                    ctx.store_api.fetch_product(parent, observer).await?.title
                }
                (None, None) => String::new(),
            };
            Ok(TargetPayload::Image {
                product_title,
                image_url: item.image_url.clone(),
            })
        }
    }
}
