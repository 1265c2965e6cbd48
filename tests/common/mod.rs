//! Shared test support: an engine wired to in-memory store/lock/broker with
//! the real HTTP clients pointed at wiremock servers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use seobatch::clients::{GeneratorClient, StoreApiClient};
use seobatch::config::{GeneratorEnv, StoreApiEnv};
use seobatch::engine::{Dispatcher, EngineContext, EngineSettings, Producer};
use seobatch::lock::MemoryTenantLock;
use seobatch::queue::{Broker, MemoryBroker};
use seobatch::store::MemoryJobStore;

pub fn generator_env(endpoint: String, backoff_base: Duration) -> GeneratorEnv {
    GeneratorEnv {
        endpoint,
        api_key: "test-key".to_string(),
        model: "test-model".to_string(),
        max_attempts: 3,
        timeout: Duration::from_secs(5),
        backoff_base,
    }
}

pub fn store_api_env(endpoint: String, backoff_base: Duration) -> StoreApiEnv {
    StoreApiEnv {
        endpoint,
        access_token: "test-token".to_string(),
        max_attempts: 3,
        timeout: Duration::from_secs(5),
        backoff_base,
        throttle_min_available: 100,
        throttle_max_wait: Duration::from_secs(5),
    }
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        generate_item_pause: Duration::from_millis(5),
        publish_item_pause: Duration::from_millis(5),
        ..EngineSettings::default()
    }
}

pub struct TestEngine {
    pub ctx: Arc<EngineContext>,
    pub store: Arc<MemoryJobStore>,
    pub lock: Arc<MemoryTenantLock>,
    pub broker: Arc<MemoryBroker>,
    pub dispatcher: Dispatcher,
    pub worker_id: Uuid,
}

impl TestEngine {
    pub fn new(generator: GeneratorEnv, store_api: StoreApiEnv, settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let lock = Arc::new(MemoryTenantLock::new());
        let broker = Arc::new(MemoryBroker::new());
        let ctx = Arc::new(EngineContext {
            store: store.clone(),
            lock: lock.clone(),
            broker: broker.clone(),
            generator: GeneratorClient::new(generator),
            store_api: StoreApiClient::new(store_api),
            settings,
        });
        let worker_id = Uuid::new_v4();
        let dispatcher = Dispatcher::new(ctx.clone(), worker_id);
        Self { ctx, store, lock, broker, dispatcher, worker_id }
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            self.store.clone(),
            self.broker.clone(),
            self.ctx.store_api.clone(),
        )
    }

    /// Pull one due message and dispatch it, completing/delaying/failing it
    /// the way the worker supervisor would. Returns false when nothing was
    /// due.
    pub async fn process_next(&self) -> bool {
        let batch = self
            .broker
            .next_batch(1, self.worker_id, Duration::from_secs(60))
            .await
            .unwrap();
        let Some(message) = batch.into_iter().next() else {
            return false;
        };
        match self.dispatcher.dispatch(&message).await {
            Ok(seobatch::engine::DispatchOutcome::Done) => {
                self.broker.complete(message.id).await.unwrap();
            }
            Ok(seobatch::engine::DispatchOutcome::TenantBusy) => {
                self.broker
                    .delay_message(message.id, self.ctx.settings.tenant_lock_retry_delay)
                    .await
                    .unwrap();
            }
            Err(err) => {
                self.broker.fail(message.id, &err.to_string()).await.unwrap();
            }
        }
        true
    }
}

/// A chat-completions envelope whose content is the given JSON object.
pub fn completion_body(content: &Value) -> Value {
    json!({
        "choices": [
            { "message": { "role": "assistant", "content": content.to_string() } }
        ]
    })
}

/// GraphQL body for a single-product read.
pub fn product_body(gid: &str, title: &str) -> Value {
    json!({
        "data": {
            "product": {
                "id": gid,
                "title": title,
                "descriptionHtml": format!("<p>{title} description</p>"),
                "seo": { "title": null, "description": null },
                "titleTag": null,
                "descriptionTag": null
            }
        }
    })
}

/// GraphQL body for a successful metafieldsSet mutation.
pub fn metafields_ok_body() -> Value {
    json!({
        "data": {
            "metafieldsSet": {
                "metafields": [{ "id": "gid://store/Metafield/1" }],
                "userErrors": []
            }
        }
    })
}
