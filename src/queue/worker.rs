//! Worker supervisor: polls the broker and fans messages out to the
//! dispatcher, bounded by a concurrency semaphore, with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::{
    signal,
    sync::{Semaphore, mpsc},
    time::{interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::engine::{DispatchOutcome, Dispatcher};
use crate::entities::QueueMessage;

use super::Broker;

/// Worker configuration
#[derive(Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    /// Redelivery delay for messages bounced off a busy tenant lock.
    pub lock_retry_delay: Duration,
    /// Stop once the queue is drained instead of polling forever.
    pub shutdown_when_queue_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            visibility_timeout_secs: 300, // 5 minutes
            lock_retry_delay: Duration::from_secs(10),
            shutdown_when_queue_empty: false,
        }
    }
}

/// Main worker supervisor that orchestrates message processing
pub struct WorkerSupervisor {
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    worker_id: Uuid,
    shutdown_token: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new(
        broker: Arc<dyn Broker>,
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
        worker_id: Uuid,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            config,
            worker_id,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the worker supervisor
    pub async fn run(self) -> Result<()> {
        info!("Starting worker supervisor with ID: {}", self.worker_id);
        info!(
            "Configuration - concurrency: {}, poll_interval: {}ms, visibility_timeout: {}s",
            self.config.concurrency, self.config.poll_interval_ms, self.config.visibility_timeout_secs
        );

        // Bounded channel between fetcher and processor.
        let (message_sender, message_receiver) = mpsc::channel(self.config.concurrency * 2);

        // Semaphore to limit concurrent message processing
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        // Spawn shutdown handler
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Received shutdown signal, initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        // Spawn message fetcher
        let fetcher_handle = {
            let broker = self.broker.clone();
            let worker_id = self.worker_id;
            let config = self.config.clone();
            let shutdown_token = self.shutdown_token.clone();
            tokio::spawn(
                Self::run_fetcher(broker, worker_id, config, message_sender, shutdown_token)
                    .instrument(info_span!("fetcher", worker_id = %worker_id)),
            )
        };

        // Spawn message processor
        let processor_handle = {
            let broker = self.broker.clone();
            let dispatcher = self.dispatcher.clone();
            let config = self.config.clone();
            let semaphore = semaphore.clone();
            let shutdown_token = self.shutdown_token.clone();
            tokio::spawn(
                Self::run_processor(
                    broker,
                    dispatcher,
                    config,
                    message_receiver,
                    semaphore,
                    shutdown_token,
                )
                .instrument(info_span!("processor", worker_id = %self.worker_id)),
            )
        };

        let _ = tokio::join!(fetcher_handle, processor_handle);

        // Wait for all permits to be available (all messages completed)
        let _permits = semaphore.acquire_many(self.config.concurrency as u32).await?;
        info!("All in-flight messages completed, shutting down");
        Ok(())
    }

    /// Message fetching loop
    async fn run_fetcher(
        broker: Arc<dyn Broker>,
        worker_id: Uuid,
        config: WorkerConfig,
        message_sender: mpsc::Sender<QueueMessage>,
        shutdown_token: CancellationToken,
    ) -> Result<()> {
        let mut poll_interval = interval(Duration::from_millis(config.poll_interval_ms));
        let visibility = Duration::from_secs(config.visibility_timeout_secs);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    info!("Fetcher shutting down");
                    break;
                }
                _ = poll_interval.tick() => {
                    match broker
                        .next_batch(config.concurrency as i64, worker_id, visibility)
                        .await
                    {
                        Ok(messages) => {
                            debug!("Fetched {} messages", messages.len());
                            if messages.is_empty() && config.shutdown_when_queue_empty {
                                debug!("Queue drained, stopping fetcher");
                                break;
                            }
                            for message in messages {
                                if message_sender.send(message).await.is_err() {
                                    warn!("Message receiver dropped, stopping fetcher");
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => {
                            error!("Failed to fetch messages: {}", e);
                            // Jittered pause on error to avoid a tight loop of
                            // synchronized workers.
                            let jitter = rand::thread_rng().gen_range(0..250);
                            sleep(Duration::from_millis(1000 + jitter)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Message processing loop
    async fn run_processor(
        broker: Arc<dyn Broker>,
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
        mut message_receiver: mpsc::Receiver<QueueMessage>,
        semaphore: Arc<Semaphore>,
        shutdown_token: CancellationToken,
    ) -> Result<()> {
        while let Some(message) = tokio::select! {
            _ = shutdown_token.cancelled() => None,
            message = message_receiver.recv() => message,
        } {
            let permit = semaphore.clone().acquire_owned().await?;
            let broker = broker.clone();
            let dispatcher = dispatcher.clone();
            let lock_retry_delay = config.lock_retry_delay;

            let span = info_span!(
                "message",
                id = %message.id,
                job_id = %message.job_id,
                kind = message.kind.as_str(),
                attempt = message.attempts,
            );
            tokio::spawn(
                async move {
                    let _permit = permit; // Hold permit until the message completes
                    Self::process_message(broker, dispatcher, lock_retry_delay, message).await;
                }
                .instrument(span),
            );
        }

        info!("Processor shutting down");
        Ok(())
    }

    /// Process a single message
    async fn process_message(
        broker: Arc<dyn Broker>,
        dispatcher: Arc<Dispatcher>,
        lock_retry_delay: Duration,
        message: QueueMessage,
    ) {
        info!(
            "Processing {} message for job {} (attempt {})",
            message.kind.as_str(),
            message.job_id,
            message.attempts + 1
        );

        match dispatcher.dispatch(&message).await {
            Ok(DispatchOutcome::Done) => {
                if let Err(e) = broker.complete(message.id).await {
                    error!("Failed to complete message {}: {}", message.id, e);
                }
            }
            Ok(DispatchOutcome::TenantBusy) => {
                // Redeliver later without consuming a delivery attempt.
                if let Err(e) = broker.delay_message(message.id, lock_retry_delay).await {
                    error!("Failed to delay message {}: {}", message.id, e);
                }
            }
            Err(e) => {
                error!("Message {} failed: {}", message.id, e);
                if let Err(fail_err) = broker.fail(message.id, &e.to_string()).await {
                    error!("Failed to record message failure {}: {}", message.id, fail_err);
                }
            }
        }
    }
}
