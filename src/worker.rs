//! Per-channel consumer: render, guarded provider send, status updates,
//! backoff redelivery and dead-lettering.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::json;
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    clients::{
        bus::{Delivery, MessageBus},
        circuit_breaker::CircuitBreaker,
        provider::DeliveryProvider,
    },
    error::{BreakerError, BusError, DeliveryError, StatusError},
    models::{
        message::DeadLetterRecord,
        notification::{Channel, NotificationEnvelope},
        retry::RetryConfig,
        status::{NotificationStatus, StatusUpdate},
    },
    status::StatusTracker,
};

/// Entries untouched for this long belong to messages settled elsewhere.
const COUNTER_IDLE_TTL: Duration = Duration::from_secs(3600);
const COUNTER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct RetryCount {
    failures: u32,
    touched_at: Instant,
}

/// Failed attempts per notification, local to this process. Messages finished
/// by another consumer never clear their entry here, so idle entries are
/// evicted periodically.
#[derive(Debug, Default)]
pub struct RetryCounters {
    counts: DashMap<String, RetryCount>,
}

impl RetryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, notification_id: &str) -> u32 {
        let now = Instant::now();
        let mut count = self
            .counts
            .entry(notification_id.to_string())
            .or_insert(RetryCount {
                failures: 0,
                touched_at: now,
            });
        count.failures += 1;
        count.touched_at = now;
        count.failures
    }

    pub fn get(&self, notification_id: &str) -> u32 {
        self.counts
            .get(notification_id)
            .map(|c| c.failures)
            .unwrap_or(0)
    }

    pub fn clear(&self, notification_id: &str) {
        self.counts.remove(notification_id);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Drops entries not incremented within `max_idle`. Returns how many were
    /// removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.counts.len();
        self.counts
            .retain(|_, count| count.touched_at.elapsed() <= max_idle);
        before.saturating_sub(self.counts.len())
    }
}

/// What to do with a delivery once its handler has returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack,
    RetryAfter(Duration),
    DeadLetter {
        notification_id: Option<String>,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub retry: RetryConfig,
    pub concurrency: usize,
    pub prefetch: u16,
}

pub struct ChannelWorker {
    channel: Channel,
    bus: Arc<dyn MessageBus>,
    tracker: StatusTracker,
    provider: Arc<dyn DeliveryProvider>,
    breaker: Arc<CircuitBreaker>,
    counters: Arc<RetryCounters>,
    settings: WorkerSettings,
}

impl ChannelWorker {
    pub fn new(
        channel: Channel,
        bus: Arc<dyn MessageBus>,
        tracker: StatusTracker,
        provider: Arc<dyn DeliveryProvider>,
        breaker: Arc<CircuitBreaker>,
        counters: Arc<RetryCounters>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            channel,
            bus,
            tracker,
            provider,
            breaker,
            counters,
            settings,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Consumes the channel queue until `shutdown` fires or the stream ends,
    /// then waits for in-flight deliveries to settle.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut deliveries = self
            .bus
            .subscribe(self.channel, self.settings.prefetch)
            .await?;

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        let mut sweep = interval(COUNTER_SWEEP_INTERVAL);

        info!(
            channel = %self.channel,
            concurrency = self.settings.concurrency,
            prefetch = self.settings.prefetch,
            "Channel worker started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    let evicted = self.counters.evict_idle(COUNTER_IDLE_TTL);
                    if evicted > 0 {
                        debug!(channel = %self.channel, evicted, "Evicted idle retry counters");
                    }
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(channel = %self.channel, error = %e, "Failed to receive delivery");
                    continue;
                }
                None => {
                    warn!(channel = %self.channel, "Delivery stream closed");
                    break;
                }
            };

            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            in_flight.spawn(async move {
                worker.process(delivery, shutdown).await;
                drop(permit);
            });

            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!(channel = %self.channel, error = %e, "Delivery task aborted");
                }
            }
        }

        info!(
            channel = %self.channel,
            in_flight = in_flight.len(),
            "Channel worker draining"
        );

        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!(channel = %self.channel, error = %e, "Delivery task aborted");
            }
        }

        info!(channel = %self.channel, "Channel worker stopped");
        Ok(())
    }

    async fn process(self: Arc<Self>, delivery: Delivery, shutdown: CancellationToken) {
        let handler = Arc::clone(&self);
        let payload = delivery.data.clone();

        // A panicking handler only takes down its own task.
        let disposition = match tokio::spawn(async move { handler.handle(&payload).await }).await
        {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(channel = %self.channel, error = %e, "Delivery handler panicked");
                self.recover(&delivery.data, format!("handler panicked: {}", e))
                    .await
            }
        };

        self.settle(&delivery, disposition, &shutdown).await;
    }

    /// Runs one delivery attempt for a raw payload.
    pub async fn handle(&self, payload: &[u8]) -> Disposition {
        let envelope = match serde_json::from_slice::<NotificationEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let error = DeliveryError::MalformedEnvelope(e.to_string());
                warn!(channel = %self.channel, error = %error, "Dead-lettering undecodable payload");
                return Disposition::DeadLetter {
                    notification_id: None,
                    error: error.to_string(),
                };
            }
        };

        let span = info_span!(
            "delivery",
            notification_id = %envelope.notification_id,
            channel = %envelope.channel,
            correlation_id = %envelope.correlation_id,
        );

        self.deliver(&envelope).instrument(span).await
    }

    async fn deliver(&self, envelope: &NotificationEnvelope) -> Disposition {
        let notification_id = envelope.notification_id.as_str();

        match self
            .tracker
            .apply(StatusUpdate::new(notification_id, NotificationStatus::Processing))
            .await
        {
            Ok(record) => debug!(attempts = record.attempts, "Delivery attempt started"),
            Err(StatusError::InvalidTransition { from, .. }) if from.is_terminal() => {
                info!(status = %from, "Notification already finalized, skipping redelivery");
                self.counters.clear(notification_id);
                return Disposition::Ack;
            }
            Err(e) => warn!(error = %e, "Status update skipped"),
        }

        let content = match envelope.template.render(&envelope.variables) {
            Ok(content) => content,
            Err(e) => return self.on_failure(envelope, e).await,
        };

        let provider = Arc::clone(&self.provider);
        let result = self
            .breaker
            .execute(|| async move { provider.send(envelope, &content).await })
            .await;

        match result {
            Ok(receipt) => {
                let metadata = HashMap::from([
                    ("provider".to_string(), json!(receipt.provider)),
                    ("provider_message_id".to_string(), json!(receipt.message_id)),
                    ("delivered_at".to_string(), json!(Utc::now().to_rfc3339())),
                ]);

                self.tracker
                    .record(
                        notification_id,
                        NotificationStatus::Delivered,
                        None,
                        Some(metadata),
                    )
                    .await;
                self.counters.clear(notification_id);

                info!(provider_message_id = %receipt.message_id, "Notification delivered");
                Disposition::Ack
            }
            Err(BreakerError::Open(name)) => {
                self.on_failure(envelope, DeliveryError::BreakerOpen(name))
                    .await
            }
            Err(BreakerError::Operation(e)) => {
                self.on_failure(envelope, DeliveryError::Provider(format!("{:#}", e)))
                    .await
            }
        }
    }

    async fn on_failure(&self, envelope: &NotificationEnvelope, error: DeliveryError) -> Disposition {
        let notification_id = envelope.notification_id.as_str();

        if error.is_permanent() {
            warn!(error = %error, "Permanent delivery failure");
            return Disposition::DeadLetter {
                notification_id: Some(notification_id.to_string()),
                error: error.to_string(),
            };
        }

        let attempts = self.counters.increment(notification_id);

        if attempts >= self.settings.retry.max_attempts {
            warn!(
                attempts,
                error = %error,
                "Retry budget exhausted"
            );
            return Disposition::DeadLetter {
                notification_id: Some(notification_id.to_string()),
                error: error.to_string(),
            };
        }

        let delay = self.settings.retry.backoff_for(attempts);
        let metadata = HashMap::from([
            ("retry_attempt".to_string(), json!(attempts)),
            ("retry_delay_ms".to_string(), json!(delay.as_millis() as u64)),
        ]);

        self.tracker
            .record(
                notification_id,
                NotificationStatus::Retrying,
                Some(error.to_string()),
                Some(metadata),
            )
            .await;

        warn!(
            attempts,
            max_attempts = self.settings.retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Delivery failed, scheduling retry"
        );

        Disposition::RetryAfter(delay)
    }

    async fn recover(&self, payload: &[u8], reason: String) -> Disposition {
        match serde_json::from_slice::<NotificationEnvelope>(payload) {
            Ok(envelope) => {
                self.on_failure(&envelope, DeliveryError::Provider(reason))
                    .await
            }
            Err(e) => Disposition::DeadLetter {
                notification_id: None,
                error: DeliveryError::MalformedEnvelope(e.to_string()).to_string(),
            },
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
        shutdown: &CancellationToken,
    ) {
        let outcome = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::RetryAfter(delay) => {
                wait(delay, shutdown).await;
                delivery.requeue().await
            }
            Disposition::DeadLetter {
                notification_id,
                error,
            } => {
                self.dead_letter(delivery, notification_id, error, shutdown)
                    .await
            }
        };

        if let Err(e) = outcome {
            error!(channel = %self.channel, error = %e, "Failed to settle delivery");
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        notification_id: Option<String>,
        error: String,
        shutdown: &CancellationToken,
    ) -> Result<(), BusError> {
        let record = DeadLetterRecord::new(
            notification_id.clone(),
            self.bus.topology().queue_for(self.channel),
            error.clone(),
            delivery.data.clone(),
        );

        if let Err(e) = self.bus.publish_dead_letter(&record).await {
            let attempts = notification_id
                .as_deref()
                .map(|id| self.counters.get(id))
                .unwrap_or(1);
            let delay = self.settings.retry.backoff_for(attempts);

            error!(
                channel = %self.channel,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Dead-letter publish failed, requeueing"
            );

            wait(delay, shutdown).await;
            return delivery.requeue().await;
        }

        if let Some(id) = notification_id.as_deref() {
            self.tracker
                .record(id, NotificationStatus::Failed, Some(error), None)
                .await;
            self.counters.clear(id);
        }

        info!(
            channel = %self.channel,
            notification_id = notification_id.as_deref().unwrap_or("unknown"),
            "Message moved to dead-letter queue"
        );

        delivery.ack().await
    }
}

async fn wait(delay: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = sleep(delay) => {}
        _ = shutdown.cancelled() => {}
    }
}
