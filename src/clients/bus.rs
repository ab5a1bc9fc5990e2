//! Message bus seam between intake and the channel workers.
//!
//! Consumption is a plain stream of [`Delivery`] values. Each delivery owns an
//! acknowledger, and the worker decides explicitly whether to ack, requeue or
//! reject it once its handler has returned.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::{
    error::BusError,
    models::{
        message::DeadLetterRecord,
        notification::{Channel, NotificationEnvelope},
    },
};

#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub exchange: String,
    pub email_queue: String,
    pub push_queue: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
}

impl QueueTopology {
    pub fn queue_for(&self, channel: Channel) -> &str {
        match channel {
            Channel::Email => &self.email_queue,
            Channel::Push => &self.push_queue,
        }
    }

    /// Channel queues are bound to the exchange under the channel name.
    pub fn routing_key(channel: Channel) -> &'static str {
        channel.as_str()
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            exchange: "notifications.direct".to_string(),
            email_queue: "email.queue".to_string(),
            push_queue: "push.queue".to_string(),
            dead_letter_queue: "failed.queue".to_string(),
            dead_letter_routing_key: "failed".to_string(),
        }
    }
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;

    /// Negative acknowledgement that puts the message back on its queue.
    async fn requeue(&self) -> Result<(), BusError>;

    /// Negative acknowledgement that drops the message.
    async fn reject(&self) -> Result<(), BusError>;
}

pub struct Delivery {
    pub data: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(data: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            data,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn requeue(&self) -> Result<(), BusError> {
        self.acker.requeue().await
    }

    pub async fn reject(&self) -> Result<(), BusError> {
        self.acker.reject().await
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BusError>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a persistent message to the queue of `envelope.channel`.
    async fn publish(&self, envelope: &NotificationEnvelope) -> Result<(), BusError>;

    async fn publish_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), BusError>;

    /// Opens a consumer on the channel queue with at most `prefetch`
    /// unacknowledged messages in flight.
    async fn subscribe(&self, channel: Channel, prefetch: u16)
    -> Result<DeliveryStream, BusError>;

    fn is_connected(&self) -> bool;

    fn topology(&self) -> &QueueTopology;
}

struct MemoryQueue {
    sender: mpsc::UnboundedSender<QueuedMessage>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<QueuedMessage>>>,
}

struct QueuedMessage {
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryCounters {
    acked: AtomicUsize,
    requeued: AtomicUsize,
    rejected: AtomicUsize,
}

/// In-process bus with one unbounded queue per channel.
///
/// Multiple subscribers on the same channel compete for messages. Requeued
/// messages go to the back of their queue.
#[derive(Clone)]
pub struct MemoryBus {
    topology: QueueTopology,
    queues: Arc<HashMap<Channel, MemoryQueue>>,
    published: Arc<Mutex<Vec<NotificationEnvelope>>>,
    dead_letters: Arc<Mutex<Vec<DeadLetterRecord>>>,
    counters: Arc<MemoryCounters>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_topology(QueueTopology::default())
    }

    pub fn with_topology(topology: QueueTopology) -> Self {
        let queues = Channel::ALL
            .into_iter()
            .map(|channel| {
                let (sender, receiver) = mpsc::unbounded_channel();
                let queue = MemoryQueue {
                    sender,
                    receiver: Arc::new(AsyncMutex::new(receiver)),
                };
                (channel, queue)
            })
            .collect();

        Self {
            topology,
            queues: Arc::new(queues),
            published: Arc::new(Mutex::new(Vec::new())),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(MemoryCounters::default()),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Raw bytes pushed straight onto a channel queue, bypassing `publish`.
    pub fn inject(&self, channel: Channel, data: Vec<u8>) {
        if let Some(queue) = self.queues.get(&channel) {
            let _ = queue.sender.send(QueuedMessage {
                data,
                redelivered: false,
            });
        }
    }

    pub fn published(&self) -> Vec<NotificationEnvelope> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, channel: Channel) -> usize {
        self.published
            .lock()
            .iter()
            .filter(|e| e.channel == channel)
            .count()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.lock().clone()
    }

    pub fn acked(&self) -> usize {
        self.counters.acked.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.counters.requeued.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.counters.rejected.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Connection("memory bus switched off".into()));
        }
        Ok(())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryAcker {
    data: Vec<u8>,
    sender: mpsc::UnboundedSender<QueuedMessage>,
    counters: Arc<MemoryCounters>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn requeue(&self) -> Result<(), BusError> {
        self.sender
            .send(QueuedMessage {
                data: self.data.clone(),
                redelivered: true,
            })
            .map_err(|_| BusError::Acknowledge("memory queue closed".into()))?;
        self.counters.requeued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self) -> Result<(), BusError> {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, envelope: &NotificationEnvelope) -> Result<(), BusError> {
        self.check_available()
            .map_err(|e| BusError::Publish(e.to_string()))?;

        let payload =
            serde_json::to_vec(envelope).map_err(|e| BusError::Publish(e.to_string()))?;

        let queue = self
            .queues
            .get(&envelope.channel)
            .ok_or_else(|| BusError::Publish(format!("no queue for {}", envelope.channel)))?;

        queue
            .sender
            .send(QueuedMessage {
                data: payload,
                redelivered: false,
            })
            .map_err(|_| BusError::Publish("memory queue closed".into()))?;

        self.published.lock().push(envelope.clone());
        Ok(())
    }

    async fn publish_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), BusError> {
        self.check_available()
            .map_err(|e| BusError::Publish(e.to_string()))?;

        self.dead_letters.lock().push(record.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: Channel,
        _prefetch: u16,
    ) -> Result<DeliveryStream, BusError> {
        self.check_available()?;

        let queue = self
            .queues
            .get(&channel)
            .ok_or_else(|| BusError::Consume(format!("no queue for {}", channel)))?;

        let receiver = Arc::clone(&queue.receiver);
        let sender = queue.sender.clone();
        let counters = Arc::clone(&self.counters);

        let deliveries = stream::unfold(receiver, move |receiver| {
            let sender = sender.clone();
            let counters = Arc::clone(&counters);

            async move {
                let message = receiver.lock().await.recv().await?;
                let acker = MemoryAcker {
                    data: message.data.clone(),
                    sender,
                    counters,
                };
                let delivery = Delivery::new(message.data, message.redelivered, Box::new(acker));

                Some((Ok(delivery), receiver))
            }
        });

        Ok(deliveries.boxed())
    }

    fn is_connected(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn topology(&self) -> &QueueTopology {
        &self.topology
    }
}
