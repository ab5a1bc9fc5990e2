use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use notification_pipeline::{
    clients::{
        bus::{MemoryBus, MessageBus},
        circuit_breaker::CircuitBreaker,
        provider::{DeliveryProvider, ProviderReceipt},
        store::{MemoryStatusStore, StatusStore},
        template::TemplateStore,
        user::UserDirectory,
    },
    dispatcher::Dispatcher,
    models::{
        audit::StatusEvent,
        circuit_breaker::CircuitBreakerConfig,
        notification::{Channel, NotificationEnvelope, NotificationRequest},
        retry::RetryConfig,
        status::{NotificationStatus, StatusRecord},
        template::{RenderedContent, Template},
        user::{ChannelPreferences, UserRecord},
    },
    status::{StatusSink, StatusTracker},
    worker::{ChannelWorker, RetryCounters, WorkerSettings},
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const PUSH_TOKEN: &str =
    "fGcm0123456789_abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUV";

pub fn user(id: &str, email: bool, push: bool) -> UserRecord {
    UserRecord {
        id: id.to_string(),
        channels_enabled: ChannelPreferences { email, push },
        email_address: Some(format!("{}@example.com", id)),
        push_token: Some(PUSH_TOKEN.to_string()),
    }
}

pub fn template(code: &str) -> Template {
    Template {
        code: code.to_string(),
        subject: "Welcome {{name}}".to_string(),
        content: "Hello {{name}}, thanks for joining.".to_string(),
    }
}

pub fn request(request_id: &str, user_id: &str, channel: Channel) -> NotificationRequest {
    NotificationRequest {
        request_id: request_id.to_string(),
        user_id: user_id.to_string(),
        channel,
        template_code: "welcome".to_string(),
        variables: HashMap::from([("name".to_string(), serde_json::json!("Ada"))]),
        priority: 1,
        metadata: HashMap::new(),
    }
}

#[derive(Default)]
pub struct StaticUserDirectory {
    users: Mutex<HashMap<String, UserRecord>>,
    unavailable: AtomicBool,
    lookups: AtomicU32,
    delay_ms: AtomicU64,
}

impl StaticUserDirectory {
    pub fn with(users: impl IntoIterator<Item = UserRecord>) -> Self {
        let directory = Self::default();
        directory
            .users
            .lock()
            .extend(users.into_iter().map(|u| (u.id.clone(), u)));
        directory
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn get_user(&self, user_id: &str, _correlation_id: &str) -> Result<Option<UserRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        // Widens the window in which concurrent submissions overlap.
        match self.delay_ms.load(Ordering::SeqCst) {
            0 => tokio::task::yield_now().await,
            ms => tokio::time::sleep(Duration::from_millis(ms)).await,
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("user service down"));
        }
        Ok(self.users.lock().get(user_id).cloned())
    }
}

#[derive(Default)]
pub struct StaticTemplateStore {
    templates: Mutex<HashMap<String, Template>>,
}

impl StaticTemplateStore {
    pub fn with(templates: impl IntoIterator<Item = Template>) -> Self {
        let store = Self::default();
        store
            .templates
            .lock()
            .extend(templates.into_iter().map(|t| (t.code.clone(), t)));
        store
    }
}

#[async_trait]
impl TemplateStore for StaticTemplateStore {
    async fn get_template(&self, code: &str, _correlation_id: &str) -> Result<Option<Template>> {
        Ok(self.templates.lock().get(code).cloned())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProviderBehavior {
    Succeed,
    Fail,
    FailTimes(u32),
    Panic,
}

pub struct ScriptedProvider {
    behavior: Mutex<ProviderBehavior>,
    calls: AtomicU32,
    sent: Mutex<Vec<(String, RenderedContent)>>,
}

impl ScriptedProvider {
    pub fn new(behavior: ProviderBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: ProviderBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, RenderedContent)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DeliveryProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(
        &self,
        envelope: &NotificationEnvelope,
        content: &RenderedContent,
    ) -> Result<ProviderReceipt, Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = *self.behavior.lock();

        let fail = match behavior {
            ProviderBehavior::Succeed => false,
            ProviderBehavior::Fail => true,
            ProviderBehavior::FailTimes(n) => call <= n,
            ProviderBehavior::Panic => panic!("provider exploded"),
        };

        if fail {
            return Err(anyhow!("provider rejected attempt {}", call));
        }

        self.sent
            .lock()
            .push((envelope.notification_id.clone(), content.clone()));

        Ok(ProviderReceipt {
            provider: self.name().to_string(),
            message_id: format!("msg-{}", call),
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, NotificationStatus)>>,
}

impl RecordingSink {
    pub fn statuses_for(&self, notification_id: &str) -> Vec<NotificationStatus> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _)| id == notification_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn record(&self, event: &StatusEvent) -> Result<(), Error> {
        self.events
            .lock()
            .push((event.notification_id.clone(), event.status));
        Ok(())
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2,
    }
}

/// In-memory wiring of intake and status tracking around one user `u1`.
pub struct Harness {
    pub store: MemoryStatusStore,
    pub bus: MemoryBus,
    pub users: Arc<StaticUserDirectory>,
    pub sink: Arc<RecordingSink>,
    pub tracker: StatusTracker,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_users([user("u1", true, true)])
    }

    pub fn with_users(users: impl IntoIterator<Item = UserRecord>) -> Self {
        let store = MemoryStatusStore::new();
        let bus = MemoryBus::new();
        let users = Arc::new(StaticUserDirectory::with(users));
        let templates = Arc::new(StaticTemplateStore::with([template("welcome")]));
        let sink = Arc::new(RecordingSink::default());

        let tracker = StatusTracker::new(
            Arc::new(store.clone()),
            sink.clone(),
            Duration::from_secs(86_400),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            users.clone(),
            templates,
            tracker.clone(),
            Duration::from_secs(3600),
        ));

        Self {
            store,
            bus,
            users,
            sink,
            tracker,
            dispatcher,
        }
    }

    pub fn worker(
        &self,
        channel: Channel,
        provider: Arc<ScriptedProvider>,
        breaker_config: CircuitBreakerConfig,
    ) -> Arc<ChannelWorker> {
        let bus: Arc<dyn MessageBus> = Arc::new(self.bus.clone());

        Arc::new(ChannelWorker::new(
            channel,
            bus,
            self.tracker.clone(),
            provider,
            Arc::new(CircuitBreaker::new(channel.provider_name(), breaker_config)),
            Arc::new(RetryCounters::new()),
            WorkerSettings {
                retry: fast_retry(),
                concurrency: 1,
                prefetch: 1,
            },
        ))
    }

    pub fn status_store(&self) -> Arc<dyn StatusStore> {
        Arc::new(self.store.clone())
    }
}

pub fn spawn_worker(
    worker: Arc<ChannelWorker>,
) -> (CancellationToken, JoinHandle<Result<(), notification_pipeline::error::BusError>>) {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));
    (shutdown, handle)
}

/// Polls `check` until it returns true or five seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Polls the tracker until the notification reaches `status`.
pub async fn wait_for_status(
    tracker: &StatusTracker,
    notification_id: &str,
    status: NotificationStatus,
) -> Option<StatusRecord> {
    for _ in 0..500 {
        if let Ok(Some(record)) = tracker.get(notification_id).await {
            if record.status == status {
                return Some(record);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}
