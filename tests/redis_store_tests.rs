use std::{sync::Arc, time::Duration};

use anyhow::Result;
use notification_pipeline::{
    clients::{redis::RedisStatusStore, store::StatusStore},
    models::{
        notification::Channel,
        status::{NotificationStatus, StatusUpdate},
    },
    status::{NullStatusSink, StatusTracker},
};
use testcontainers::{
    ContainerAsync, GenericImage,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::time::sleep;

use crate::common::{Harness, request};

async fn redis() -> Result<(ContainerAsync<GenericImage>, RedisStatusStore)> {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(6379.tcp()).await?;
    let store = RedisStatusStore::connect(&format!("redis://{}:{}", host, port)).await?;

    Ok((container, store))
}

/// Test: SET NX only succeeds for the first writer
#[tokio::test]
#[ignore = "requires docker"]
async fn test_set_if_absent_is_exclusive() -> Result<()> {
    let (_container, store) = redis().await?;
    let ttl = Duration::from_secs(60);

    assert!(store.set_if_absent("request:r1", "reserved:n1", ttl).await?);
    assert!(!store.set_if_absent("request:r1", "reserved:n2", ttl).await?);
    assert_eq!(
        store.get("request:r1").await?.as_deref(),
        Some("reserved:n1")
    );

    Ok(())
}

/// Test: Compare-and-set only replaces the expected value
#[tokio::test]
#[ignore = "requires docker"]
async fn test_compare_and_set() -> Result<()> {
    let (_container, store) = redis().await?;
    let ttl = Duration::from_secs(60);

    store.put("status:n1", "a", ttl).await?;

    assert!(!store.compare_and_set("status:n1", "stale", "b", ttl).await?);
    assert!(store.compare_and_set("status:n1", "a", "b", ttl).await?);
    assert!(!store.compare_and_set("missing", "a", "b", ttl).await?);
    assert_eq!(store.get("status:n1").await?.as_deref(), Some("b"));

    Ok(())
}

/// Test: Keys and counters expire after their TTL
#[tokio::test]
#[ignore = "requires docker"]
async fn test_keys_expire() -> Result<()> {
    let (_container, store) = redis().await?;

    store.put("short", "v", Duration::from_secs(1)).await?;
    assert_eq!(store.increment_counter("rate_limit:u1", Duration::from_secs(1)).await?, 1);
    assert_eq!(store.increment_counter("rate_limit:u1", Duration::from_secs(1)).await?, 2);

    sleep(Duration::from_millis(1500)).await;

    assert!(store.get("short").await?.is_none());
    assert_eq!(store.increment_counter("rate_limit:u1", Duration::from_secs(1)).await?, 1);

    Ok(())
}

/// Test: Status records keep terminal states final against a real store
#[tokio::test]
#[ignore = "requires docker"]
async fn test_status_tracking_on_redis() -> Result<()> {
    let (_container, store) = redis().await?;
    let store: Arc<dyn StatusStore> = Arc::new(store);
    let tracker = StatusTracker::new(
        Arc::clone(&store),
        Arc::new(NullStatusSink),
        Duration::from_secs(60),
    );

    let harness = Harness::new();
    harness
        .dispatcher
        .submit(request("r1", "u1", Channel::Email), "u1", None)
        .await?;
    let envelope = harness.bus.published().remove(0);

    tracker.initialize(&envelope).await?;
    let id = envelope.notification_id.as_str();

    tracker
        .apply(StatusUpdate::new(id, NotificationStatus::Processing))
        .await?;
    let delivered = tracker
        .apply(StatusUpdate::new(id, NotificationStatus::Delivered))
        .await?;
    assert_eq!(delivered.attempts, 1);

    assert!(
        tracker
            .apply(StatusUpdate::new(id, NotificationStatus::Failed))
            .await
            .is_err()
    );
    assert_eq!(
        tracker.get(id).await?.map(|r| r.status),
        Some(NotificationStatus::Delivered)
    );

    store.ping().await?;

    Ok(())
}
