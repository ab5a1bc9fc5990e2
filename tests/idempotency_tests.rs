use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use notification_pipeline::{
    clients::store::StatusStore,
    dispatcher::request_key,
    error::IntakeError,
    models::{notification::Channel, status::NotificationStatus},
};
use tokio_test::{assert_err, assert_ok};

use crate::common::{Harness, request, user};

/// Test: Resubmitting a request id returns the original notification
#[tokio::test]
async fn test_resubmission_returns_original_notification() -> Result<()> {
    let harness = Harness::new();

    let first = harness
        .dispatcher
        .submit(request("r1", "u1", Channel::Email), "u1", None)
        .await?;
    let second = harness
        .dispatcher
        .submit(request("r1", "u1", Channel::Email), "u1", None)
        .await?;

    assert_eq!(first.status, NotificationStatus::Pending);
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(second.notification_id, first.notification_id);
    assert_eq!(second.status, NotificationStatus::Pending);
    assert_eq!(harness.bus.published().len(), 1);

    let marker = harness.store.get(&request_key("r1")).await?;
    assert_eq!(marker.as_deref(), Some(first.notification_id.as_str()));

    Ok(())
}

/// Test: Concurrent duplicates produce one publish and one notification id
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_publish_once() -> Result<()> {
    let harness = Harness::new();
    let mut handles = Vec::new();

    for _ in 0..20 {
        let dispatcher = Arc::clone(&harness.dispatcher);
        handles.push(tokio::spawn(async move {
            dispatcher
                .submit(request("r-concurrent", "u1", Channel::Push), "u1", None)
                .await
        }));
    }

    let mut ids = HashSet::new();
    let mut originals = 0;
    for handle in handles {
        let outcome = handle.await??;
        if !outcome.duplicate {
            originals += 1;
        }
        ids.insert(outcome.notification_id);
    }

    assert_eq!(originals, 1, "exactly one caller should win the reservation");
    assert_eq!(ids.len(), 1, "all callers should see the same notification id");
    assert_eq!(harness.bus.published_to(Channel::Push), 1);
    assert_eq!(harness.store.keys_with_prefix("status:").len(), 1);

    Ok(())
}

/// Test: Different request ids are independent
#[tokio::test]
async fn test_distinct_requests_are_not_deduplicated() -> Result<()> {
    let harness = Harness::new();

    let a = harness
        .dispatcher
        .submit(request("ra", "u1", Channel::Email), "u1", None)
        .await?;
    let b = harness
        .dispatcher
        .submit(request("rb", "u1", Channel::Email), "u1", None)
        .await?;

    assert_ne!(a.notification_id, b.notification_id);
    assert!(!b.duplicate);
    assert_eq!(harness.bus.published().len(), 2);

    Ok(())
}

/// Test: Intake fails closed when the store is unreachable
#[tokio::test]
async fn test_store_outage_rejects_request() -> Result<()> {
    let harness = Harness::new();
    harness.store.set_available(false);

    let err = assert_err!(
        harness
            .dispatcher
            .submit(request("r1", "u1", Channel::Email), "u1", None)
            .await
    );

    assert!(matches!(err, IntakeError::DependencyUnavailable(_)));
    assert!(err.is_retryable());
    assert!(harness.bus.published().is_empty());
    assert_eq!(harness.users.lookups(), 0);

    Ok(())
}

/// Test: A rejected request can be resubmitted once the cause is fixed
#[tokio::test]
async fn test_rejection_releases_marker() -> Result<()> {
    let harness = Harness::new();
    harness.users.set_available(false);

    let err = assert_err!(
        harness
            .dispatcher
            .submit(request("r1", "u1", Channel::Email), "u1", None)
            .await
    );
    assert!(matches!(err, IntakeError::DependencyUnavailable(_)));
    assert!(harness.store.keys_with_prefix("request:").is_empty());

    harness.users.set_available(true);
    let outcome = assert_ok!(
        harness
            .dispatcher
            .submit(request("r1", "u1", Channel::Email), "u1", None)
            .await
    );

    assert!(!outcome.duplicate);
    assert_eq!(harness.bus.published().len(), 1);

    Ok(())
}

/// Test: Publish failure leaves neither a status record nor a marker
#[tokio::test]
async fn test_publish_failure_is_a_hard_rejection() -> Result<()> {
    let harness = Harness::new();
    harness.bus.set_available(false);

    let err = assert_err!(
        harness
            .dispatcher
            .submit(request("r1", "u1", Channel::Email), "u1", None)
            .await
    );

    assert!(matches!(err, IntakeError::DependencyUnavailable(_)));
    assert!(harness.store.keys_with_prefix("status:").is_empty());
    assert!(harness.store.keys_with_prefix("request:").is_empty());

    harness.bus.set_available(true);
    let outcome = harness
        .dispatcher
        .submit(request("r1", "u1", Channel::Email), "u1", None)
        .await?;
    assert!(!outcome.duplicate);

    Ok(())
}

/// Test: A duplicate racing a rejected original is rejected too
#[tokio::test]
async fn test_duplicate_of_rejected_request_is_not_accepted() -> Result<()> {
    let harness = Harness::with_users([user("u1", true, false)]);
    harness.users.set_delay(Duration::from_millis(100));

    let dispatcher = Arc::clone(&harness.dispatcher);
    let first = tokio::spawn(async move {
        dispatcher
            .submit(request("r1", "u1", Channel::Push), "u1", None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = harness
        .dispatcher
        .submit(request("r1", "u1", Channel::Push), "u1", None)
        .await;

    assert!(matches!(
        first.await?,
        Err(IntakeError::ChannelDisabled { .. })
    ));
    assert!(matches!(second, Err(IntakeError::ChannelDisabled { .. })));
    assert_eq!(harness.users.lookups(), 2);
    assert!(harness.bus.published().is_empty());
    assert!(harness.store.keys_with_prefix("status:").is_empty());
    assert!(harness.store.keys_with_prefix("request:").is_empty());

    Ok(())
}

/// Test: A duplicate racing an accepted original waits for its notification id
#[tokio::test]
async fn test_duplicate_waits_for_in_flight_original() -> Result<()> {
    let harness = Harness::new();
    harness.users.set_delay(Duration::from_millis(100));

    let dispatcher = Arc::clone(&harness.dispatcher);
    let first = tokio::spawn(async move {
        dispatcher
            .submit(request("r1", "u1", Channel::Email), "u1", None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = assert_ok!(
        harness
            .dispatcher
            .submit(request("r1", "u1", Channel::Email), "u1", None)
            .await
    );
    let first = first.await??;

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(second.notification_id, first.notification_id);
    assert!(
        harness
            .tracker
            .get(&second.notification_id)
            .await?
            .is_some()
    );
    assert_eq!(harness.users.lookups(), 1);
    assert_eq!(harness.bus.published().len(), 1);

    Ok(())
}

/// Test: A reservation that never resolves answers retryable or falls back to the status record
#[tokio::test]
async fn test_stale_reservation() -> Result<()> {
    let harness = Harness::new();
    let ttl = Duration::from_secs(60);

    let published = harness
        .dispatcher
        .submit(request("r1", "u1", Channel::Email), "u1", None)
        .await?;
    harness
        .store
        .put(
            &request_key("r1"),
            &format!("reserved:{}", published.notification_id),
            ttl,
        )
        .await?;
    harness
        .store
        .put(&request_key("r2"), "reserved:never-published", ttl)
        .await?;

    let (replayed, abandoned) = tokio::join!(
        harness
            .dispatcher
            .submit(request("r1", "u1", Channel::Email), "u1", None),
        harness
            .dispatcher
            .submit(request("r2", "u1", Channel::Email), "u1", None),
    );

    let replayed = assert_ok!(replayed);
    assert!(replayed.duplicate);
    assert_eq!(replayed.notification_id, published.notification_id);

    let err = assert_err!(abandoned);
    assert!(matches!(err, IntakeError::DependencyUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(harness.bus.published().len(), 1);

    Ok(())
}
