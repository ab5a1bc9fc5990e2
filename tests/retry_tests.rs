use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use anyhow::{Result, anyhow};
use notification_pipeline::{
    clients::store::MemoryStatusStore,
    models::retry::RetryConfig,
    utils::{check_rate_limit, retry_with_backoff, with_jitter},
};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn lookup_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 20,
        max_delay_ms: 200,
        backoff_multiplier: 2,
    }
}

/// Test: A lookup that recovers within the budget returns its value
#[tokio::test]
async fn test_lookup_recovers_within_budget() -> Result<()> {
    let calls = &AtomicU32::new(0);

    let value = retry_with_backoff(&lookup_retry(3), || async move {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(anyhow!("connection reset"))
        } else {
            Ok(42)
        }
    })
    .await?;

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    Ok(())
}

/// Test: The last error is returned once the budget is spent
#[tokio::test]
async fn test_budget_exhaustion_returns_last_error() -> Result<()> {
    let calls = &AtomicU32::new(0);

    let err = assert_err!(
        retry_with_backoff(&lookup_retry(3), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(anyhow!("attempt {} failed", n))
        })
        .await
    );

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.to_string(), "attempt 3 failed");

    Ok(())
}

/// Test: Waits between attempts follow the exponential schedule
#[tokio::test]
async fn test_waits_follow_exponential_schedule() -> Result<()> {
    let start = Instant::now();

    let _ = retry_with_backoff(&lookup_retry(3), || async {
        Err::<(), _>(anyhow!("down"))
    })
    .await;

    // 20ms then 40ms, each within ten percent jitter.
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(54),
        "retries returned too early: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(1000),
        "retries took too long: {:?}",
        elapsed
    );

    Ok(())
}

/// Test: A single-attempt budget never sleeps
#[tokio::test]
async fn test_single_attempt_does_not_wait() -> Result<()> {
    let start = Instant::now();

    let _ = retry_with_backoff(&lookup_retry(1), || async {
        Err::<(), _>(anyhow!("down"))
    })
    .await;

    assert!(start.elapsed() < Duration::from_millis(20));

    Ok(())
}

/// Test: Jitter stays within ten percent of the base delay
#[test]
fn test_jitter_bounds() {
    let base = Duration::from_millis(1000);

    for _ in 0..200 {
        let jittered = with_jitter(base);
        assert!(jittered >= Duration::from_millis(900), "{:?}", jittered);
        assert!(jittered <= Duration::from_millis(1100), "{:?}", jittered);
    }
}

/// Test: The default delivery schedule waits 2s then 4s between attempts
#[test]
fn test_default_delivery_schedule() {
    let config = RetryConfig::default();

    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.backoff_for(1), Duration::from_secs(2));
    assert_eq!(config.backoff_for(2), Duration::from_secs(4));
}

/// Test: The rate limiter allows `max` calls per window and identity
#[tokio::test]
async fn test_rate_limit_per_identity() -> Result<()> {
    let store = MemoryStatusStore::new();
    let window = Duration::from_secs(60);

    for _ in 0..3 {
        assert!(assert_ok!(check_rate_limit(&store, "u1", 3, window).await));
    }
    assert!(!assert_ok!(check_rate_limit(&store, "u1", 3, window).await));
    assert!(assert_ok!(check_rate_limit(&store, "u2", 3, window).await));

    Ok(())
}

/// Test: A new window resets the limit
#[tokio::test]
async fn test_rate_limit_window_expires() -> Result<()> {
    let store = MemoryStatusStore::new();
    let window = Duration::from_millis(50);

    assert!(check_rate_limit(&store, "u1", 1, window).await?);
    assert!(!check_rate_limit(&store, "u1", 1, window).await?);

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(check_rate_limit(&store, "u1", 1, window).await?);

    Ok(())
}

/// Test: The rate limiter surfaces store outages to the caller
#[tokio::test]
async fn test_rate_limit_store_outage() -> Result<()> {
    let store = MemoryStatusStore::new();
    store.set_available(false);

    assert_err!(check_rate_limit(&store, "u1", 3, Duration::from_secs(60)).await);

    Ok(())
}
