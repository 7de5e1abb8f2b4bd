//! Admission coordinator driven through its public handle.

use guildboard::coordinator::{
    AdmissionError, CoordinatorConfig, CoordinatorHandle, CoordinatorRegistry, RateLimitHeaders,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_concurrency_never_exceeds_capacity() {
    let handle = CoordinatorHandle::spawn("user:1", CoordinatorConfig::default());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let handle = handle.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let grant = handle.acquire_slot().await;
                assert!(grant.allowed, "caller denied: {:?}", grant.error);

                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                handle.release_slot().await;
            })
        })
        .collect();

    for task in tasks {
        assert_ok!(task.await);
    }

    // Default limit 5 minus the reserve buffer of 2
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let state = handle.get_state().await.unwrap();
    assert_eq!(state.state.active_requests, 0);
    assert_eq!(state.queue_length, 0);
}

#[tokio::test]
async fn test_queue_full_is_reported_as_data() {
    let config = CoordinatorConfig {
        max_queue_size: 2,
        queue_timeout: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    };
    let handle = CoordinatorHandle::spawn("user:1", config);
    for _ in 0..3 {
        assert!(handle.acquire_slot().await.allowed);
    }

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.acquire_slot().await })
        })
        .collect();
    while handle.get_state().await.unwrap().queue_length < 2 {
        tokio::task::yield_now().await;
    }

    let rejected = handle.acquire_slot().await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.error, Some(AdmissionError::QueueFull));
    assert!(rejected.wait_ms.is_some());

    // Fresh quota admits both waiters in order
    handle
        .update_from_response(RateLimitHeaders {
            limit: Some("10".to_string()),
            remaining: Some("10".to_string()),
            ..Default::default()
        })
        .await;
    for waiter in waiters {
        assert!(waiter.await.unwrap().allowed);
    }
}

#[tokio::test]
async fn test_rate_limited_scope_waits_for_reset() {
    let config = CoordinatorConfig {
        queue_timeout: Duration::from_millis(100),
        ..CoordinatorConfig::default()
    };
    let handle = CoordinatorHandle::spawn("user:1", config);
    handle.handle_rate_limited(30.0).await;

    let grant = handle.acquire_slot().await;
    assert!(!grant.allowed);
    assert_eq!(grant.error, Some(AdmissionError::QueueTimeout));
    // Wait hint points at the reset, roughly 30 s out
    let wait_ms = grant.wait_ms.unwrap();
    assert!(wait_ms > 29_000 && wait_ms <= 30_000);
}

#[tokio::test]
async fn test_scopes_are_independent() {
    let registry = CoordinatorRegistry::new(CoordinatorConfig::default());
    registry.for_scope("user:1").handle_rate_limited(30.0).await;

    assert!(registry.for_scope("user:2").acquire_slot().await.allowed);
    let blocked = registry.state_of("user:1").await.unwrap();
    assert_eq!(blocked.effective_remaining, 0);
}
