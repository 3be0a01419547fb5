//! Coordination store outage during announce: the operation retries per
//! backoff policy, fails with a registration error once the budget is
//! exhausted, and leaves no partial registration behind.

use std::sync::Arc;
use std::time::Duration;

use farol_common::{FarolError, RetryPolicy};
use farol_coordination::CoordinationHub;
use farol_discovery::DiscoveryRegistry;
use farol_integration_tests::{init_tracing, wait_for_size};

#[tokio::test(flavor = "multi_thread")]
async fn test_announce_under_outage_fails_cleanly() {
    init_tracing();

    let hub = CoordinationHub::new();
    let registry = DiscoveryRegistry::with_retry_policy(
        Arc::new(hub.connect()),
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 10,
            max_delay_ms: 50,
            ..Default::default()
        },
    );

    hub.set_unavailable(true);

    let started = tokio::time::Instant::now();
    let err = registry
        .announce("service", "127.0.0.1", 12345)
        .await
        .unwrap_err();
    assert!(matches!(err, FarolError::Registration(_)));
    // the budget was actually spent on backoff, not failed fast
    assert!(started.elapsed() >= Duration::from_millis(20));

    hub.set_unavailable(false);

    // no partial or duplicate registration was left behind
    let view = registry.discover("service").await.unwrap();
    assert!(view.is_empty());

    // the same endpoint can be announced normally once the store is back
    let handle = registry.announce("service", "127.0.0.1", 12345).await.unwrap();
    assert!(wait_for_size(&view, 1, Duration::from_secs(5)).await);

    handle.cancel();
    assert!(
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if view.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outage_healing_within_budget_is_invisible() {
    init_tracing();

    let hub = CoordinationHub::new();
    let registry = DiscoveryRegistry::with_retry_policy(
        Arc::new(hub.connect()),
        RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 10,
            max_delay_ms: 100,
            ..Default::default()
        },
    );

    // outage that heals within the retry budget
    hub.set_unavailable(true);
    let hub_clone = hub.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        hub_clone.set_unavailable(false);
    });

    // the announce rides out the outage without surfacing the failure
    registry.announce("service", "127.0.0.1", 9000).await.unwrap();
    let view = registry.discover("service").await.unwrap();
    assert_eq!(view.len(), 1);
}
