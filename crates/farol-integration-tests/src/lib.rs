//! Shared helpers for Farol integration tests

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::sync::mpsc;

use farol_api::DiscoveryEvent;
use farol_discovery::{FnChangeListener, ServiceDiscovered};

/// Initialize tracing once for the whole test binary.
///
/// Controlled by `RUST_LOG`; silent by default.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Wait until the discovered set reaches `expected` endpoints, driven by
/// change notifications rather than polling. Returns false on timeout.
pub async fn wait_for_size(view: &ServiceDiscovered, expected: usize, timeout: Duration) -> bool {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let initial_tx = tx.clone();
    let handle = view.watch_changes(Arc::new(FnChangeListener::new(
        move |event: &DiscoveryEvent| {
            let _ = initial_tx.send(event.endpoints.len());
        },
    )));
    drop(tx);

    let deadline = tokio::time::Instant::now() + timeout;
    let reached = loop {
        if view.len() >= expected {
            break true;
        }
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(size)) if size >= expected => break true,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break false,
        }
    };

    handle.cancel();
    reached
}

#[cfg(test)]
mod tests {
    use farol_coordination::CoordinationHub;
    use farol_discovery::DiscoveryRegistry;

    use super::*;

    #[tokio::test]
    async fn test_wait_for_size() {
        let hub = CoordinationHub::new();
        let registry = DiscoveryRegistry::new(Arc::new(hub.connect()));
        let view = registry.discover("svc").await.unwrap();

        assert!(!wait_for_size(&view, 1, Duration::from_millis(100)).await);

        registry.announce("svc", "127.0.0.1", 1).await.unwrap();
        assert!(wait_for_size(&view, 1, Duration::from_secs(5)).await);
    }
}
