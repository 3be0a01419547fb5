//! Prometheus metrics for the discovery registry

use std::sync::LazyLock;

use prometheus::{CounterVec, GaugeVec, register_counter_vec, register_gauge_vec};

/// Discovery metrics collector
pub struct DiscoveryMetrics {
    /// Announce attempts by service and outcome
    pub announcements: CounterVec,

    /// Withdrawals (cancelled announcements) by service
    pub withdrawals: CounterVec,

    /// Current endpoint count per watched service
    pub endpoints: GaugeVec,

    /// Change notification batches published per service
    pub notifications: CounterVec,
}

static METRICS: LazyLock<DiscoveryMetrics> = LazyLock::new(|| DiscoveryMetrics {
    announcements: register_counter_vec!(
        "farol_announcements_total",
        "Total announce attempts",
        &["service", "status"]
    )
    .expect("register farol_announcements_total"),
    withdrawals: register_counter_vec!(
        "farol_withdrawals_total",
        "Total withdrawn announcements",
        &["service"]
    )
    .expect("register farol_withdrawals_total"),
    endpoints: register_gauge_vec!(
        "farol_discovered_endpoints",
        "Current endpoint count per watched service",
        &["service"]
    )
    .expect("register farol_discovered_endpoints"),
    notifications: register_counter_vec!(
        "farol_change_notifications_total",
        "Change notification batches published",
        &["service"]
    )
    .expect("register farol_change_notifications_total"),
});

/// The process-wide discovery metrics.
pub fn metrics() -> &'static DiscoveryMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let m = metrics();
        m.announcements.with_label_values(&["web", "ok"]).inc();
        m.endpoints.with_label_values(&["web"]).set(2.0);
        // second access reuses the same registration
        let again = metrics();
        again.announcements.with_label_values(&["web", "ok"]).inc();
    }
}
