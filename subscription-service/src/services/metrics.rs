use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once in a process
/// (test harnesses spawn several applications); later calls are no-ops.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(e) => {
            tracing::debug!(error = %e, "Prometheus recorder already installed");
        }
    }
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Count a webhook delivery by its reconciliation disposition.
pub fn record_webhook_event(disposition: &str) {
    counter!("webhook_events_total", "disposition" => disposition.to_string()).increment(1);
}

/// Count a subscription activation by plan.
pub fn record_activation(plan_slug: &str) {
    counter!("subscriptions_activated_total", "plan" => plan_slug.to_string()).increment(1);
}

/// Count a forward transition made by the expiry sweep.
pub fn record_sweep_transition(kind: &'static str) {
    counter!("sweep_transitions_total", "kind" => kind).increment(1);
}
