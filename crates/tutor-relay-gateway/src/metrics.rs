//! Prometheus metrics recording and endpoint.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once per process and return the handle
/// for rendering. `None` if another recorder is already installed.
pub fn install_prometheus_recorder() -> Option<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(HANDLE.get_or_init(|| handle).clone()),
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {e}");
            None
        }
    }
}

/// Record a new client session.
pub fn record_session_open() {
    metrics::gauge!("sessions_active").increment(1.0);
}

/// Record a closed client session.
pub fn record_session_close() {
    metrics::gauge!("sessions_active").decrement(1.0);
}

/// Record a turn starting.
pub fn record_turn() {
    metrics::counter!("turns_total").increment(1);
}

/// Record time from committed transcript to first tutor audio.
pub fn record_first_audio(secs: f64) {
    metrics::histogram!("turn_first_audio_seconds").record(secs);
}

/// Record an upstream failure.
pub fn record_upstream_error(service: &str, kind: &str) {
    let labels = [("service", service.to_string()), ("kind", kind.to_string())];
    metrics::counter!("upstream_errors_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder_is_idempotent() {
        let first = install_prometheus_recorder();
        let second = install_prometheus_recorder();
        assert_eq!(first.is_some(), second.is_some());
    }

    #[test]
    fn test_recorded_metrics_render() {
        let Some(handle) = install_prometheus_recorder() else {
            return;
        };
        record_turn();
        record_upstream_error("Synthesis", "transport");
        let output = handle.render();
        assert!(output.contains("turns_total"));
        assert!(output.contains("upstream_errors_total"));
    }

    #[test]
    fn test_session_gauges_do_not_panic() {
        record_session_open();
        record_session_close();
        record_first_audio(0.42);
    }
}
