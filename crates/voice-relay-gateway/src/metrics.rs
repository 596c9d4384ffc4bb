//! Prometheus metrics recording and endpoint.
//!
//! Recording functions compile to no-ops unless the `metrics` feature is on.

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
#[cfg(feature = "metrics")]
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a new voice session.
pub fn record_session_opened() {
    #[cfg(feature = "metrics")]
    metrics::gauge!("voice_sessions_active").increment(1.0);
}

/// Record a voice session ending.
pub fn record_session_closed() {
    #[cfg(feature = "metrics")]
    metrics::gauge!("voice_sessions_active").decrement(1.0);
}

/// Record a completed caller utterance handed to the engine.
pub fn record_utterance() {
    #[cfg(feature = "metrics")]
    metrics::counter!("utterances_total").increment(1);
}

/// Record how a synthesis relay ended (`completed`, `failed`, `cancelled`).
pub fn record_synthesis(outcome: &str) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("outcome", outcome.to_string())];
        metrics::counter!("synthesis_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    #[cfg(feature = "metrics")]
    {
        let labels = [("kind", kind.to_string())];
        metrics::counter!("errors_total", &labels).increment(1);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}
