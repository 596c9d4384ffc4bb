//! Gateway shared state.

use std::sync::Arc;

use voice_relay_core::config::Config;

use crate::registry::SessionRegistry;
use crate::session::SessionServices;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub services: SessionServices,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, services: SessionServices) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            services,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Expose `/metrics` with this recorder handle.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Greeting spoken to every new connection.
    pub fn welcome_message(&self) -> String {
        self.config.welcome_message().to_string()
    }
}
