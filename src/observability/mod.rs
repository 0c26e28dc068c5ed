pub mod metrics;
pub mod tracing;

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;
use self::tracing::TracingSettings;
use crate::config::Config;

/// Process-wide metrics registry plus the worker's collectors.
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// Initializes tracing from `config` and registers the worker metrics.
    ///
    /// # Errors
    /// Fails when the subscriber cannot be installed or a metric fails to register.
    pub fn new(config: &Config) -> Result<Self> {
        tracing::init(&TracingSettings {
            otlp_endpoint: config.otel_exporter_endpoint(),
            sampling_ratio: config.otel_sampling_ratio(),
        })?;
        Self::without_tracing()
    }

    /// Registers the worker metrics on a fresh registry, leaving tracing alone.
    ///
    /// # Errors
    /// Fails when a metric fails to register.
    pub fn without_tracing() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn record_ready_probe(&self) {
        ::tracing::debug!("service ready probe");
    }

    pub fn record_live_probe(&self) {
        ::tracing::debug!("service live probe");
    }

    /// Renders the registry in the Prometheus text format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}
