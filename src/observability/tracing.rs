use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "recsys-worker";

/// Provider kept for flushing on shutdown; `None` when export is disabled.
static TRACER_PROVIDER: OnceCell<Option<SdkTracerProvider>> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracingSettings<'a> {
    pub otlp_endpoint: Option<&'a str>,
    pub sampling_ratio: f64,
}

impl Default for TracingSettings<'_> {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            sampling_ratio: 1.0,
        }
    }
}

/// Installs the global subscriber once: JSON lines filtered by `RUST_LOG`
/// (default `info`), plus OTLP span export when an endpoint is configured.
/// An exporter that fails to build leaves logging in place.
///
/// # Errors
/// Fails when another global subscriber is already installed.
pub fn init(settings: &TracingSettings<'_>) -> Result<()> {
    TRACER_PROVIDER.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();

        let exporter = settings
            .otlp_endpoint
            .filter(|endpoint| !endpoint.is_empty())
            .map(|endpoint| build_provider(endpoint, settings.sampling_ratio));
        let (provider, export_error) = match exporter {
            Some(Ok(provider)) => (Some(provider), None),
            Some(Err(error)) => (None, Some(error)),
            None => (None, None),
        };
        let otel_layer = provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()
            .map_err(|e| Error::msg(e.to_string()))?;

        match &export_error {
            Some(error) => warn!(error = %format!("{error:#}"), "span export disabled, exporter failed to build"),
            None => info!(
                otel_enabled = provider.is_some(),
                sampling_ratio = settings.sampling_ratio,
                "tracing initialized"
            ),
        }
        if let Some(provider) = &provider {
            global::set_tracer_provider(provider.clone());
        }
        Ok::<_, Error>(provider)
    })?;
    Ok(())
}

fn build_provider(endpoint: &str, sampling_ratio: f64) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio.clamp(0.0, 1.0)))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}

/// Flushes buffered spans. No-op when export was never enabled.
pub fn shutdown() {
    if let Some(Some(provider)) = TRACER_PROVIDER.get() {
        if let Err(error) = provider.shutdown() {
            warn!(error = %error, "failed to flush spans on shutdown");
        }
    }
}
