//! Tracing bootstrap: console logs always, OTLP span export only when
//! `SQLGATE_OTEL_ENDPOINT` points at a collector.

use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler};
use opentelemetry_sdk::Resource;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Flushes buffered spans on drop. Hold it for the life of the process.
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var("SQLGATE_OTEL_SAMPLING_RATE").ok().as_deref());
    let endpoint = env::var("SQLGATE_OTEL_ENDPOINT").ok();

    let mut exporter_warning = None;
    let tracer_installed = match endpoint {
        Some(endpoint) if sampling_rate > 0.0 => {
            match build_tracer(service_name, &endpoint, sampling_rate) {
                Ok(tracer) => {
                    registry
                        .with(tracing_opentelemetry::layer().with_tracer(tracer))
                        .init();
                    true
                }
                Err(error) => {
                    registry.init();
                    exporter_warning = Some(error);
                    false
                }
            }
        }
        _ => {
            registry.init();
            false
        }
    };

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = exporter_warning {
        warn!(%error, "OTLP exporter unavailable; continuing with console logs only");
    }
    info!(sampling_rate, otel = tracer_installed, "telemetry initialized");

    Ok(TelemetryGuard { tracer_installed })
}

fn build_tracer(service_name: &str, endpoint: &str, sampling_rate: f64) -> Result<trace::Tracer> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_owned(),
                )])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracer)
}

pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some("SQLGATE_OTEL_SAMPLING_RATE is empty; defaulting to 1.0".to_owned()),
        );
    }

    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "SQLGATE_OTEL_SAMPLING_RATE={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "SQLGATE_OTEL_SAMPLING_RATE='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
    }
}
