//! OpenTelemetry wiring for distributed tracing
//!
//! Spans emitted through `tracing` are exported over OTLP/gRPC when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set. The exporter reads the endpoint and
//! headers from the standard OTEL environment variables.

use opentelemetry::KeyValue;
use opentelemetry_sdk::{trace, Resource};
use tracing::{error, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

pub const SERVICE_NAME: &str = "openldap-operator";

/// Build the OpenTelemetry layer for the given subscriber.
///
/// Returns `None` if the OTLP pipeline cannot be installed; the operator keeps
/// running with stdout logging only.
pub fn init_telemetry<S>(_subscriber: &S) -> Option<OpenTelemetryLayer<S, trace::Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(opentelemetry_sdk::runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            error!("Failed to install OTLP pipeline: {:?}", e);
            None
        }
    }
}

/// Flush and shut down the global tracer provider
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
