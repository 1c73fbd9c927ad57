//! Tracing setup for host applications
//!
//! Every invocation runs inside an `invocation` span carrying its id and mode;
//! callback requests and agent stream drains are child spans. With
//! [`init_tracing`] those spans are exported over OTLP, so one trace shows the
//! agent spawn, each tool call it made, and the final resolution.
//!
//! ```text
//! host app → OTLP (gRPC) → collector → trace backend
//!     │
//!     └─ AGENTBRIDGE_INVOCATION_ID ─► agent process (for log correlation)
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default OTLP endpoint (local collector)
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Filter used when `RUST_LOG` is not set
const DEFAULT_FILTER: &str = "info,agentbridge=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install console logging plus OpenTelemetry export
///
/// Must be called from inside a tokio runtime (the batch exporter spawns on it).
///
/// # Example
/// ```ignore
/// agentbridge::tracing::init_tracing("checkout-service", None)?;
/// ```
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let endpoint = otlp_endpoint.unwrap_or(DEFAULT_OTLP_ENDPOINT);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("agentbridge.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)?;

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        service = service_name,
        endpoint = endpoint,
        "OpenTelemetry tracing initialized"
    );

    Ok(())
}

/// Install console logging only
///
/// Logs go to stderr so they never mix with a program's own stdout. Returns
/// an error if a global subscriber is already set.
pub fn init_console_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()?;
    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("OpenTelemetry tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
        assert!(DEFAULT_OTLP_ENDPOINT.starts_with("http://"));
    }
}
