//! Tracing initialization for the workflow kernel.
//!
//! Installs a structured `fmt` subscriber for the fields the kernel logs
//! everywhere (`run_id`, `step_id`, `sequence_id`, attempt counters) and,
//! optionally, an OpenTelemetry bridge so run and step spans export as
//! traces.
//!
//! ```no_run
//! // Structured logging only
//! drover_observe::init_tracing(false).unwrap();
//!
//! // With span export to stdout (local development)
//! drover_observe::init_tracing(true).unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Service name stamped on exported spans.
const SERVICE_NAME: &str = "drover";

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVES: &str = "info";

/// Keeps the tracer provider reachable so shutdown can flush it.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// The fmt layer logs with targets and emits span-close events, so every
/// run and step span reports its duration. `RUST_LOG` overrides the
/// default `info` filter. With `enable_otel`, spans additionally export
/// through OpenTelemetry to stdout -- enough for local inspection; a
/// deployment would swap in an OTLP exporter here.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(SERVICE_NAME);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}

/// Flush buffered spans and shut down the exporter pipeline.
///
/// No-op when OpenTelemetry was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(error) = provider.shutdown()
    {
        eprintln!("tracer provider shutdown failed: {error}");
    }
}
