//! # Telemetry
//!
//! Console logging is always on. Metrics are optional.
//!
//! - Logs: `tracing_subscriber::fmt`, filtered by `RUST_LOG` (default
//!   `info`). Set `RUST_LOG=ballast=trace` to see every dispatch and the pool
//!   load after each event.
//! - `metrics`: OpenTelemetry counters and histograms, exported to stdout
//!   every few seconds.
//!
//! ```bash
//! cargo run -p ballast-sim --features metrics
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Histogram, Meter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops every exporter. Errors are reported on stderr since
    /// the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder("ballast")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
    }

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("ballast-sim")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let exporter = opentelemetry_stdout::MetricExporter::default();
    let reader = sdkmetrics::PeriodicReader::builder(exporter)
        .with_interval(std::time::Duration::from_secs(5))
        .build();

    sdkmetrics::SdkMeterProvider::builder()
        .with_resource(resource())
        .with_reader(reader)
        .build()
}

#[cfg(feature = "metrics")]
static REQUESTS_SUBMITTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_COMPLETED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_FAILED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_LATENCY_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = REQUESTS_SUBMITTED.set(
        meter
            .u64_counter("requests_submitted")
            .with_description("Requests accepted by the balancer")
            .build(),
    );

    let _ = REQUESTS_COMPLETED.set(
        meter
            .u64_counter("requests_completed")
            .with_description("Requests that returned a value")
            .build(),
    );

    let _ = REQUESTS_FAILED.set(
        meter
            .u64_counter("requests_failed")
            .with_description("Requests rejected, faulted or cut off by shutdown")
            .build(),
    );

    let _ = REQUEST_LATENCY_MS.set(
        meter
            .f64_histogram("request_latency")
            .with_unit("ms")
            .with_description("Submit to reply latency")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_requests_submitted() {
    if let Some(counter) = REQUESTS_SUBMITTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_submitted() {}

#[cfg(feature = "metrics")]
pub fn increment_requests_completed() {
    if let Some(counter) = REQUESTS_COMPLETED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_completed() {}

#[cfg(feature = "metrics")]
pub fn increment_requests_failed(reason: &'static str) {
    if let Some(counter) = REQUESTS_FAILED.get() {
        counter.add(1, &[KeyValue::new("reason", reason)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_failed(_reason: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_request_latency(latency_ms: f64) {
    if let Some(histogram) = REQUEST_LATENCY_MS.get() {
        histogram.record(latency_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_latency(_latency_ms: f64) {}
