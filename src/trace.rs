use std::sync::Once;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

const SERVICE_NAME: &str = "gpugate";

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber once: a compact or JSON fmt layer filtered by
/// `RUST_LOG` (default `info`), plus OTLP trace export when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => init_with_fmt_layer(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .compact()
                    .with_filter(env_filter),
            ),
            LogFormat::Json => init_with_fmt_layer(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .json()
                    .with_filter(env_filter),
            ),
        };
        init_result = Some(result);
    });
    init_result.unwrap_or(Ok(()))
}

fn init_with_fmt_layer<L>(fmt_layer: L) -> anyhow::Result<()>
where
    L: tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync + 'static,
{
    let base = tracing_subscriber::registry().with(fmt_layer);

    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        base.try_init()?;
        return Ok(());
    };
    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            sdktrace::Config::default()
                .with_resource(Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)])),
        )
        .install_batch(runtime::Tokio)
    {
        Ok(tracer) => {
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            base.with(otel_layer).try_init()?;
        }
        Err(err) => {
            eprintln!("otlp init failed, falling back to fmt: {err}");
            base.try_init()?;
        }
    }
    Ok(())
}

/// Flush the OTLP exporter if one was installed.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Run an async test body with tracing installed. Used by `#[gpugate::test]`.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    // Another harness may already own the global subscriber
    let _ = init(LogFormat::Text);
    tracing::debug!(test = test_name, "starting test");
    f().await
}

/// Synchronous counterpart of [`with_test_tracing`].
pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text);
    tracing::debug!(test = test_name, "starting test");
    f()
}
