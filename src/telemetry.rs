use std::env;

use clap::ValueEnum;
use opentelemetry::global;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Simple,
}

/// Install the global subscriber. Spans are exported to Jaeger only when an
/// endpoint is given.
pub fn init(
    service_name: &str,
    format: LogFormat,
    jaeger_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = match jaeger_endpoint {
        Some(endpoint) => {
            // The isahc collector would otherwise route through the proxy
            env::remove_var("http_proxy");
            env::remove_var("https_proxy");
            env::remove_var("HTTP_PROXY");
            env::remove_var("HTTPS_PROXY");

            global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(endpoint)
                .with_service_name(service_name)
                .with_isahc()
                .with_timeout(std::time::Duration::from_secs(2))
                .install_batch(opentelemetry::runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let filter_layer =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let (json_layer, plain_layer) = match format {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Simple => (None, Some(fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(telemetry)
        .with(filter_layer)
        .with(json_layer)
        .with(plain_layer)
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}
