use tracing_error::ErrorLayer;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

#[cfg(feature = "telemetry")]
mod telemetry {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{
        runtime,
        trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer},
        Resource,
    };
    use opentelemetry_semantic_conventions::{
        resource::{SERVICE_NAME, SERVICE_VERSION},
        SCHEMA_URL,
    };

    // Describes this relay in every exported span.
    fn resource() -> Resource {
        Resource::from_schema_url(
            [
                KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            ],
            SCHEMA_URL,
        )
    }

    pub fn init_tracer() -> Result<Tracer, opentelemetry::trace::TraceError> {
        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default()
                    .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(resource()),
            )
            .with_batch_config(BatchConfig::default())
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .install_batch(runtime::Tokio)
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` controls the console output and defaults to `info`.
pub fn init_tracing_subscriber() -> eyre::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    #[cfg(not(feature = "tokio-console"))]
    let console_layer = tracing_subscriber::layer::Identity::new();

    #[cfg(feature = "tokio-console")]
    let console_layer = console_subscriber::ConsoleLayer::builder()
        .with_default_env()
        .spawn();

    #[cfg(not(feature = "telemetry"))]
    let telemetry_layer = tracing_subscriber::layer::Identity::new();

    #[cfg(feature = "telemetry")]
    let telemetry_layer = tracing_opentelemetry::OpenTelemetryLayer::new(telemetry::init_tracer()?)
        .with_filter(
            tracing_subscriber::filter::Targets::new()
                .with_target("tcprelay", tracing::level_filters::LevelFilter::TRACE),
        );

    tracing_subscriber::Registry::default()
        .with(ErrorLayer::default())
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .with(console_layer)
        .with(telemetry_layer)
        .try_init()?;

    Ok(())
}
