use actix_web::{App, HttpServer};
use anyhow::Context;
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use paperclip::actix::{web, OpenApiExt};
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use bookservice_books::app_config::{config_app, json_config, query_config};
use bookservice_books::service::BookService;
use bookservice_books::settings::Settings;
use bookservice_books::storage::init_storage;

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry(app_name: &str) {
    // Spans are exported to the Jaeger agent in batches
    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("bookservice_books");

    let settings = Settings::load().context("Failed to load settings")?;
    tracing::info!(
        "Starting {} {} in {:?} mode at http://{}:{}",
        settings.service_name,
        settings.version,
        settings.environment,
        settings.http_host,
        settings.http_port
    );

    let storage = init_storage(&settings)
        .await
        .context("Failed to init storage")?;
    let service = BookService::new(storage.clone());

    // Storage and tracing are shut down whether or not the server failed
    let result: std::io::Result<()> = async {
        HttpServer::new(move || {
            App::new()
                .wrap_api()
                .app_data(web::Data::new(service.clone()))
                .app_data(json_config())
                .app_data(query_config())
                .wrap(TracingLogger::default())
                .configure(config_app)
                .with_json_spec_at("/apispec/v2")
                .build()
        })
        .bind((settings.http_host.as_str(), settings.http_port))?
        .run()
        .await
    }
    .await;
    if let Err(err) = &result {
        tracing::error!("Http server failed {}", err);
    }

    storage.close();
    global::shutdown_tracer_provider();
    Ok(result?)
}
