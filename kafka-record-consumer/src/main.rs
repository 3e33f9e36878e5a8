use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{routing::get, Router};
use futures::future::ready;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_record_consumer::config::Config;
use kafka_record_consumer::metrics::{serve, setup_metrics_routes};
use kafka_record_consumer::{Exchange, KafkaRecordConsumerService, Processor};

pub async fn index() -> &'static str {
    "kafka record consumer"
}

/// Logs every record it receives; stands in for real processing logic
struct LoggingProcessor;

#[async_trait]
impl Processor for LoggingProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        info!(
            topic = exchange.topic(),
            partition = exchange.partition().partition_number(),
            offset = exchange.offset(),
            body_bytes = exchange.body.as_ref().map_or(0, Vec::len),
            headers = exchange.headers.len(),
            "Received record"
        );
        Ok(())
    }
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router).context("Failed to install metrics recorder")?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, "Failed to start serving metrics");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Kafka record consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let service = KafkaRecordConsumerService::new(config, Arc::new(LoggingProcessor))
        .context("Failed to create Kafka record consumer service")?;

    // Run the service (this blocks until shutdown)
    let result = service.run().await;

    server_handle.abort();

    result
}
