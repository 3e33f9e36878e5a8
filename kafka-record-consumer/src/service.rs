use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::ClientConfig;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ConsumerError;
use crate::kafka::config::ConsumerSettings;
use crate::kafka::facade::ConsumerListener;
use crate::kafka::fetch_records::FetchRecords;
use crate::kafka::offset_repository::{FileOffsetRepository, OffsetRepository};
use crate::kafka::record_processor::{ExceptionHandler, Processor};

/// Runs `consumers_count` record consumers of one group side by side.
///
/// Every consumer owns its own client and commit bookkeeping; they only share
/// the processor, the exception handler and the offset repository.
pub struct KafkaRecordConsumerService {
    group_id: String,
    settings: ConsumerSettings,
    client_config: ClientConfig,
    processor: Arc<dyn Processor>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    offset_repository: Option<Arc<dyn OffsetRepository>>,
    listener: Option<Arc<dyn ConsumerListener>>,
    shutdown: CancellationToken,
}

impl KafkaRecordConsumerService {
    /// Create the service from environment configuration
    pub fn new(config: Config, processor: Arc<dyn Processor>) -> Result<Self> {
        let settings = config
            .to_settings()
            .context("Invalid record consumer configuration")?;
        let group_id = config.group_id();
        let client_config = config.to_client_config(&group_id);

        let offset_repository = match config.offset_repository_path() {
            Some(path) => {
                let repository = FileOffsetRepository::open(&path).with_context(|| {
                    format!("Failed to open offset repository at {}", path.display())
                })?;
                let repository: Arc<dyn OffsetRepository> = Arc::new(repository);
                Some(repository)
            }
            None => None,
        };

        Ok(Self::from_settings(group_id, settings, client_config, processor)?
            .with_offset_repository(offset_repository))
    }

    /// Create the service from already resolved settings
    pub fn from_settings(
        group_id: impl Into<String>,
        settings: ConsumerSettings,
        client_config: ClientConfig,
        processor: Arc<dyn Processor>,
    ) -> Result<Self> {
        settings
            .validate()
            .context("Invalid record consumer settings")?;

        Ok(Self {
            group_id: group_id.into(),
            settings,
            client_config,
            processor,
            exception_handler: None,
            offset_repository: None,
            listener: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn with_offset_repository(mut self, repository: Option<Arc<dyn OffsetRepository>>) -> Self {
        self.offset_repository = repository;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ConsumerListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Cancelling this token stops every consumer of the service
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The consumers this service runs, one per `consumers_count`
    pub fn fetch_records(&self) -> Vec<FetchRecords> {
        (0..self.settings.consumers_count)
            .map(|index| {
                let mut fetch = FetchRecords::new(
                    format!("{}-{}", self.group_id, index),
                    self.settings.clone(),
                    self.client_config.clone(),
                    self.processor.clone(),
                    self.shutdown.clone(),
                )
                .with_offset_repository(self.offset_repository.clone())
                .with_listener(self.listener.clone());

                if let Some(handler) = &self.exception_handler {
                    fetch = fetch.with_exception_handler(handler.clone());
                }
                fetch
            })
            .collect()
    }

    /// Run the service (blocking until ctrl+c)
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = ?e, "Failed to listen for ctrl+c signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the service until `shutdown_signal` resolves, the shutdown token is
    /// cancelled, or every consumer has stopped on its own.
    ///
    /// A consumer failing to start shuts the whole service down, and its
    /// error is returned once the others have finished.
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<()> {
        info!(
            group_id = %self.group_id,
            topic = %self.settings.topic,
            consumers = self.settings.consumers_count,
            "Starting record consumers"
        );

        let mut consumers = JoinSet::new();
        for fetch in self.fetch_records() {
            consumers.spawn(fetch.run());
        }

        let mut first_error: Option<anyhow::Error> = None;
        tokio::pin!(shutdown_signal);

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Received shutdown signal, shutting down gracefully...");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, shutting down gracefully...");
                    break;
                }
                joined = consumers.join_next() => match joined {
                    Some(result) => {
                        if record_exit(result, &mut first_error) {
                            break;
                        }
                    }
                    None => {
                        info!("All record consumers stopped");
                        break;
                    }
                },
            }
        }

        self.shutdown.cancel();

        let drain = async {
            while let Some(result) = consumers.join_next().await {
                record_exit(result, &mut first_error);
            }
        };
        let timed_out = tokio::time::timeout(self.settings.shutdown_timeout, drain)
            .await
            .is_err();
        if timed_out {
            warn!(
                "Record consumer shutdown timed out after {:?}, aborting remaining consumers",
                self.settings.shutdown_timeout
            );
            consumers.abort_all();
        }

        info!("Record consumer service stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Log how a consumer task ended. Returns true when it ended in failure.
fn record_exit(
    result: Result<Result<(), ConsumerError>, JoinError>,
    first_error: &mut Option<anyhow::Error>,
) -> bool {
    let failure = match result {
        Ok(Ok(())) => return false,
        Ok(Err(e)) => anyhow::Error::new(e).context("Record consumer failed"),
        Err(e) => anyhow::Error::new(e).context("Record consumer task panicked or was aborted"),
    };

    error!(error = ?failure, "Record consumer exited with an error");
    first_error.get_or_insert(failure);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingProcessor;
    use std::collections::HashMap;
    use envconfig::Envconfig;

    fn config(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_one_fetch_records_per_consumer() {
        let service = KafkaRecordConsumerService::new(
            config(&[("KAFKA_CONSUMER_GROUP", "billing"), ("CONSUMERS_COUNT", "3")]),
            Arc::new(RecordingProcessor::new()),
        )
        .unwrap();

        let thread_ids: Vec<String> = service
            .fetch_records()
            .iter()
            .map(|fetch| fetch.thread_id().to_string())
            .collect();

        assert_eq!(thread_ids, vec!["billing-0", "billing-1", "billing-2"]);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let result = KafkaRecordConsumerService::new(
            config(&[("CONSUMERS_COUNT", "0")]),
            Arc::new(RecordingProcessor::new()),
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_offset_repository_is_opened_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, r#"{"orders/0": 41}"#).unwrap();

        let service = KafkaRecordConsumerService::new(
            config(&[("OFFSET_REPOSITORY_PATH", path.to_str().unwrap())]),
            Arc::new(RecordingProcessor::new()),
        )
        .unwrap();

        let repository = service.offset_repository.as_ref().unwrap();
        assert_eq!(
            repository
                .offset(&crate::kafka::types::Partition::new("orders", 0))
                .unwrap(),
            Some(41)
        );
    }
}
