use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, RebalanceProtocol};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::kafka::types::partitions_from_list;
use crate::metrics_consts::REBALANCE_EMPTY_SKIPPED;

/// rdkafka context forwarding rebalance callbacks to a [`RebalanceHandler`].
///
/// Start positions of newly assigned partitions are written into the
/// assignment before it is applied. A seek from the assign callback would
/// fail: librdkafka has not started fetching the partition yet.
pub struct PipelineConsumerContext {
    rebalance_handler: Arc<dyn RebalanceHandler>,
}

impl PipelineConsumerContext {
    pub fn new(rebalance_handler: Arc<dyn RebalanceHandler>) -> Self {
        Self { rebalance_handler }
    }

    fn apply_start_positions(&self, tpl: &mut TopicPartitionList) {
        if tpl.count() == 0 {
            return;
        }

        let partitions = partitions_from_list(tpl);
        for (partition, target) in self.rebalance_handler.start_positions(&partitions) {
            if let Err(e) = tpl.set_partition_offset(
                partition.topic(),
                partition.partition_number(),
                target.into(),
            ) {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    start = ?target,
                    error = %e,
                    "Failed to set start position of assigned partition"
                );
            }
        }
    }

    fn unassign(
        &self,
        base_consumer: &BaseConsumer<Self>,
        tpl: &TopicPartitionList,
        cooperative: bool,
    ) {
        let unassigned = if cooperative {
            base_consumer.incremental_unassign(tpl)
        } else {
            base_consumer.unassign()
        };
        if let Err(e) = unassigned {
            error!("Failed to revoke partition assignment: {}", e);
        }
    }
}

impl ClientContext for PipelineConsumerContext {}

impl ConsumerContext for PipelineConsumerContext {
    fn rebalance(
        &self,
        base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        let cooperative = matches!(
            base_consumer.rebalance_protocol(),
            RebalanceProtocol::Cooperative
        );

        match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                self.apply_start_positions(tpl);
                let tpl: &TopicPartitionList = tpl;

                let rebalance = Rebalance::Assign(tpl);
                self.pre_rebalance(base_consumer, &rebalance);
                let assigned = if cooperative {
                    base_consumer.incremental_assign(tpl)
                } else {
                    base_consumer.assign(tpl)
                };
                if let Err(e) = assigned {
                    error!("Failed to apply partition assignment: {}", e);
                }
                self.post_rebalance(base_consumer, &rebalance);
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                let tpl: &TopicPartitionList = tpl;
                let rebalance = Rebalance::Revoke(tpl);
                self.pre_rebalance(base_consumer, &rebalance);
                self.unassign(base_consumer, tpl, cooperative);
                self.post_rebalance(base_consumer, &rebalance);
            }
            _ => {
                let tpl: &TopicPartitionList = tpl;
                let code: RDKafkaErrorCode = err.into();
                let rebalance = Rebalance::Error(KafkaError::Rebalance(code));
                self.pre_rebalance(base_consumer, &rebalance);
                self.unassign(base_consumer, tpl, cooperative);
                self.post_rebalance(base_consumer, &rebalance);
            }
        }
    }

    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends these on every group membership change
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance (cooperative-sticky no-op)");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke")
                        .increment(1);
                    return;
                }

                info!("Revoking {} partitions", partitions.count());
                self.rebalance_handler
                    .on_partitions_revoked(base_consumer, &partitions_from_list(partitions));
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance (cooperative-sticky no-op)");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign")
                        .increment(1);
                    return;
                }

                info!("Assigned {} partitions", partitions.count());
                self.rebalance_handler
                    .on_partitions_assigned(base_consumer, &partitions_from_list(partitions));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}
