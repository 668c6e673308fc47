use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use common_health::HealthHandle;
use rdkafka::consumer::{
    Consumer, ConsumerContext, ConsumerGroupMetadata, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Message, TopicPartitionList};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};

/// librdkafka does not expose the consumer group's generation id as a plain
/// getter; the only way to observe it is via the rebalance callbacks fired
/// on a `ConsumerContext`. `GenerationTracker` records the generation id of
/// the most recent `Assign` rebalance so callers can compare it against a
/// generation id stamped on previously-consumed messages, per the
/// exactly-once rebalance check.
#[derive(Clone, Default)]
pub struct GenerationTracker {
    generation: Arc<AtomicI32>,
}

impl GenerationTracker {
    pub fn current(&self) -> i32 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TrackingContext {
    liveness: Option<HealthHandle>,
    generation: GenerationTracker,
}

impl TrackingContext {
    pub fn new(liveness: Option<HealthHandle>) -> Self {
        Self {
            liveness,
            generation: GenerationTracker::default(),
        }
    }

    pub fn generation_tracker(&self) -> GenerationTracker {
        self.generation.clone()
    }
}

impl ClientContext for TrackingContext {
    fn stats(&self, _: rdkafka::Statistics) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }
    }
}

impl ConsumerContext for TrackingContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        info!("pre rebalance: {:?}", rebalance);
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        info!("post rebalance: {:?}", rebalance);
        if let Rebalance::Assign(_) = rebalance {
            // Every rebalance that (re)assigns partitions to this member
            // starts a new generation of the consumer group.
            self.generation.bump();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Received empty payload")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

struct Inner {
    consumer: StreamConsumer<TrackingContext>,
    topic: String,
}

/// A consumer bound to a single topic, with manual offset storage: the
/// connector's `TransactionCoordinator` is responsible for committing
/// offsets as part of a broker transaction rather than letting the consumer
/// auto-commit them.
#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
    generation: GenerationTracker,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
        liveness: Option<HealthHandle>,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.offset.store", "false")
            .set(
                "enable.auto.commit",
                consumer_config.kafka_consumer_auto_commit.to_string(),
            );

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let context = TrackingContext::new(liveness);
        let generation = context.generation_tracker();

        let consumer: StreamConsumer<TrackingContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: consumer_config.kafka_consumer_topic,
            }),
            generation,
        })
    }

    /// The generation id assigned by the last rebalance that handed this
    /// consumer a partition assignment.
    pub fn current_generation(&self) -> i32 {
        self.generation.current()
    }

    pub fn group_metadata(&self) -> ConsumerGroupMetadata {
        self.inner.consumer.group_metadata()
    }

    pub async fn json_recv<T>(&self) -> Result<(T, Offset), RecvErr>
    where
        T: DeserializeOwned,
    {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
            generation: self.generation.current(),
        };

        let Some(payload) = message.payload() else {
            offset.clone().store()?;
            return Err(RecvErr::Empty);
        };

        match serde_json::from_slice(payload) {
            Ok(p) => Ok((p, offset)),
            Err(e) => {
                offset.store()?;
                Err(RecvErr::Serde(e))
            }
        }
    }

    pub async fn json_recv_batch<T>(&self, max: usize, timeout: Duration) -> Vec<Result<(T, Offset), RecvErr>>
    where
        T: DeserializeOwned,
    {
        let mut results = Vec::with_capacity(max);
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {},
            _ = async {
                while results.len() < max {
                    let result = self.json_recv::<T>().await;
                    let was_err = result.is_err();
                    results.push(result);
                    if was_err {
                        break;
                    }
                }
            } => {}
        }
        results
    }

    /// Rolls this consumer's position back to the last committed offsets on
    /// every assigned partition. Called after an aborted exactly-once
    /// transaction so re-delivery starts from the last durable point rather
    /// than skipping the records the aborted transaction would have
    /// consumed.
    pub fn seek_to_committed(&self, timeout: Duration) -> Result<(), KafkaError> {
        let assignment = self.inner.consumer.assignment()?;
        if assignment.count() == 0 {
            return Ok(());
        }
        let committed = self.inner.consumer.committed_offsets(assignment, timeout)?;
        for element in committed.elements() {
            if let rdkafka::Offset::Offset(offset) = element.offset() {
                self.inner
                    .consumer
                    .seek(element.topic(), element.partition(), rdkafka::Offset::Offset(offset), timeout)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
    generation: i32,
}

impl Offset {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The consumer group generation this offset was observed under. Stored
    /// alongside outgoing records so `TransactionCoordinator` can detect a
    /// rebalance that happened between consumption and commit.
    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner.consumer.store_offset(&inner.topic, self.partition, self.offset)?;
        Ok(())
    }

    /// Builds the `(topic, partition) -> offset + 1` entry this offset
    /// contributes to a transactional offset commit: the committed offset is
    /// the next record to read, not the one just processed.
    pub fn to_commit_entry(&self, topic: &str) -> (String, i32, i64) {
        (topic.to_string(), self.partition, self.offset + 1)
    }
}

pub fn topic_partition_list(entries: &[(String, i32, i64)]) -> Result<TopicPartitionList, KafkaError> {
    let mut tpl = TopicPartitionList::new();
    for (topic, partition, offset) in entries {
        tpl.add_partition_offset(topic, *partition, rdkafka::Offset::Offset(*offset))?;
    }
    Ok(tpl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_tracker_starts_at_zero_and_bumps_on_assign() {
        let tracker = GenerationTracker::default();
        assert_eq!(tracker.current(), 0);
        tracker.bump();
        assert_eq!(tracker.current(), 1);
        tracker.bump();
        assert_eq!(tracker.current(), 2);
    }

    #[test]
    fn commit_entry_is_offset_plus_one() {
        let offset = Offset {
            handle: Weak::new(),
            partition: 3,
            offset: 41,
            generation: 7,
        };
        assert_eq!(
            offset.to_commit_entry("events"),
            ("events".to_string(), 3, 42)
        );
    }
}
