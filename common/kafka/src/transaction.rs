use std::time::Duration;

use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::ClientConfig;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::consumer::topic_partition_list;
use crate::producer::{send_keyed_iter_to_kafka, KafkaContext, KafkaProduceError};

/// A producer configured for `transactional.id`-based exactly-once
/// semantics. Transactions are either write-only, or read-process-write via
/// [`KafkaTransaction::associate_offsets`].
pub struct TransactionalProducer {
    inner: FutureProducer<KafkaContext>,
    timeout: Duration,
}

impl TransactionalProducer {
    pub fn from_config(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
        context: KafkaContext,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", config.kafka_compression_codec.to_owned())
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                config.kafka_producer_queue_messages.to_string(),
            )
            .set("transactional.id", transactional_id);

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        debug!("rdkafka transactional configuration: {:?}", client_config);
        let api: FutureProducer<KafkaContext> = client_config.create_with_context(context)?;

        match api.client().fetch_metadata(None, timeout) {
            Ok(metadata) => {
                info!(
                    "connected transactional producer, found {} topics",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("failed to fetch metadata for transactional producer: {:?}", error);
                return Err(error);
            }
        }

        api.init_transactions(timeout)?;

        Ok(TransactionalProducer { inner: api, timeout })
    }

    pub fn begin(self) -> Result<KafkaTransaction, KafkaError> {
        self.inner.begin_transaction()?;
        Ok(KafkaTransaction { producer: self })
    }

    pub fn inner(&self) -> &FutureProducer<KafkaContext> {
        &self.inner
    }

    /// Aborts a transaction already open on this producer without going
    /// through `KafkaTransaction::abort`. Used when a commit attempt itself
    /// fails: the broker still considers a transaction open, so it must be
    /// aborted directly rather than re-entered via `begin_transaction`.
    pub fn abort_in_place(&self) -> Result<(), KafkaError> {
        self.inner.abort_transaction(self.timeout)
    }
}

/// An open transaction. Consumed by `commit`/`abort`, which hand the
/// underlying producer back so a new transaction can be started.
pub struct KafkaTransaction {
    producer: TransactionalProducer,
}

impl KafkaTransaction {
    /// Raw access to the underlying producer, for callers sending records
    /// built outside the JSON-serializing helpers on this type.
    pub fn producer(&self) -> &FutureProducer<KafkaContext> {
        &self.producer.inner
    }

    pub async fn send_keyed_iter_to_kafka<D>(
        &self,
        topic: &str,
        key_extractor: impl Fn(&D) -> Option<String>,
        iter: impl IntoIterator<Item = D>,
    ) -> Result<(), KafkaProduceError>
    where
        D: Serialize,
    {
        send_keyed_iter_to_kafka(&self.producer.inner, topic, key_extractor, iter).await
    }

    /// Associates a batch of consumer offsets with this transaction, so they
    /// commit atomically with the records already sent on it. `entries` is
    /// `(topic, partition, next_offset)`; `next_offset` is
    /// `record.offset + 1`.
    pub fn associate_offsets(
        &self,
        entries: &[(String, i32, i64)],
        group_metadata: &ConsumerGroupMetadata,
    ) -> Result<(), KafkaError> {
        if entries.is_empty() {
            return Ok(());
        }
        let tpl = topic_partition_list(entries)?;
        self.producer
            .inner
            .send_offsets_to_transaction(&tpl, group_metadata, self.producer.timeout)
    }

    /// Commits the transaction. The producer is returned in both the success
    /// and error case: a failed commit does not release `transactional.id`,
    /// and the caller is expected to fall back to `TransactionalProducer::
    /// abort_in_place` on error rather than lose the producer.
    pub fn commit(self) -> Result<TransactionalProducer, (TransactionalProducer, KafkaError)> {
        match self.producer.inner.commit_transaction(self.producer.timeout) {
            Ok(()) => Ok(self.producer),
            Err(error) => Err((self.producer, error)),
        }
    }

    pub fn abort(self) -> Result<TransactionalProducer, (TransactionalProducer, KafkaError)> {
        match self.producer.inner.abort_transaction(self.producer.timeout) {
            Ok(()) => Ok(self.producer),
            Err(error) => Err((self.producer, error)),
        }
    }
}
