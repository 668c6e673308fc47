use crate::config::KafkaConfig;

use common_health::HealthHandle;
use futures::future::join_all;
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

/// Liveness-reporting `rdkafka` client context. The client's statistics
/// callback fires on the producer's internal poll thread whenever it has
/// successfully talked to the cluster, which we treat as a liveness signal.
pub struct KafkaContext {
    liveness: Option<HealthHandle>,
}

impl KafkaContext {
    pub fn new(liveness: Option<HealthHandle>) -> Self {
        Self { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }
    }
}

pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "delivery.timeout.ms",
            config.kafka_delivery_timeout_ms.to_string(),
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
        .set(
            "enable.idempotence",
            config.kafka_enable_idempotence.to_string(),
        );

    if !config.kafka_client_id.is_empty() {
        client_config.set("client.id", &config.kafka_client_id);
    }

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    client_config
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: Option<HealthHandle>,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let cfg = client_config(config);
    debug!("rdkafka configuration: {:?}", cfg);

    let producer: FutureProducer<KafkaContext> =
        cfg.create_with_context(KafkaContext::new(liveness))?;

    match producer
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(10))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    Serialization { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    Produce { error: KafkaError },
    #[error("failed to produce to kafka (timeout while retrying)")]
    Canceled,
}

/// Serializes each item as JSON and produces it to `topic`, awaiting all
/// delivery acknowledgements. Used by consumers of this crate that don't
/// need the per-message control the connector's own `SenderPipeline` gives.
pub async fn send_keyed_iter_to_kafka<T>(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    key_extractor: impl Fn(&T) -> Option<String>,
    iter: impl IntoIterator<Item = T>,
) -> Result<(), KafkaProduceError>
where
    T: Serialize,
{
    let mut payloads = Vec::new();
    for item in iter {
        let key = key_extractor(&item);
        let payload =
            serde_json::to_string(&item).map_err(|error| KafkaProduceError::Serialization { error })?;
        payloads.push((key, payload));
    }

    if payloads.is_empty() {
        return Ok(());
    }

    let mut delivery_futures = Vec::new();
    for (key, payload) in &payloads {
        match producer.send_result(FutureRecord {
            topic,
            payload: Some(payload),
            partition: None,
            key: key.as_deref(),
            timestamp: None,
            headers: None,
        }) {
            Ok(future) => delivery_futures.push(future),
            Err((error, _)) => return Err(KafkaProduceError::Produce { error }),
        }
    }

    for result in join_all(delivery_futures).await {
        match result {
            Ok(Ok(_)) => {}
            Ok(Err((error, _))) => return Err(KafkaProduceError::Produce { error }),
            Err(_) => return Err(KafkaProduceError::Canceled),
        }
    }

    Ok(())
}

pub async fn send_iter_to_kafka<T>(
    producer: &FutureProducer<KafkaContext>,
    topic: &str,
    iter: impl IntoIterator<Item = T>,
) -> Result<(), KafkaProduceError>
where
    T: Serialize,
{
    send_keyed_iter_to_kafka(producer, topic, |_| None, iter).await
}

pub fn flush(producer: &FutureProducer<KafkaContext>, timeout: std::time::Duration) -> KafkaResult<()> {
    use rdkafka::producer::Producer;
    producer.flush(timeout)
}
