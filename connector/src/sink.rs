use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_health::HealthHandle;
use common_kafka::config::KafkaConfig;
use common_kafka::producer::{client_config, KafkaContext};
use futures::{Stream, StreamExt};
use rdkafka::producer::{FutureProducer, Producer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::to_future_record;
use crate::cloud_events::{CloudEventCodec, CloudEventsConfig};
use crate::config::SinkConfig;
use crate::error::{ConnectorError, SendError};
use crate::failure_registry::FailureRegistry;
use crate::message::{Message, ProducerRecord};
use crate::pipeline::SenderPipeline;
use crate::record::{RecordBuilder, RecordDefaults};
use crate::retry::RetryPolicy;

/// Broker-side checks the sink delegates readiness/liveness probing to. Kept
/// as a seam rather than a concrete implementation: exercising it for real
/// means reaching a live broker, which is out of scope for this crate's own
/// tests.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
    async fn is_started(&self) -> bool;
}

pub struct BrokerMetadataProbe {
    producer: Arc<FutureProducer<KafkaContext>>,
    timeout: Duration,
}

impl BrokerMetadataProbe {
    pub fn new(producer: Arc<FutureProducer<KafkaContext>>, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl HealthProbe for BrokerMetadataProbe {
    async fn is_ready(&self) -> bool {
        self.producer
            .client()
            .fetch_metadata(None, self.timeout)
            .is_ok()
    }

    async fn is_started(&self) -> bool {
        self.is_ready().await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Reports `isAlive` based on whether any recent sends have failed.
#[derive(Clone, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub recent_failures: Vec<String>,
}

struct WriteConfig {
    record_defaults: RecordDefaults,
    cloud_events: Option<CloudEventsConfig>,
    value_serializer_is_string: bool,
    wait_for_write_completion: bool,
}

/// The outbound orchestrator: configures a producer, builds the
/// `SenderPipeline`, and acks/nacks each upstream message as its write
/// resolves.
pub struct KafkaSink {
    producer: Arc<FutureProducer<KafkaContext>>,
    pipeline: SenderPipeline,
    retry_policy: RetryPolicy,
    write: WriteConfig,
    failures: Arc<FailureRegistry>,
    health_probe: Option<Arc<dyn HealthProbe>>,
    health_enabled: bool,
    cancellation: CancellationToken,
    flush_timeout: Duration,
}

impl KafkaSink {
    pub async fn new(
        channel_name: String,
        config: SinkConfig,
        kafka_config: KafkaConfig,
        liveness: Option<HealthHandle>,
    ) -> Result<Self, ConnectorError> {
        if config.cloud_events
            && config.cloud_events_mode == crate::cloud_events::CloudEventsMode::Structured
            && !config.value_serializer_is_string
        {
            return Err(crate::error::ConfigError::StructuredRequiresStringSerializer.into());
        }

        let cfg = client_config(&kafka_config);
        let producer: FutureProducer<KafkaContext> =
            cfg.create_with_context(KafkaContext::new(liveness))?;
        let producer = Arc::new(producer);

        let record_defaults = RecordDefaults {
            channel_name,
            topic: config.topic.clone(),
            key: config.key.clone().map(|k| k.into_bytes()),
            partition: config.partition,
            propagate_record_key: config.propagate_record_key,
            propagate_incoming_headers: true,
        };

        let cloud_events = config.cloud_events.then(|| CloudEventsConfig {
            mode: config.cloud_events_mode,
            default_type: config.cloud_events_type.clone(),
            default_source: config.cloud_events_source.clone(),
        });

        let retry_policy = RetryPolicy::from_config(
            config.retries,
            Duration::from_millis(kafka_config.kafka_delivery_timeout_ms as u64),
        );

        let health_probe: Option<Arc<dyn HealthProbe>> = if config.health_readiness_enabled {
            Some(Arc::new(BrokerMetadataProbe::new(
                producer.clone(),
                Duration::from_secs(10),
            )))
        } else {
            None
        };

        Ok(Self {
            producer,
            pipeline: SenderPipeline::new(config.max_inflight()),
            retry_policy,
            write: WriteConfig {
                record_defaults,
                cloud_events,
                value_serializer_is_string: config.value_serializer_is_string,
                wait_for_write_completion: config.wait_for_write_completion,
            },
            failures: Arc::new(FailureRegistry::new()),
            health_probe,
            health_enabled: config.health_enabled,
            cancellation: CancellationToken::new(),
            flush_timeout: Duration::from_millis(kafka_config.kafka_message_timeout_ms as u64),
        })
    }

    /// Drives `upstream` to completion, acking or nacking each message as
    /// its write resolves. This is the subscriber end of the pipeline: the
    /// caller hands it a stream of outgoing `Message`s and waits for it to
    /// finish (on upstream exhaustion or `close_quietly`).
    pub async fn run<S>(self: &Arc<Self>, upstream: S)
    where
        S: Stream<Item = Message> + Send + 'static,
    {
        let this = self.clone();
        let stream = self.pipeline.run(upstream, move |message| {
            let this = this.clone();
            async move { this.write_message_to_kafka(message).await }
        });
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                next = stream.next() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }
    }

    /// Builds the record, sends it with retry, and terminally acks or nacks.
    /// Never returns an error itself, failures are folded into the nack and
    /// the failure registry so the pipeline keeps running.
    async fn write_message_to_kafka(&self, message: Message) {
        match self.try_write(&message).await {
            Ok(metadata) => {
                info!(
                    topic = %metadata.topic,
                    partition = metadata.partition,
                    offset = metadata.offset,
                    "message delivered"
                );
                message.ack().await;
            }
            Err(error) => {
                self.failures.report(&error);
                let connector_error = ConnectorError::Send(error);
                message.nack(connector_error).await;
            }
        }
    }

    async fn try_write(&self, message: &Message) -> Result<RecordMetadata, SendError> {
        let record = self
            .build_record(message)
            .map_err(|error| SendError::Serialization(error.to_string()))?;

        if self.write.wait_for_write_completion {
            self.retry_policy
                .send_with_retry(|| self.send_and_await(&record))
                .await
        } else {
            self.send_fire_and_forget(&record)
        }
    }

    fn build_record(&self, message: &Message) -> Result<ProducerRecord, ConnectorError> {
        let mut record = RecordBuilder::build(message, &self.write.record_defaults)?;
        if let Some(ce_config) = &self.write.cloud_events {
            if CloudEventCodec::applies(ce_config, message.cloud_event.as_ref()) {
                record = CloudEventCodec::encode(
                    ce_config,
                    message.cloud_event.as_ref(),
                    record,
                    self.write.value_serializer_is_string,
                )?;
            }
        }
        Ok(record)
    }

    async fn send_and_await(&self, record: &ProducerRecord) -> Result<RecordMetadata, SendError> {
        let future = self
            .producer
            .send_result(to_future_record(record))
            .map_err(|(error, _)| SendError::from_kafka(&error))?;

        match future.await {
            Ok(Ok((partition, offset))) => Ok(RecordMetadata {
                topic: record.topic.clone(),
                partition,
                offset,
            }),
            Ok(Err((error, _))) => Err(SendError::from_kafka(&error)),
            Err(_) => Err(SendError::Retryable("delivery future canceled".into())),
        }
    }

    /// When `wait-for-write-completion` is disabled, the pipeline's notion of
    /// "completion" is enqueueing the send, not the broker's acknowledgement.
    /// The eventual ack/nack outcome can no longer reach the already-acked
    /// message, so a failure here is only visible via the failure registry.
    fn send_fire_and_forget(&self, record: &ProducerRecord) -> Result<RecordMetadata, SendError> {
        let topic = record.topic.clone();
        let future = self
            .producer
            .send_result(to_future_record(record))
            .map_err(|(error, _)| SendError::from_kafka(&error))?;

        let failures = self.failures.clone();
        tokio::spawn(async move {
            match future.await {
                Ok(Ok(_)) => {}
                Ok(Err((error, _))) => {
                    let error = SendError::from_kafka(&error);
                    warn!(%error, topic = %topic, "fire-and-forget send failed after ack");
                    failures.report(&error);
                }
                Err(_) => {
                    warn!(topic = %topic, "fire-and-forget delivery future canceled");
                }
            }
        });

        Ok(RecordMetadata {
            topic: record.topic.clone(),
            partition: record.partition.unwrap_or(-1),
            offset: -1,
        })
    }

    pub fn is_alive(&self) -> HealthStatus {
        if !self.health_enabled {
            return HealthStatus {
                healthy: true,
                recent_failures: vec![],
            };
        }
        HealthStatus {
            healthy: self.failures.is_empty(),
            recent_failures: self.failures.snapshot(),
        }
    }

    /// Must not be called from the broker client's I/O thread: the probe
    /// issues a blocking metadata fetch.
    pub async fn is_ready(&self) -> bool {
        match &self.health_probe {
            Some(probe) => probe.is_ready().await,
            None => true,
        }
    }

    pub async fn is_started(&self) -> bool {
        match &self.health_probe {
            Some(probe) => probe.is_started().await,
            None => true,
        }
    }

    pub async fn close_quietly(&self) {
        self.cancellation.cancel();
        if let Err(error) = self.producer.flush(self.flush_timeout) {
            error!(%error, "error flushing producer during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_alive_reports_healthy_when_registry_empty() {
        let failures = FailureRegistry::new();
        assert!(failures.is_empty());
    }
}
