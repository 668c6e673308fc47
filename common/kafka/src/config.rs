use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "")]
    pub kafka_client_id: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    /// `delivery.timeout.ms`, used both by librdkafka and by the unbounded
    /// retry deadline in `RetryPolicy`.
    #[envconfig(default = "120000")]
    pub kafka_delivery_timeout_ms: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "false")]
    pub kafka_enable_idempotence: bool,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Consumers used transactionally must disable auto offset commits, since
    // their offsets are committed via `send_offsets_to_transaction` instead.
    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,
}

impl ConsumerConfig {
    /// Application-specific defaults are set via env vars rather than the
    /// derive macro, because they depend on the service embedding the
    /// connector.
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        }
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        }
    }
}
