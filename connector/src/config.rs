use envconfig::Envconfig;

use crate::cloud_events::CloudEventsMode;

/// Configuration for a single sink instance, covering every key in the
/// external interface table. Broker-level concerns (`bootstrap.servers`,
/// `client.id`, `delivery.timeout.ms`) live in `common_kafka::KafkaConfig`
/// instead, since they're shared with the consumer side.
#[derive(Envconfig, Clone, Debug)]
pub struct SinkConfig {
    #[envconfig(from = "TOPIC")]
    pub topic: Option<String>,

    #[envconfig(from = "KEY")]
    pub key: Option<String>,

    /// `-1` means unset, mirroring the broker client's own convention.
    #[envconfig(from = "PARTITION", default = "-1")]
    pub partition: i32,

    /// `u32::MAX` is the `MAX` sentinel: retries become time-bounded by
    /// `delivery.timeout.ms` instead of counted.
    #[envconfig(from = "RETRIES", default = "4294967295")]
    pub retries: u32,

    /// `<= 0` means unbounded.
    #[envconfig(from = "MAX_INFLIGHT_MESSAGES", default = "5")]
    pub max_inflight_messages: i64,

    #[envconfig(from = "WAIT_FOR_WRITE_COMPLETION", default = "true")]
    pub wait_for_write_completion: bool,

    #[envconfig(from = "CLOUD_EVENTS", default = "false")]
    pub cloud_events: bool,

    #[envconfig(from = "CLOUD_EVENTS_MODE", default = "binary")]
    pub cloud_events_mode: CloudEventsMode,

    #[envconfig(from = "CLOUD_EVENTS_TYPE")]
    pub cloud_events_type: Option<String>,

    #[envconfig(from = "CLOUD_EVENTS_SOURCE")]
    pub cloud_events_source: Option<String>,

    #[envconfig(from = "VALUE_SERIALIZER_IS_STRING", default = "false")]
    pub value_serializer_is_string: bool,

    #[envconfig(from = "PROPAGATE_RECORD_KEY", default = "false")]
    pub propagate_record_key: bool,

    #[envconfig(from = "TRACING_ENABLED", default = "false")]
    pub tracing_enabled: bool,

    #[envconfig(from = "HEALTH_ENABLED", default = "true")]
    pub health_enabled: bool,

    #[envconfig(from = "HEALTH_READINESS_ENABLED", default = "true")]
    pub health_readiness_enabled: bool,
}

impl SinkConfig {
    pub fn max_inflight(&self) -> Option<usize> {
        if self.max_inflight_messages <= 0 {
            None
        } else {
            Some(self.max_inflight_messages as usize)
        }
    }

    pub fn is_unbounded_retries(&self) -> bool {
        self.retries == u32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_inflight_non_positive_is_unbounded() {
        let mut config = SinkConfig::init_from_hashmap(&Default::default()).unwrap();
        config.max_inflight_messages = 0;
        assert_eq!(config.max_inflight(), None);
        config.max_inflight_messages = -5;
        assert_eq!(config.max_inflight(), None);
        config.max_inflight_messages = 5;
        assert_eq!(config.max_inflight(), Some(5));
    }
}
