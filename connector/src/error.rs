use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// Errors that fail construction: a misconfigured serializer, or CloudEvents
/// enabled without enough information to build the mandatory attributes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("structured CloudEvents mode requires a string value serializer")]
    StructuredRequiresStringSerializer,
    #[error("cloud events enabled but no type/source configured and the message carries no CloudEvent metadata")]
    MissingCloudEventAttributes,
    #[error("invalid cloud events mode {0:?}, expected \"binary\" or \"structured\"")]
    InvalidCloudEventsMode(String),
    #[error("producer record topic must not be empty")]
    EmptyTopic,
    #[error("producer record partition must not be negative")]
    NegativePartition,
    #[error("producer record timestamp must not be negative")]
    NegativeTimestamp,
    #[error("no consumer bound to channel {0}, exactly-once requires exactly one")]
    NoConsumerForChannel(String),
    #[error("more than one consumer bound to channel {0}, exactly-once requires exactly one")]
    MultipleConsumersForChannel(String),
    #[error("exactly-once transaction requires at least one message with incoming record metadata")]
    MissingIncomingMetadata,
    #[error("failed to connect to kafka brokers: {0}")]
    Kafka(#[from] KafkaError),
}

/// A fixed classification: everything not in this set is retryable.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("offset metadata too large")]
    OffsetMetadataTooLarge,
    #[error("record batch too large")]
    RecordBatchTooLarge,
    #[error("record too large")]
    RecordTooLarge,
    #[error("unknown server error: {0}")]
    UnknownServer(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("transaction aborted")]
    TransactionAborted,
    #[error("broker send failed, retryable: {0}")]
    Retryable(String),
}

impl SendError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SendError::InvalidTopic(_)
                | SendError::OffsetMetadataTooLarge
                | SendError::RecordBatchTooLarge
                | SendError::RecordTooLarge
                | SendError::UnknownServer(_)
                | SendError::Serialization(_)
                | SendError::TransactionAborted
        )
    }

    /// Maps a broker client error onto the fixed recoverability
    /// classification. Unrecognized codes default to retryable.
    pub fn from_kafka(error: &KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::InvalidTopic) | Some(RDKafkaErrorCode::TopicException) => {
                SendError::InvalidTopic(error.to_string())
            }
            Some(RDKafkaErrorCode::OffsetMetadataTooLarge) => SendError::OffsetMetadataTooLarge,
            Some(RDKafkaErrorCode::MessageSizeTooLarge) => SendError::RecordTooLarge,
            Some(RDKafkaErrorCode::InvalidMessageSize) => SendError::RecordBatchTooLarge,
            Some(RDKafkaErrorCode::UnknownServerError) | Some(RDKafkaErrorCode::Unknown) => {
                SendError::UnknownServer(error.to_string())
            }
            _ => SendError::Retryable(error.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("generation id mismatch: stored {stored} but consumer group generation is now {live}")]
pub struct RebalanceError {
    pub stored: i32,
    pub live: i32,
}

#[derive(Debug, thiserror::Error)]
#[error("operation was cancelled")]
pub struct CancellationError;

#[derive(Debug, thiserror::Error)]
#[error("withTransaction called while another transaction is already in progress")]
pub struct ReentrantTransactionError;

#[derive(Debug, thiserror::Error)]
#[error("the transaction coordinator is poisoned after a fatal broker error and can no longer begin transactions")]
pub struct PoisonedCoordinatorError;

/// Top-level error returned from any public entry point that can fail for
/// more than one reason.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Rebalance(#[from] RebalanceError),
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
    #[error(transparent)]
    Reentrant(#[from] ReentrantTransactionError),
    #[error(transparent)]
    Poisoned(#[from] PoisonedCoordinatorError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_non_recoverable_kinds_are_not_recoverable() {
        assert!(!SendError::InvalidTopic("x".into()).is_recoverable());
        assert!(!SendError::OffsetMetadataTooLarge.is_recoverable());
        assert!(!SendError::RecordBatchTooLarge.is_recoverable());
        assert!(!SendError::RecordTooLarge.is_recoverable());
        assert!(!SendError::UnknownServer("x".into()).is_recoverable());
        assert!(!SendError::Serialization("x".into()).is_recoverable());
        assert!(!SendError::TransactionAborted.is_recoverable());
    }

    #[test]
    fn everything_else_is_recoverable() {
        assert!(SendError::Retryable("timeout".into()).is_recoverable());
    }
}
