use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::ConnectorError;

/// A payload carried by a [`Message`]. `PreBuilt` lets an upstream publisher
/// hand the sink a fully-formed record, bypassing the usual routing rules in
/// `record::RecordBuilder`.
#[derive(Clone, Debug)]
pub enum Payload {
    Bytes(Vec<u8>),
    KeyedRecord { key: Vec<u8>, value: Vec<u8> },
    PreBuilt(ProducerRecord),
}

/// Routing overrides an upstream publisher attaches to an outgoing message.
/// `partition` uses the `-1` sentinel for "unset" to mirror the broker
/// client's own convention rather than introducing a second optional.
#[derive(Clone, Debug, Default)]
pub struct OutgoingRecordMetadata {
    pub topic: Option<String>,
    pub partition: i32,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl OutgoingRecordMetadata {
    pub fn unset_partition() -> i32 {
        -1
    }
}

/// Metadata carried by a message consumed from the broker. `key` is not part
/// of the distilled attribute set but is required to support
/// `propagate-record-key`, since the original incoming record always has one.
#[derive(Clone, Debug)]
pub struct IncomingRecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub generation_id: i32,
    pub key: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl IncomingRecordMetadata {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

#[derive(Clone, Debug, Default)]
pub struct CloudEventMetadata {
    pub id: Option<String>,
    pub source: Option<String>,
    pub ty: Option<String>,
    pub subject: Option<String>,
    pub time: Option<String>,
    pub datacontenttype: Option<String>,
    pub dataschema: Option<String>,
    pub partitionkey: Option<String>,
    pub extensions: BTreeMap<String, String>,
}

/// A broker-bound record. Invariants: `topic` non-empty; `partition` absent
/// or `>= 0`; `timestamp` absent or `>= 0`.
#[derive(Clone, Debug)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub timestamp: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ProducerRecord {
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.topic.is_empty() {
            return Err(ConnectorError::Config(
                crate::error::ConfigError::EmptyTopic,
            ));
        }
        if matches!(self.partition, Some(p) if p < 0) {
            return Err(ConnectorError::Config(
                crate::error::ConfigError::NegativePartition,
            ));
        }
        if matches!(self.timestamp, Some(t) if t < 0) {
            return Err(ConnectorError::Config(
                crate::error::ConfigError::NegativeTimestamp,
            ));
        }
        Ok(())
    }
}

type AckFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;
type NackFn = Box<dyn FnOnce(ConnectorError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// An application message flowing through the sink. Consuming `ack`/`nack`
/// by value means exactly one of them can ever be invoked: ownership of
/// `self` is spent on the call.
pub struct Message {
    pub payload: Payload,
    pub outgoing: Option<OutgoingRecordMetadata>,
    pub incoming: Option<IncomingRecordMetadata>,
    pub cloud_event: Option<CloudEventMetadata>,
    ack: AckFn,
    nack: NackFn,
}

impl Message {
    pub fn new(
        payload: Payload,
        outgoing: Option<OutgoingRecordMetadata>,
        incoming: Option<IncomingRecordMetadata>,
        cloud_event: Option<CloudEventMetadata>,
    ) -> Self {
        Self {
            payload,
            outgoing,
            incoming,
            cloud_event,
            ack: Box::new(|| Box::pin(async {})),
            nack: Box::new(|_| Box::pin(async {})),
        }
    }

    /// Attaches the ack/nack callbacks an upstream channel adapter supplies.
    /// Kept separate from `new` so simple in-process tests can build a
    /// message without wiring a real channel.
    pub fn with_handlers(mut self, ack: AckFn, nack: NackFn) -> Self {
        self.ack = ack;
        self.nack = nack;
        self
    }

    pub async fn ack(self) {
        (self.ack)().await
    }

    pub async fn nack(self, cause: ConnectorError) {
        (self.nack)(cause).await
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("outgoing", &self.outgoing)
            .field("incoming", &self.incoming)
            .field("cloud_event", &self.cloud_event)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn ack_invokes_the_attached_handler() {
        let acked = Arc::new(AtomicBool::new(false));
        let acked_clone = acked.clone();
        let message = Message::new(Payload::Bytes(vec![1, 2, 3]), None, None, None).with_handlers(
            Box::new(move || {
                let acked = acked_clone.clone();
                Box::pin(async move {
                    acked.store(true, Ordering::SeqCst);
                })
            }),
            Box::new(|_| Box::pin(async {})),
        );

        message.ack().await;
        assert!(acked.load(Ordering::SeqCst));
    }

    #[test]
    fn producer_record_rejects_empty_topic() {
        let record = ProducerRecord {
            topic: String::new(),
            partition: None,
            timestamp: None,
            key: None,
            payload: vec![],
            headers: vec![],
        };
        assert!(record.validate().is_err());
    }

    #[test]
    fn producer_record_rejects_negative_partition() {
        let record = ProducerRecord {
            topic: "t".into(),
            partition: Some(-1),
            timestamp: None,
            key: None,
            payload: vec![],
            headers: vec![],
        };
        assert!(record.validate().is_err());
    }
}
