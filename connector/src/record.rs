use crate::error::ConnectorError;
use crate::message::{IncomingRecordMetadata, Message, OutgoingRecordMetadata, Payload, ProducerRecord};

pub const REPLY_TOPIC_HEADER: &str = "kafka_replyTopic";
pub const REPLY_PARTITION_HEADER: &str = "kafka_replyPartition";

/// Channel-level defaults a `RecordBuilder` falls back to once the message's
/// own metadata has nothing to say.
#[derive(Clone, Debug)]
pub struct RecordDefaults {
    pub channel_name: String,
    pub topic: Option<String>,
    pub key: Option<Vec<u8>>,
    pub partition: i32,
    pub propagate_record_key: bool,
    pub propagate_incoming_headers: bool,
}

/// Produces a broker record from a message, its metadata, and the channel's
/// configured defaults, applying a fixed topic/partition/key/headers
/// resolution order. Pure and deterministic: no field depends on anything
/// but its inputs.
pub struct RecordBuilder;

impl RecordBuilder {
    pub fn build(message: &Message, defaults: &RecordDefaults) -> Result<ProducerRecord, ConnectorError> {
        if let Payload::PreBuilt(record) = &message.payload {
            record.validate()?;
            return Ok(record.clone());
        }

        let om = message.outgoing.as_ref();
        let im = message.incoming.as_ref();

        let record = ProducerRecord {
            topic: Self::resolve_topic(om, im, defaults),
            partition: Self::resolve_partition(om, im, defaults),
            key: Self::resolve_key(&message.payload, om, im, defaults),
            timestamp: om.and_then(|o| o.timestamp),
            payload: Self::resolve_payload(&message.payload),
            headers: Self::resolve_headers(om, im, defaults),
        };
        record.validate()?;
        Ok(record)
    }

    fn resolve_topic(
        om: Option<&OutgoingRecordMetadata>,
        im: Option<&IncomingRecordMetadata>,
        defaults: &RecordDefaults,
    ) -> String {
        if let Some(bytes) = im.and_then(|im| im.header(REPLY_TOPIC_HEADER)) {
            return String::from_utf8_lossy(bytes).into_owned();
        }
        if let Some(topic) = om.and_then(|om| om.topic.clone()) {
            return topic;
        }
        if let Some(topic) = &defaults.topic {
            return topic.clone();
        }
        defaults.channel_name.clone()
    }

    fn resolve_partition(
        om: Option<&OutgoingRecordMetadata>,
        im: Option<&IncomingRecordMetadata>,
        defaults: &RecordDefaults,
    ) -> Option<i32> {
        if let Some(bytes) = im.and_then(|im| im.header(REPLY_PARTITION_HEADER)) {
            if let Ok(raw) = <[u8; 4]>::try_from(bytes) {
                return Some(i32::from_be_bytes(raw));
            }
        }
        if let Some(om) = om {
            if om.partition >= 0 {
                return Some(om.partition);
            }
        }
        if defaults.partition >= 0 {
            return Some(defaults.partition);
        }
        None
    }

    fn resolve_key(
        payload: &Payload,
        om: Option<&OutgoingRecordMetadata>,
        im: Option<&IncomingRecordMetadata>,
        defaults: &RecordDefaults,
    ) -> Option<Vec<u8>> {
        if let Some(key) = om.and_then(|om| om.key.clone()) {
            return Some(key);
        }
        if let Payload::KeyedRecord { key, .. } = payload {
            return Some(key.clone());
        }
        if defaults.propagate_record_key {
            if let Some(key) = im.and_then(|im| im.key.clone()) {
                return Some(key);
            }
        }
        defaults.key.clone()
    }

    fn resolve_headers(
        om: Option<&OutgoingRecordMetadata>,
        im: Option<&IncomingRecordMetadata>,
        defaults: &RecordDefaults,
    ) -> Vec<(String, Vec<u8>)> {
        let mut headers = Vec::new();
        if defaults.propagate_incoming_headers {
            if let Some(im) = im {
                headers.extend(im.headers.iter().cloned());
            }
        }
        if let Some(om) = om {
            for (name, value) in &om.headers {
                headers.retain(|(n, _)| n != name);
                headers.push((name.clone(), value.clone()));
            }
        }
        headers
    }

    fn resolve_payload(payload: &Payload) -> Vec<u8> {
        match payload {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::KeyedRecord { value, .. } => value.clone(),
            Payload::PreBuilt(_) => unreachable!("pre-built records return early in build()"),
        }
    }
}
