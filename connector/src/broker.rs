use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::FutureRecord;

use crate::message::ProducerRecord;

/// Converts a resolved `ProducerRecord` into the broker client's own record
/// type. Shared by `KafkaSink` and `TransactionCoordinator`'s emitter so both
/// paths build wire records the same way.
pub fn to_future_record(record: &ProducerRecord) -> FutureRecord<'_, [u8], [u8]> {
    let headers = if record.headers.is_empty() {
        None
    } else {
        let mut owned = OwnedHeaders::new();
        for (name, value) in &record.headers {
            owned = owned.insert(Header {
                key: name.as_str(),
                value: Some(value.as_slice()),
            });
        }
        Some(owned)
    };

    FutureRecord {
        topic: &record.topic,
        payload: Some(&record.payload),
        partition: record.partition,
        key: record.key.as_deref(),
        timestamp: record.timestamp,
        headers,
    }
}
