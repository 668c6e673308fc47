pub mod broker;
pub mod cloud_events;
pub mod config;
pub mod context;
pub mod error;
pub mod failure_registry;
pub mod message;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod sink;
pub mod transaction;

pub use error::ConnectorError;
pub use message::Message;
pub use sink::KafkaSink;
pub use transaction::TransactionCoordinator;
