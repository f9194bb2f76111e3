//! Asynchronous write pipeline.
//!
//! # Responsibility
//! - Publish commands onto the ordered command log.
//! - Consume, apply, and commit them with bounded retry.
//!
//! # Invariants
//! - All commands for one resource id travel on one partition.
//! - Handlers are idempotent; redelivery is always safe.

pub mod consumer;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod listener;
pub mod log;
pub mod memory;
pub mod producer;
pub mod retry;

use crate::config::{CommandLogBackend, ServiceConfig};
use self::log::{CommandLog, LogResult};
use std::sync::Arc;

pub use consumer::{CommandConsumer, ConsumerExit, ConsumerFailure, FatalHandler};
pub use listener::{build_listeners, HandlerError, Listener, ProcessCommandListener, RecordHandler};
pub use memory::MemoryCommandLog;
pub use producer::{CommandProducer, PublishError};
pub use retry::{RetryOutcome, RetryPolicy};

/// Opens the command log backend selected by `config`.
pub async fn open_command_log(config: &ServiceConfig) -> LogResult<Arc<dyn CommandLog>> {
    match config.command_log {
        CommandLogBackend::Memory => Ok(Arc::new(MemoryCommandLog::new(
            config.memory_log_partitions,
        ))),
        CommandLogBackend::Kafka => open_kafka(config).await,
    }
}

#[cfg(feature = "kafka")]
async fn open_kafka(config: &ServiceConfig) -> LogResult<Arc<dyn CommandLog>> {
    let log =
        kafka::KafkaCommandLog::connect(&config.kafka_url, &[config.process_topic.as_str()]).await?;
    Ok(Arc::new(log))
}

#[cfg(not(feature = "kafka"))]
async fn open_kafka(_config: &ServiceConfig) -> LogResult<Arc<dyn CommandLog>> {
    Err(self::log::LogError::Backend(
        "kafka backend requested but the `kafka` feature is disabled".to_string(),
    ))
}
