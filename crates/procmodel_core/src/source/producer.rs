//! Command publishing on the request path.
//!
//! # Invariants
//! - Every record is keyed by its resource id, so commands for one id stay
//!   totally ordered on one partition.
//! - Commands with an empty id never reach the log.
//! - Failures surface to the caller; there is no internal retry.

use crate::model::command::{Command, CommandCodecError};
use crate::model::process::ProcessDocument;
use crate::source::log::{CommandLog, LogError, RecordPosition};
use log::{debug, error};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Publish failure returned synchronously to the API layer.
#[derive(Debug)]
pub enum PublishError {
    EmptyId,
    Encode(CommandCodecError),
    Log(LogError),
}

impl Display for PublishError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "refusing to publish a command without id"),
            Self::Encode(err) => write!(f, "unable to encode command: {err}"),
            Self::Log(err) => write!(f, "unable to publish command: {err}"),
        }
    }
}

impl Error for PublishError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::EmptyId => None,
            Self::Encode(err) => Some(err),
            Self::Log(err) => Some(err),
        }
    }
}

impl From<LogError> for PublishError {
    fn from(value: LogError) -> Self {
        Self::Log(value)
    }
}

impl From<CommandCodecError> for PublishError {
    fn from(value: CommandCodecError) -> Self {
        match value {
            CommandCodecError::EmptyId => Self::EmptyId,
            other => Self::Encode(other),
        }
    }
}

/// Appends commands to the process topic.
#[derive(Clone)]
pub struct CommandProducer {
    log: Arc<dyn CommandLog>,
    topic: String,
    debug: bool,
}

impl CommandProducer {
    pub fn new(log: Arc<dyn CommandLog>, topic: impl Into<String>, debug: bool) -> Self {
        Self {
            log,
            topic: topic.into(),
            debug,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes one command and waits for the log acknowledgement.
    pub async fn publish(&self, command: &Command) -> Result<RecordPosition, PublishError> {
        let id = command.id();
        if id.trim().is_empty() {
            return Err(PublishError::EmptyId);
        }
        let value = command.encode()?;
        if self.debug {
            debug!(
                "event=command_publish module=source status=start topic={} kind={} id={} bytes={}",
                self.topic,
                command.kind().as_str(),
                id,
                value.len()
            );
        }
        match self.log.append(&self.topic, id.as_bytes(), &value).await {
            Ok(position) => Ok(position),
            Err(err) => {
                error!(
                    "event=command_publish module=source status=error topic={} kind={} id={} error={}",
                    self.topic,
                    command.kind().as_str(),
                    id,
                    err
                );
                Err(err.into())
            }
        }
    }

    pub async fn publish_put(
        &self,
        owner: &str,
        document: ProcessDocument,
    ) -> Result<RecordPosition, PublishError> {
        self.publish(&Command::put(owner, document)).await
    }

    pub async fn publish_delete(
        &self,
        id: &str,
        owner: &str,
    ) -> Result<RecordPosition, PublishError> {
        self.publish(&Command::delete(id, owner)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemoryCommandLog;

    #[tokio::test]
    async fn empty_id_is_rejected_before_append() {
        let log = MemoryCommandLog::new(2);
        let producer = CommandProducer::new(Arc::new(log.clone()), "processmodel", false);
        let err = producer.publish_delete("  ", "user").await.unwrap_err();
        assert!(matches!(err, PublishError::EmptyId));
        assert!(log.is_empty("processmodel"));
    }

    #[tokio::test]
    async fn records_are_keyed_by_resource_id() {
        let log = MemoryCommandLog::new(4);
        let producer = CommandProducer::new(Arc::new(log.clone()), "processmodel", true);
        let position = producer
            .publish_put("user", ProcessDocument::new("p1", "A"))
            .await
            .unwrap();
        assert_eq!(position.partition, log.partition_for(b"p1"));
        assert_eq!(log.len("processmodel"), 1);
    }

    #[tokio::test]
    async fn closed_log_surfaces_error() {
        let log = MemoryCommandLog::new(1);
        log.close().await.unwrap();
        let producer = CommandProducer::new(Arc::new(log), "processmodel", false);
        let err = producer.publish_delete("p1", "user").await.unwrap_err();
        assert!(matches!(err, PublishError::Log(LogError::Closed)));
    }
}
