//! Record handlers and the explicit listener table.
//!
//! Each listener pairs a topic with the handler its consumer drives. The table
//! is built once at startup by [`build_listeners`].

use crate::model::command::{Command, CommandCodecError};
use crate::service::process_control::ProcessController;
use async_trait::async_trait;
use log::debug;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Failure handling one record; every variant is retried by the consumer.
#[derive(Debug)]
pub enum HandlerError {
    Decode(CommandCodecError),
    Apply(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    pub fn apply(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Apply(err.into())
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "unable to decode record: {err}"),
            Self::Apply(err) => write!(f, "unable to apply record: {err}"),
        }
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            Self::Apply(err) => Some(err.as_ref()),
        }
    }
}

impl From<CommandCodecError> for HandlerError {
    fn from(value: CommandCodecError) -> Self {
        Self::Decode(value)
    }
}

/// Handles one raw record value.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, value: &[u8]) -> Result<(), HandlerError>;
}

/// Topic plus the handler its consumer drives.
#[derive(Clone)]
pub struct Listener {
    pub topic: String,
    pub handler: Arc<dyn RecordHandler>,
}

/// Decodes process commands and applies them through the controller.
pub struct ProcessCommandListener {
    controller: Arc<ProcessController>,
}

impl ProcessCommandListener {
    pub fn new(controller: Arc<ProcessController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl RecordHandler for ProcessCommandListener {
    async fn handle(&self, value: &[u8]) -> Result<(), HandlerError> {
        let Some(command) = Command::decode(value)? else {
            debug!("event=record_skip module=source status=ok reason=rights_command");
            return Ok(());
        };
        let outcome = self
            .controller
            .apply_command(&command)
            .await
            .map_err(HandlerError::apply)?;
        debug!(
            "event=command_apply module=source status=ok kind={} id={} outcome={:?}",
            command.kind().as_str(),
            command.id(),
            outcome
        );
        Ok(())
    }
}

/// Listener table consumed by the runtime.
pub fn build_listeners(topic: &str, controller: Arc<ProcessController>) -> Vec<Listener> {
    vec![Listener {
        topic: topic.to_string(),
        handler: Arc::new(ProcessCommandListener::new(controller)),
    }]
}
