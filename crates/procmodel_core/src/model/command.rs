//! Commands carried through the ordered command log.
//!
//! # Responsibility
//! - Define the write intents produced by the API layer.
//! - Own the JSON wire shape of log records and decode it exactly once.
//!
//! # Invariants
//! - A decoded command always has a non-empty resource id.
//! - For PUT records the record id and the payload id must agree.
//! - `RIGHTS` records are acknowledged and never applied.

use crate::model::process::{ProcessDocument, ProcessId};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

const PUT: &str = "PUT";
const DELETE: &str = "DELETE";
const RIGHTS: &str = "RIGHTS";

/// Write intent for one process resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Full replace-upsert of the document.
    Put {
        owner: String,
        document: ProcessDocument,
    },
    /// Removal of the document and its authority resource.
    Delete { id: ProcessId, owner: String },
}

/// Discriminant used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Put,
    Delete,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => PUT,
            Self::Delete => DELETE,
        }
    }
}

/// Errors raised while encoding or decoding log records.
#[derive(Debug)]
pub enum CommandCodecError {
    Json(serde_json::Error),
    UnknownCommand(String),
    MissingPayload(ProcessId),
    EmptyId,
    IdMismatch { record_id: String, payload_id: String },
}

impl Display for CommandCodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "malformed command record: {err}"),
            Self::UnknownCommand(command) => write!(f, "unable to handle command `{command}`"),
            Self::MissingPayload(id) => write!(f, "PUT command for `{id}` has no process model"),
            Self::EmptyId => write!(f, "command record has no resource id"),
            Self::IdMismatch {
                record_id,
                payload_id,
            } => write!(
                f,
                "command id `{record_id}` does not match process model id `{payload_id}`"
            ),
        }
    }
}

impl Error for CommandCodecError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CommandCodecError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// JSON shape of one log record value.
#[derive(Debug, Serialize, Deserialize)]
struct CommandRecord {
    command: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    owner: String,
    #[serde(default, alias = "payload", skip_serializing_if = "Option::is_none")]
    processmodel: Option<ProcessDocument>,
}

impl Command {
    pub fn put(owner: impl Into<String>, document: ProcessDocument) -> Self {
        Self::Put {
            owner: owner.into(),
            document,
        }
    }

    pub fn delete(id: impl Into<ProcessId>, owner: impl Into<String>) -> Self {
        Self::Delete {
            id: id.into(),
            owner: owner.into(),
        }
    }

    /// Resource id used as the partition key.
    pub fn id(&self) -> &str {
        match self {
            Self::Put { document, .. } => document.id.as_str(),
            Self::Delete { id, .. } => id.as_str(),
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Self::Put { owner, .. } | Self::Delete { owner, .. } => owner.as_str(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Put { .. } => CommandKind::Put,
            Self::Delete { .. } => CommandKind::Delete,
        }
    }

    /// Serializes the command into its log record value.
    pub fn encode(&self) -> Result<Vec<u8>, CommandCodecError> {
        if self.id().trim().is_empty() {
            return Err(CommandCodecError::EmptyId);
        }
        let record = match self {
            Self::Put { owner, document } => CommandRecord {
                command: PUT.to_string(),
                id: document.id.clone(),
                owner: owner.clone(),
                processmodel: Some(document.clone()),
            },
            Self::Delete { id, owner } => CommandRecord {
                command: DELETE.to_string(),
                id: id.clone(),
                owner: owner.clone(),
                processmodel: None,
            },
        };
        Ok(serde_json::to_vec(&record)?)
    }

    /// Decodes a log record value.
    ///
    /// Returns `Ok(None)` for record kinds that are acknowledged without being
    /// applied.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, CommandCodecError> {
        let record: CommandRecord = serde_json::from_slice(bytes)?;
        match record.command.as_str() {
            PUT => {
                let mut document = record
                    .processmodel
                    .ok_or_else(|| CommandCodecError::MissingPayload(record.id.clone()))?;
                if document.id.is_empty() {
                    document.id = record.id.clone();
                } else if !record.id.is_empty() && record.id != document.id {
                    return Err(CommandCodecError::IdMismatch {
                        record_id: record.id,
                        payload_id: document.id,
                    });
                }
                if document.id.trim().is_empty() {
                    return Err(CommandCodecError::EmptyId);
                }
                Ok(Some(Self::Put {
                    owner: record.owner,
                    document,
                }))
            }
            DELETE => {
                if record.id.trim().is_empty() {
                    return Err(CommandCodecError::EmptyId);
                }
                Ok(Some(Self::Delete {
                    id: record.id,
                    owner: record.owner,
                }))
            }
            RIGHTS => Ok(None),
            other => Err(CommandCodecError::UnknownCommand(other.to_string())),
        }
    }
}
