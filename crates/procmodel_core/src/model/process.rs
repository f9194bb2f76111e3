//! Process document model.
//!
//! # Invariants
//! - `id` is stable and never reused for another process model.
//! - `last_updated_unix == 0` means the document was never stamped.
//! - PUT applies replace the whole document; there is no field-level merge.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identifier of a process model, shared with the permission authority.
pub type ProcessId = String;

/// Versioned process model document as persisted by the materializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessDocument {
    pub id: ProcessId,
    pub name: String,
    /// User id of the creator; receives the default admin grant.
    pub owner: String,
    pub bpmn_xml: String,
    pub svg_xml: String,
    /// Marks the model as visible in the public listing.
    pub publish: bool,
    pub publish_date: String,
    pub description: String,
    /// Unix seconds of the last accepted write. `0` means unset.
    pub last_updated_unix: i64,
}

/// Validation failures for process documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessValidationError {
    EmptyId,
    MissingName,
}

impl Display for ProcessValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "missing id"),
            Self::MissingName => write!(f, "missing name"),
        }
    }
}

impl Error for ProcessValidationError {}

impl ProcessDocument {
    /// Creates an unstamped document with the given id and display name.
    pub fn new(id: impl Into<ProcessId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Checks the invariants every persisted document must satisfy.
    pub fn validate(&self) -> Result<(), ProcessValidationError> {
        if self.id.trim().is_empty() {
            return Err(ProcessValidationError::EmptyId);
        }
        Ok(())
    }

    /// Stricter check applied to user-facing create/update requests.
    pub fn validate_for_publish(&self) -> Result<(), ProcessValidationError> {
        self.validate()?;
        if self.name.trim().is_empty() {
            return Err(ProcessValidationError::MissingName);
        }
        Ok(())
    }

    pub fn is_stamped(&self) -> bool {
        self.last_updated_unix != 0
    }

    /// Sets `last_updated_unix` to `now` unless the document already carries a stamp.
    pub fn stamp_if_unset(&mut self, now: i64) {
        if !self.is_stamped() {
            self.last_updated_unix = now;
        }
    }
}

/// Current wall-clock time in Unix seconds.
///
/// Clocks before the epoch collapse to `0`, which callers treat as unset.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
