//! Domain model shared by the write pipeline, the reconciler and the API layer.
//!
//! # Responsibility
//! - Define the process document owned by the materializer.
//! - Define the command sum type carried through the ordered log.
//! - Define permission vocabulary used against the permission authority.
//!
//! # Invariants
//! - Every process document is identified by a stable, non-empty id.
//! - Commands are decoded once at the log boundary; nothing downstream parses
//!   command-kind strings.

pub mod caller;
pub mod command;
pub mod permission;
pub mod process;
