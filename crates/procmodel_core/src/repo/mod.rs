//! Repository layer over the document store.
//!
//! # Responsibility
//! - Define the data access contract used by the materializer and reconciler.
//! - Isolate SQLite query details from pipeline orchestration.
//!
//! # Invariants
//! - Repository writes enforce `ProcessDocument::validate()` before persistence.
//! - Repository deletes are idempotent.

pub mod process_repo;
