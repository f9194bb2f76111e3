//! Core use-case services.
//!
//! # Responsibility
//! - Apply commands to the document store.
//! - Gate API-layer use-cases behind the permission authority.
//! - Keep the store and the authority converged in the background.

pub mod backfill;
pub mod materializer;
pub mod process_control;
pub mod reconciler;
