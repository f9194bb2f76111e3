//! Core domain logic for the process model repository.
//!
//! Writes travel through an ordered command log and are applied by a
//! background consumer; a reconciler keeps the document store and the
//! permission authority converged.

pub mod authority;
pub mod config;
pub mod db;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod repo;
pub mod runtime;
pub mod service;
pub mod source;

pub use authority::{
    AuthorityError, HttpPermissionAuthority, InMemoryAuthority, PermissionAuthority,
};
pub use config::{CommandLogBackend, ConfigError, ServiceConfig};
pub use lifecycle::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use logging::{
    default_log_level, init_logging, logging_status, LogDestination, LoggingError,
};
pub use model::caller::Caller;
pub use model::command::{Command, CommandCodecError, CommandKind};
pub use model::permission::{
    PageOptions, Permission, PermissionsMap, ResourcePermissions, TopicRegistration,
};
pub use model::process::{ProcessDocument, ProcessId, ProcessValidationError};
pub use repo::process_repo::{
    ListOptions, ProcessPage, ProcessRepository, RepoError, RepoResult, SqliteProcessRepository,
};
pub use runtime::{exit_process_on_fatal, start, Collaborators, ServiceHandle, StartError};
pub use service::backfill::{run_permission_backfill, BackfillReport};
pub use service::materializer::{ApplyOutcome, Materializer};
pub use service::process_control::{ControlError, ProcessController, PublicCommand};
pub use service::reconciler::{CleanupReport, ReconcileError, Reconciler};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
