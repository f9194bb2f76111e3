//! Apply layer between decoded commands and the document store.
//!
//! # Responsibility
//! - Turn commands into keyed store writes.
//! - Expose the id listings the reconciler diffs.
//!
//! # Invariants
//! - Applying the same command twice leaves the store in the same state.
//! - PUT stamps `last_updated_unix` only when the document carries no stamp.
//! - DELETE of a missing id succeeds.
//! - Async callers reach the store through `run_blocking`, never on a runtime
//!   worker thread.

use crate::model::command::Command;
use crate::model::process::{unix_now, ProcessDocument, ProcessId};
use crate::repo::process_repo::{ProcessRepository, RepoError, RepoResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a single apply did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted,
    Deleted,
    AlreadyAbsent,
}

/// Idempotent writer over a shared repository.
#[derive(Clone)]
pub struct Materializer {
    repo: Arc<dyn ProcessRepository>,
}

impl Materializer {
    pub fn new(repo: Arc<dyn ProcessRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn ProcessRepository> {
        &self.repo
    }

    /// Runs `call` on the blocking pool with a clone of this materializer.
    pub async fn run_blocking<T, F>(&self, call: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Materializer) -> RepoResult<T> + Send + 'static,
    {
        let materializer = self.clone();
        tokio::task::spawn_blocking(move || call(&materializer))
            .await
            .map_err(|err| RepoError::Worker(err.to_string()))?
    }

    pub fn apply(&self, command: &Command) -> RepoResult<ApplyOutcome> {
        match command {
            Command::Put { document, .. } => {
                self.upsert(document)?;
                Ok(ApplyOutcome::Upserted)
            }
            Command::Delete { id, .. } => self.remove(id),
        }
    }

    /// Full replace of `document`, stamping it first when unstamped.
    pub fn upsert(&self, document: &ProcessDocument) -> RepoResult<()> {
        if document.is_stamped() {
            return self.repo.upsert_process(document);
        }
        let mut stamped = document.clone();
        stamped.stamp_if_unset(unix_now());
        self.repo.upsert_process(&stamped)
    }

    pub fn remove(&self, id: &str) -> RepoResult<ApplyOutcome> {
        if self.repo.delete_process(id)? {
            Ok(ApplyOutcome::Deleted)
        } else {
            Ok(ApplyOutcome::AlreadyAbsent)
        }
    }

    pub fn exists(&self, id: &str) -> RepoResult<bool> {
        Ok(self.repo.get_process(id)?.is_some())
    }

    pub fn list_all_ids(&self) -> RepoResult<BTreeSet<ProcessId>> {
        self.repo.list_all_ids()
    }

    pub fn list_ids_not_updated_since(&self, cutoff_unix: i64) -> RepoResult<BTreeSet<ProcessId>> {
        self.repo.list_ids_not_updated_since(cutoff_unix)
    }
}
