//! Drift healing between the document store and the permission authority.
//!
//! # Responsibility
//! - Remove authority resources whose document no longer exists.
//! - Remove documents that never received an authority resource once they are
//!   older than the grace window.
//!
//! # Invariants
//! - At most one pass runs at a time per reconciler; overlapping calls fail fast.
//! - Grant removal runs before document removal.
//! - A grant removed while its document is being created is restored.
//! - Documents updated within the grace window are never removed.
//! - A document is removed only after the authority confirms it has no grant.
//! - A failed pass is aborted and its counts discarded; the next tick retries.

use crate::authority::{collect_all_resource_ids, AuthorityError, PermissionAuthority};
use crate::lifecycle::ShutdownSignal;
use crate::model::process::unix_now;
use crate::repo::process_repo::RepoError;
use crate::service::materializer::{ApplyOutcome, Materializer};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const DEFAULT_GRACE: Duration = Duration::from_secs(60);
const DEFAULT_PAGE_SIZE: u64 = 1000;

/// Counts from one successful pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub permissions_removed: usize,
    pub documents_removed: usize,
}

#[derive(Debug)]
pub enum ReconcileError {
    InProgress,
    Authority(AuthorityError),
    Repo(RepoError),
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "a cleanup pass is already running"),
            Self::Authority(err) => write!(f, "cleanup aborted: {err}"),
            Self::Repo(err) => write!(f, "cleanup aborted: {err}"),
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InProgress => None,
            Self::Authority(err) => Some(err),
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<AuthorityError> for ReconcileError {
    fn from(value: AuthorityError) -> Self {
        Self::Authority(value)
    }
}

impl From<RepoError> for ReconcileError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Diff-and-repair engine over the store and the authority.
pub struct Reconciler {
    materializer: Materializer,
    authority: Arc<dyn PermissionAuthority>,
    topic: String,
    grace: Duration,
    page_size: u64,
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        materializer: Materializer,
        authority: Arc<dyn PermissionAuthority>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            materializer,
            authority,
            topic: topic.into(),
            grace: DEFAULT_GRACE,
            page_size: DEFAULT_PAGE_SIZE,
            running: Mutex::new(()),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Page size for authority listings; `0` reads everything in one call.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Runs one reconciliation pass.
    pub async fn cleanup(&self) -> Result<CleanupReport, ReconcileError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| ReconcileError::InProgress)?;

        let auth_ids =
            collect_all_resource_ids(self.authority.as_ref(), &self.topic, self.page_size).await?;
        let doc_ids = self
            .materializer
            .run_blocking(|m| m.list_all_ids())
            .await?;

        let mut report = CleanupReport::default();
        for id in auth_ids.difference(&doc_ids) {
            if self.remove_orphan_grant(id).await? {
                report.permissions_removed += 1;
            }
        }

        let grace_secs = i64::try_from(self.grace.as_secs()).unwrap_or(i64::MAX);
        let cutoff = unix_now().saturating_sub(grace_secs);
        let stale = self
            .materializer
            .run_blocking(move |m| m.list_ids_not_updated_since(cutoff))
            .await?;
        for id in doc_ids.difference(&auth_ids) {
            if !stale.contains(id) {
                continue;
            }
            // Paged listings can skip ids when grants are removed mid-listing.
            if self.authority.get_resource(&self.topic, id).await?.is_some() {
                continue;
            }
            let key = id.clone();
            if self.materializer.run_blocking(move |m| m.remove(&key)).await?
                == ApplyOutcome::Deleted
            {
                report.documents_removed += 1;
            }
        }
        Ok(report)
    }

    /// Removes the grant on `id` unless its document exists. A document that
    /// lands while the grant is being removed gets the grant back.
    async fn remove_orphan_grant(&self, id: &str) -> Result<bool, ReconcileError> {
        let Some(grant) = self.authority.get_resource(&self.topic, id).await? else {
            return Ok(false);
        };
        if self.document_exists(id).await? {
            return Ok(false);
        }
        self.authority.remove_resource(&self.topic, id).await?;
        if self.document_exists(id).await? {
            self.authority.set_permission(&self.topic, id, &grant).await?;
            warn!(
                "event=cleanup_grant module=service status=warn id={} action=restored",
                id
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn document_exists(&self, id: &str) -> Result<bool, ReconcileError> {
        let key = id.to_string();
        Ok(self
            .materializer
            .run_blocking(move |m| m.exists(&key))
            .await?)
    }

    /// Runs `cleanup` every `interval` until shutdown; the first tick fires one
    /// interval after start.
    pub fn spawn_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "event=cleanup_loop module=service status=start topic={} interval_secs={}",
                self.topic,
                interval.as_secs()
            );
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.requested() => break,
                    _ = ticker.tick() => {}
                }
                let started = Instant::now();
                match self.cleanup().await {
                    Ok(report) => info!(
                        "event=cleanup_pass module=service status=ok duration_ms={} permissions_removed={} documents_removed={}",
                        started.elapsed().as_millis(),
                        report.permissions_removed,
                        report.documents_removed
                    ),
                    Err(ReconcileError::InProgress) => warn!(
                        "event=cleanup_pass module=service status=skipped reason=in_progress"
                    ),
                    Err(err) => error!(
                        "event=cleanup_pass module=service status=error error={}",
                        err
                    ),
                }
            }
            info!(
                "event=cleanup_loop module=service status=ok topic={} stopped=true",
                self.topic
            );
        })
    }
}
