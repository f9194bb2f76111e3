//! One-shot permission backfill for documents stored before grants existed.
//!
//! # Invariants
//! - Only documents without any authority resource receive a grant.
//! - Running the backfill twice changes nothing the second time.

use crate::authority::PermissionAuthority;
use crate::model::permission::ResourcePermissions;
use crate::repo::process_repo::ListOptions;
use crate::service::materializer::Materializer;
use crate::service::process_control::ControlResult;
use log::{info, warn};

const BACKFILL_BATCH_SIZE: u32 = 1000;

/// Counts from one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub scanned: usize,
    pub granted: usize,
}

/// Seeds the default owner grant for every stored document the authority
/// does not know.
pub async fn run_permission_backfill(
    materializer: &Materializer,
    authority: &dyn PermissionAuthority,
    topic: &str,
) -> ControlResult<BackfillReport> {
    info!(
        "event=permission_backfill module=service status=start topic={}",
        topic
    );
    let mut report = BackfillReport::default();
    let mut options = ListOptions {
        limit: Some(BACKFILL_BATCH_SIZE),
        ..ListOptions::default()
    };
    loop {
        let page = options.clone();
        let batch = materializer
            .run_blocking(move |m| m.repository().list_processes(&page))
            .await?
            .items;
        if batch.is_empty() {
            break;
        }
        options.offset += BACKFILL_BATCH_SIZE;
        for document in batch {
            report.scanned += 1;
            if authority.get_resource(topic, &document.id).await?.is_some() {
                continue;
            }
            if document.owner.is_empty() {
                warn!(
                    "event=permission_backfill module=service status=warn id={} reason=missing_owner",
                    document.id
                );
            }
            authority
                .set_permission(
                    topic,
                    &document.id,
                    &ResourcePermissions::owner_default(&document.owner),
                )
                .await?;
            report.granted += 1;
        }
    }
    info!(
        "event=permission_backfill module=service status=ok topic={} scanned={} granted={}",
        topic, report.scanned, report.granted
    );
    Ok(report)
}
