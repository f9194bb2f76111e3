//! Schema steps for the `processes` table.
//!
//! # Invariants
//! - Steps are numbered from 1 without gaps and never edited once released.
//! - All pending steps of one open run inside a single transaction.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

struct SchemaStep {
    version: u32,
    label: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        label: "processes",
        sql: include_str!("0001_processes.sql"),
    },
    SchemaStep {
        version: 2,
        label: "process_indexes",
        sql: include_str!("0002_process_indexes.sql"),
    },
];

/// Schema version this binary writes.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// Versions `apply_migrations` would run on `conn`, oldest first.
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the file is newer than this binary.
pub fn pending_versions(conn: &Connection) -> DbResult<Vec<u32>> {
    let stored = current_user_version(conn)?;
    let latest = latest_version();
    if stored > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: stored,
            latest_supported: latest,
        });
    }
    Ok(SCHEMA_STEPS
        .iter()
        .map(|step| step.version)
        .filter(|version| *version > stored)
        .collect())
}

/// Brings `conn` to `latest_version()`.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let pending = pending_versions(conn)?;
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in SCHEMA_STEPS
        .iter()
        .filter(|step| pending.contains(&step.version))
    {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
        info!(
            "event=db_migrate module=db status=ok version={} step={}",
            step.version, step.label
        );
    }
    tx.commit()?;
    Ok(())
}

/// Schema version recorded in the file; `0` for a fresh database.
pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))?)
}
