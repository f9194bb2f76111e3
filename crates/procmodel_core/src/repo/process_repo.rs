//! Process document repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide keyed upsert/delete/read APIs over the `processes` table.
//! - Provide the id listings the reconciler diffs against the authority.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Write paths call `ProcessDocument::validate()` before SQL mutations.
//! - Upsert is a full replace; repeated upserts of the same document are no-ops.
//! - Deleting a missing id succeeds.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::migrations::{current_user_version, latest_version};
use crate::db::DbError;
use crate::model::process::{ProcessDocument, ProcessId, ProcessValidationError};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};

const PROCESS_TABLE: &str = "processes";
const PROCESS_COLUMNS: &[&str] = &[
    "id",
    "name",
    "owner",
    "bpmn_xml",
    "svg_xml",
    "publish",
    "publish_date",
    "description",
    "last_updated_unix",
];
const PROCESS_SELECT_SQL: &str = "SELECT
    id,
    name,
    owner,
    bpmn_xml,
    svg_xml,
    publish,
    publish_date,
    description,
    last_updated_unix
FROM processes";
const DEFAULT_SORT: &str = "name.asc";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for process persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(ProcessValidationError),
    Db(DbError),
    InvalidData(String),
    InvalidQuery(String),
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    LockPoisoned,
    /// The blocking worker running a store call panicked or was cancelled.
    Worker(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted process data: {message}"),
            Self::InvalidQuery(message) => write!(f, "invalid process query: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "connection schema version {actual_version} does not match expected {expected_version}"
            ),
            Self::MissingRequiredTable(table) => write!(f, "required table `{table}` is missing"),
            Self::MissingRequiredColumn { table, column } => {
                write!(f, "required column `{table}.{column}` is missing")
            }
            Self::LockPoisoned => write!(f, "document store connection lock is poisoned"),
            Self::Worker(message) => write!(f, "document store worker failed: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProcessValidationError> for RepoError {
    fn from(value: ProcessValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Query options for listing process documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub limit: Option<u32>,
    pub offset: u32,
    /// `<field>.asc` or `<field>.desc`; defaults to `name.asc`.
    pub sort_by: Option<String>,
    /// Case-insensitive substring matched against name and description.
    pub search: Option<String>,
    /// Restricts results to these ids. `Some(empty)` matches nothing.
    pub ids: Option<Vec<ProcessId>>,
}

/// One page of a list query plus the unpaged match count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessPage {
    pub items: Vec<ProcessDocument>,
    pub total: u64,
}

/// Repository interface over the document store.
///
/// Implementations are shared between the command consumer, the reconciler
/// and the API read path, so they must be safe to call concurrently.
pub trait ProcessRepository: Send + Sync {
    fn upsert_process(&self, process: &ProcessDocument) -> RepoResult<()>;
    /// Returns whether a row was removed.
    fn delete_process(&self, id: &str) -> RepoResult<bool>;
    fn get_process(&self, id: &str) -> RepoResult<Option<ProcessDocument>>;
    fn list_processes(&self, options: &ListOptions) -> RepoResult<ProcessPage>;
    fn list_public_processes(&self) -> RepoResult<Vec<ProcessDocument>>;
    fn list_all_ids(&self) -> RepoResult<BTreeSet<ProcessId>>;
    /// Ids whose `last_updated_unix` is unset or older than `cutoff_unix`.
    fn list_ids_not_updated_since(&self, cutoff_unix: i64) -> RepoResult<BTreeSet<ProcessId>>;
}

/// SQLite-backed process repository owning one serialized connection.
pub struct SqliteProcessRepository {
    conn: Mutex<Connection>,
}

impl SqliteProcessRepository {
    /// Wraps a connection after checking that migrations were applied.
    ///
    /// # Errors
    /// - `UninitializedConnection` when `user_version` differs from the latest migration.
    /// - `MissingRequiredTable` / `MissingRequiredColumn` when the schema is incomplete.
    pub fn try_new(conn: Connection) -> RepoResult<Self> {
        let actual_version = current_user_version(&conn)?;
        let expected_version = latest_version();
        if actual_version != expected_version {
            return Err(RepoError::UninitializedConnection {
                expected_version,
                actual_version,
            });
        }
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> RepoResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RepoError::LockPoisoned)
    }
}

impl ProcessRepository for SqliteProcessRepository {
    fn upsert_process(&self, process: &ProcessDocument) -> RepoResult<()> {
        process.validate()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO processes (
                id,
                name,
                owner,
                bpmn_xml,
                svg_xml,
                publish,
                publish_date,
                description,
                last_updated_unix
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner = excluded.owner,
                bpmn_xml = excluded.bpmn_xml,
                svg_xml = excluded.svg_xml,
                publish = excluded.publish,
                publish_date = excluded.publish_date,
                description = excluded.description,
                last_updated_unix = excluded.last_updated_unix;",
            params![
                process.id.as_str(),
                process.name.as_str(),
                process.owner.as_str(),
                process.bpmn_xml.as_str(),
                process.svg_xml.as_str(),
                bool_to_int(process.publish),
                process.publish_date.as_str(),
                process.description.as_str(),
                process.last_updated_unix,
            ],
        )?;
        Ok(())
    }

    fn delete_process(&self, id: &str) -> RepoResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM processes WHERE id = ?1;", [id])?;
        Ok(changed > 0)
    }

    fn get_process(&self, id: &str) -> RepoResult<Option<ProcessDocument>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{PROCESS_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_process_row(row)?));
        }
        Ok(None)
    }

    fn list_processes(&self, options: &ListOptions) -> RepoResult<ProcessPage> {
        let sort = SortKey::parse(options.sort_by.as_deref().unwrap_or(DEFAULT_SORT))?;
        if options.ids.as_ref().is_some_and(Vec::is_empty) {
            return Ok(ProcessPage::default());
        }

        let mut filter = String::from(" WHERE 1 = 1");
        let mut filter_values: Vec<Value> = Vec::new();

        if let Some(ids) = &options.ids {
            let placeholders = vec!["?"; ids.len()].join(", ");
            filter.push_str(&format!(" AND id IN ({placeholders})"));
            filter_values.extend(ids.iter().map(|id| Value::Text(id.clone())));
        }

        if let Some(search) = options.search.as_deref().map(str::trim) {
            if !search.is_empty() {
                let pattern = format!("%{}%", escape_like(search));
                filter.push_str(
                    " AND (name LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\')",
                );
                filter_values.push(Value::Text(pattern.clone()));
                filter_values.push(Value::Text(pattern));
            }
        }

        let conn = self.lock()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM processes{filter};"),
            params_from_iter(filter_values.iter()),
            |row| row.get(0),
        )?;

        let mut sql = format!(
            "{PROCESS_SELECT_SQL}{filter} ORDER BY {} {}, id ASC",
            sort.column,
            sort.direction()
        );
        let mut bind_values = filter_values;
        if let Some(limit) = options.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
            if options.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(Value::Integer(i64::from(options.offset)));
            }
        } else if options.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(Value::Integer(i64::from(options.offset)));
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_process_row(row)?);
        }

        Ok(ProcessPage {
            items,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    fn list_public_processes(&self) -> RepoResult<Vec<ProcessDocument>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{PROCESS_SELECT_SQL} WHERE publish = 1 ORDER BY name ASC, id ASC;"
        ))?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_process_row(row)?);
        }
        Ok(items)
    }

    fn list_all_ids(&self) -> RepoResult<BTreeSet<ProcessId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM processes;")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }

    fn list_ids_not_updated_since(&self, cutoff_unix: i64) -> RepoResult<BTreeSet<ProcessId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM processes
             WHERE last_updated_unix = 0 OR last_updated_unix < ?1;",
        )?;
        let ids = stmt
            .query_map([cutoff_unix], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }
}

/// Whitelisted sort column plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SortKey {
    column: &'static str,
    descending: bool,
}

impl SortKey {
    fn parse(value: &str) -> RepoResult<Self> {
        let value = value.trim();
        let (field, descending) = if let Some(field) = value.strip_suffix(".desc") {
            (field, true)
        } else if let Some(field) = value.strip_suffix(".asc") {
            (field, false)
        } else {
            (value, false)
        };
        let column = PROCESS_COLUMNS
            .iter()
            .copied()
            .find(|column| *column == field)
            .ok_or_else(|| RepoError::InvalidQuery(format!("unsupported sort field `{field}`")))?;
        Ok(Self { column, descending })
    }

    fn direction(&self) -> &'static str {
        if self.descending {
            "DESC"
        } else {
            "ASC"
        }
    }
}

fn ensure_schema(conn: &Connection) -> RepoResult<()> {
    let table_exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1
        );",
        [PROCESS_TABLE],
        |row| row.get(0),
    )?;
    if table_exists != 1 {
        return Err(RepoError::MissingRequiredTable(PROCESS_TABLE));
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({PROCESS_TABLE});"))?;
    let present = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    for column in PROCESS_COLUMNS {
        if !present.contains(*column) {
            return Err(RepoError::MissingRequiredColumn {
                table: PROCESS_TABLE,
                column,
            });
        }
    }
    Ok(())
}

fn parse_process_row(row: &Row<'_>) -> RepoResult<ProcessDocument> {
    let publish = match row.get::<_, i64>("publish")? {
        0 => false,
        1 => true,
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid publish value `{other}` in processes.publish"
            )));
        }
    };

    let process = ProcessDocument {
        id: row.get("id")?,
        name: row.get("name")?,
        owner: row.get("owner")?,
        bpmn_xml: row.get("bpmn_xml")?,
        svg_xml: row.get("svg_xml")?,
        publish,
        publish_date: row.get("publish_date")?,
        description: row.get("description")?,
        last_updated_unix: row.get("last_updated_unix")?,
    };
    process.validate()?;
    Ok(process)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
