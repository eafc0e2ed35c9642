//! Store: SQLite-backed persistence of executions, results and assets.
//!
//! Provides:
//! - Atomic get-or-create of executions keyed by the execution key
//! - Append-only result history per execution
//! - Ordered asset recording for successful results

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use percent_encoding::percent_decode_str;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;

use super::rows::{ExecutionResultRow, ExecutionRow, NewExecution, ProviderRow};
use super::schema::REF_SCHEMA;
use crate::errors::{RefError, RefResult};
use crate::metrics::{AssetType, ExecutionResult, ResultAsset};

/// How long a connection waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// Database locked by another connection past the busy timeout.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Insert race on an execution key that the fetch-existing retry could not resolve.
    #[error("conflicting insert for execution '{key}'")]
    Conflict { key: String },

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store connection lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Busy(e.to_string())
            }
            Some(ErrorCode::ConstraintViolation) => StoreError::Constraint(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_) | StoreError::Constraint(_))
    }
}

/// SQLite-backed execution store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Create store from existing connection (for multi-connection tests).
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the store named by a `sqlite:///` database URL.
    ///
    /// `sqlite:///relative/path.db`, `sqlite:////absolute/path.db` and
    /// `sqlite:///:memory:` are accepted; the parent directory of a file
    /// database is created when missing.
    pub fn from_database_url(database_url: &str) -> RefResult<Self> {
        match parse_database_url(database_url)? {
            DatabaseLocation::Memory => Ok(Self::memory()?),
            DatabaseLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RefError::configuration(format!(
                            "cannot create database directory {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                Ok(Self::open(&path)?)
            }
        }
    }

    fn init_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()));
        conn.execute_batch(REF_SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run a store call on the blocking pool, bounded by `timeout`.
    ///
    /// On timeout the call is abandoned; it still completes or rolls back on
    /// its own connection.
    pub async fn call<T, F>(&self, timeout: Duration, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        let handle = tokio::task::spawn_blocking(move || f(&store));
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StoreError::Database(format!("store task failed: {join}"))),
            Err(_) => Err(StoreError::Timeout(timeout)),
        }
    }

    /// Insert or refresh the provider row. Returns its id.
    pub fn upsert_provider(&self, slug: &str, name: &str, version: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO provider(slug, name, version, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                updated_at = excluded.updated_at",
            params![slug, name, version, now],
        )?;
        let id = conn.query_row(
            "SELECT id FROM provider WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn providers(&self) -> Result<Vec<ProviderRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, slug, name, version, updated_at FROM provider ORDER BY slug")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProviderRow {
                    id: row.get(0)?,
                    slug: row.get(1)?,
                    name: row.get(2)?,
                    version: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Return the execution for `new.key`, inserting it when absent.
    ///
    /// The boolean is true when this call created the row. A uniqueness
    /// violation or busy database is retried once as a plain fetch.
    pub fn get_or_create_execution(
        &self,
        new: &NewExecution<'_>,
    ) -> Result<(ExecutionRow, bool), StoreError> {
        let conn = self.lock()?;

        match Self::immediate(&conn, |conn| Self::get_or_create_inner(conn, new)) {
            Ok(found) => Ok(found),
            Err(e) if e.is_retryable() => {
                tracing::debug!(key = new.key, error = %e, "execution insert raced, fetching existing row");
                match Self::execution_by_key(&conn, new.key) {
                    Ok(Some(row)) => Ok((row, false)),
                    _ => Err(StoreError::Conflict {
                        key: new.key.to_string(),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn get_or_create_inner(
        conn: &Connection,
        new: &NewExecution<'_>,
    ) -> Result<(ExecutionRow, bool), StoreError> {
        if let Some(existing) = Self::execution_by_key(conn, new.key)? {
            return Ok((existing, false));
        }

        let created_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO execution(metric_slug, provider_slug, key, dataset_fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.metric_slug,
                new.provider_slug,
                new.key,
                new.dataset_fingerprint,
                created_at
            ],
        )?;

        Ok((
            ExecutionRow {
                id: conn.last_insert_rowid(),
                metric_slug: new.metric_slug.to_string(),
                provider_slug: new.provider_slug.to_string(),
                key: new.key.to_string(),
                dataset_fingerprint: new.dataset_fingerprint.to_string(),
                created_at,
            },
            true,
        ))
    }

    /// Append a result to an execution's history.
    pub fn append_result(
        &self,
        execution_id: i64,
        result: &ExecutionResult,
    ) -> Result<ExecutionResultRow, StoreError> {
        let conn = self.lock()?;
        Self::insert_result(&conn, execution_id, result)
    }

    /// Append a result together with its assets in one transaction.
    ///
    /// A successful result also stamps `dataset_fingerprint` on the
    /// execution, marking that dataset set as covered. Nothing is written
    /// when any insert fails.
    pub fn append_result_with_assets(
        &self,
        execution_id: i64,
        dataset_fingerprint: &str,
        result: &ExecutionResult,
    ) -> Result<ExecutionResultRow, StoreError> {
        let conn = self.lock()?;
        Self::immediate(&conn, |conn| {
            let row = Self::insert_result(conn, execution_id, result)?;
            if result.successful {
                Self::insert_assets(conn, row.id, &result.assets)?;
                conn.execute(
                    "UPDATE execution SET dataset_fingerprint = ?1 WHERE id = ?2",
                    params![dataset_fingerprint, execution_id],
                )?;
            }
            Ok(row)
        })
    }

    /// Record the assets of a result, in order, in one transaction.
    pub fn record_assets(&self, result_id: i64, assets: &[ResultAsset]) -> Result<(), StoreError> {
        if assets.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        Self::immediate(&conn, |conn| Self::insert_assets(conn, result_id, assets))
    }

    fn insert_result(
        conn: &Connection,
        execution_id: i64,
        result: &ExecutionResult,
    ) -> Result<ExecutionResultRow, StoreError> {
        let created_at = Utc::now().to_rfc3339();
        let bundle_filename = result
            .bundle_filename
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let output_fragment = result.output_fragment.to_string_lossy().into_owned();

        conn.execute(
            "INSERT INTO execution_result(execution_id, successful, bundle_filename, output_fragment, diagnostics, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                execution_id,
                result.successful,
                bundle_filename,
                output_fragment,
                result.diagnostics,
                created_at
            ],
        )?;

        Ok(ExecutionResultRow {
            id: conn.last_insert_rowid(),
            execution_id,
            successful: result.successful,
            bundle_filename,
            output_fragment,
            diagnostics: result.diagnostics.clone(),
            created_at,
        })
    }

    fn insert_assets(
        conn: &Connection,
        result_id: i64,
        assets: &[ResultAsset],
    ) -> Result<(), StoreError> {
        let mut stmt = conn.prepare(
            "INSERT INTO execution_result_asset(execution_result_id, asset_type, short_name, filename, long_name, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for asset in assets {
            stmt.execute(params![
                result_id,
                asset.asset_type.as_str(),
                asset.short_name,
                asset.filename.to_string_lossy(),
                asset.long_name,
                asset.description,
            ])?;
        }
        Ok(())
    }

    pub fn get_execution(&self, key: &str) -> Result<Option<ExecutionRow>, StoreError> {
        let conn = self.lock()?;
        Self::execution_by_key(&conn, key)
    }

    /// All executions ordered by provider, metric, then key.
    pub fn executions(&self) -> Result<Vec<ExecutionRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, metric_slug, provider_slug, key, dataset_fingerprint, created_at
             FROM execution
             ORDER BY provider_slug, metric_slug, key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ExecutionRow {
                    id: row.get(0)?,
                    metric_slug: row.get(1)?,
                    provider_slug: row.get(2)?,
                    key: row.get(3)?,
                    dataset_fingerprint: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn results_for_execution(
        &self,
        execution_id: i64,
    ) -> Result<Vec<ExecutionResultRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, successful, bundle_filename, output_fragment, diagnostics, created_at
             FROM execution_result
             WHERE execution_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(ExecutionResultRow {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    successful: row.get(2)?,
                    bundle_filename: row.get(3)?,
                    output_fragment: row.get(4)?,
                    diagnostics: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Assets of a result in insertion order.
    pub fn assets_for_result(&self, result_id: i64) -> Result<Vec<ResultAsset>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT asset_type, short_name, filename, long_name, description
             FROM execution_result_asset
             WHERE execution_result_id = ?1
             ORDER BY id ASC",
        )?;
        let raw = stmt
            .query_map(params![result_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(asset_type, short_name, filename, long_name, description)| {
                let asset_type = AssetType::parse(&asset_type).ok_or_else(|| {
                    StoreError::Database(format!("unknown asset type '{asset_type}'"))
                })?;
                Ok(ResultAsset {
                    asset_type,
                    short_name,
                    filename: PathBuf::from(filename),
                    long_name,
                    description,
                })
            })
            .collect()
    }

    pub fn has_successful_result(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT r.id FROM execution_result r
                 JOIN execution e ON r.execution_id = e.id
                 WHERE e.key = ?1 AND r.successful = 1
                 LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_executions(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let n = conn.query_row("SELECT COUNT(*) FROM execution", [], |row| row.get(0))?;
        Ok(n)
    }

    fn execution_by_key(conn: &Connection, key: &str) -> Result<Option<ExecutionRow>, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, metric_slug, provider_slug, key, dataset_fingerprint, created_at
                 FROM execution WHERE key = ?1",
                params![key],
                |row| {
                    Ok(ExecutionRow {
                        id: row.get(0)?,
                        metric_slug: row.get(1)?,
                        provider_slug: row.get(2)?,
                        key: row.get(3)?,
                        dataset_fingerprint: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn immediate<T>(
        conn: &Connection,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        // BEGIN IMMEDIATE acquires write lock immediately
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = f(conn);
        match &result {
            Ok(_) => {
                if let Err(e) = conn.execute("COMMIT", []) {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e.into());
                }
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }
        result
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

fn parse_database_url(database_url: &str) -> RefResult<DatabaseLocation> {
    let parsed = url::Url::parse(database_url).map_err(|e| {
        RefError::configuration(format!("invalid database url '{database_url}': {e}"))
    })?;
    if parsed.scheme() != "sqlite" {
        return Err(RefError::configuration(format!(
            "unsupported database scheme '{}' in '{database_url}'; only sqlite is supported",
            parsed.scheme()
        )));
    }

    // sqlite:///rel -> "/rel", sqlite:////abs -> "//abs"
    let encoded = parsed.path().strip_prefix('/').unwrap_or(parsed.path());
    let decoded = percent_decode_str(encoded).decode_utf8().map_err(|e| {
        RefError::configuration(format!("invalid database path in '{database_url}': {e}"))
    })?;
    let path: &str = &decoded;
    if path.is_empty() {
        return Err(RefError::configuration(format!(
            "database url '{database_url}' has no path"
        )));
    }
    if path == ":memory:" {
        return Ok(DatabaseLocation::Memory);
    }
    Ok(DatabaseLocation::File(PathBuf::from(path)))
}
