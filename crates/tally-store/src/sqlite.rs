//! SQLite-backed session store.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::record::{SessionRecord, normalize_user_key};
use crate::storage::{RecordState, SessionFilter, SessionOrder, SessionStore};

// ─────────────────────────────────────────────────────────────────────────────
// Schema Version
// ─────────────────────────────────────────────────────────────────────────────

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 2;

const SELECT_COLUMNS: &str = "SELECT id, session_id, user_key, started_at, ended_at FROM sessions";

/// Thin repository over SQLite for session history.
///
/// Thread-safe via internal `Mutex<Connection>`.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;

        info!("Session store opened at {:?}", path);
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        if current_version >= SCHEMA_VERSION {
            debug!("Schema up to date (version {})", current_version);
            return Ok(());
        }

        info!(
            "Migrating schema from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL UNIQUE,
                    user_key TEXT NOT NULL,
                    user_norm TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT
                );
                "#,
            )?;
        }
        if current_version < 2 {
            conn.execute_batch(
                r#"
                CREATE INDEX IF NOT EXISTS idx_sessions_user_started
                    ON sessions(user_norm, started_at);
                CREATE INDEX IF NOT EXISTS idx_sessions_user_ended
                    ON sessions(user_norm, ended_at);
                "#,
            )?;
        }

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!("Schema migrated (version {})", SCHEMA_VERSION);
        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn save_all(&self, records: &mut [SessionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records.iter() {
            record.check()?;
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut assigned = Vec::with_capacity(records.len());

        {
            let mut update = tx.prepare_cached(
                "UPDATE sessions SET ended_at = COALESCE(?1, ended_at) WHERE id = ?2",
            )?;
            let mut upsert = tx.prepare_cached(
                "INSERT INTO sessions (session_id, user_key, user_norm, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id) DO UPDATE
                     SET ended_at = COALESCE(excluded.ended_at, sessions.ended_at)
                 RETURNING id",
            )?;

            for record in records.iter() {
                let ended = record.ended_at.as_ref().map(format_dt);
                let id = match record.id {
                    Some(id) => {
                        if update.execute(params![ended, id])? == 0 {
                            // Dropping `tx` without commit rolls the batch back.
                            return Err(StoreError::Conflict { id });
                        }
                        id
                    }
                    None => upsert.query_row(
                        params![
                            record.session_id.to_string(),
                            record.user_key,
                            normalize_user_key(&record.user_key),
                            format_dt(&record.started_at),
                            ended,
                        ],
                        |row| row.get(0),
                    )?,
                };
                assigned.push(id);
            }
        }

        tx.commit()?;

        for (record, id) in records.iter_mut().zip(assigned) {
            record.id = Some(id);
        }
        debug!(records = records.len(), "Committed session batch");
        Ok(())
    }

    fn find_one(
        &self,
        filter: &SessionFilter,
        order: SessionOrder,
    ) -> Result<Option<SessionRecord>> {
        let (where_clause, args) = build_where(filter);
        let order_clause = match order {
            SessionOrder::NewestStart => "ORDER BY started_at DESC, id DESC",
            SessionOrder::NewestEnd => "ORDER BY ended_at DESC, id DESC",
        };
        let sql = format!("{SELECT_COLUMNS}{where_clause} {order_clause} LIMIT 1");

        let conn = self.conn.lock();
        let record = conn
            .query_row(&sql, params_from_iter(args.iter()), row_to_record)
            .optional()?;
        Ok(record)
    }

    fn find_all(
        &self,
        filter: &SessionFilter,
        visit: &mut dyn FnMut(SessionRecord),
    ) -> Result<usize> {
        let (where_clause, args) = build_where(filter);
        let sql = format!("{SELECT_COLUMNS}{where_clause} ORDER BY id");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter()))?;

        let mut count = 0;
        while let Some(row) = rows.next()? {
            visit(row_to_record(row)?);
            count += 1;
        }
        Ok(count)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn build_where(filter: &SessionFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut args = Vec::new();

    if let Some(user_key) = &filter.user_key {
        args.push(normalize_user_key(user_key));
        conditions.push(format!("user_norm = ?{}", args.len()));
    }
    match filter.state {
        RecordState::Any => {}
        RecordState::Open => conditions.push("ended_at IS NULL".to_string()),
        RecordState::Closed => {
            conditions.push("started_at IS NOT NULL AND ended_at IS NOT NULL".to_string())
        }
    }

    if conditions.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), args)
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let session_id: String = row.get(1)?;
    let session_id = Uuid::parse_str(&session_id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    Ok(SessionRecord {
        id: Some(row.get(0)?),
        session_id,
        user_key: row.get(2)?,
        started_at: parse_dt(3, &row.get::<_, String>(3)?)?,
        ended_at: row
            .get::<_, Option<String>>(4)?
            .map(|s| parse_dt(4, &s))
            .transpose()?,
    })
}
