//! Durable Event History
//!
//! Append-only event log backed by `rusqlite`, with cursor pagination and
//! the usage aggregations consumed by the dashboard endpoints.
//!
//! # Schema
//!
//! Timestamps are stored as TEXT in RFC 3339 UTC so lexicographic ordering
//! matches chronological ordering. Event payloads are stored as JSON text in
//! the `data` column; rows whose payload no longer parses are skipped by
//! queries rather than failing them.
//!
//! A legacy deployment kept the history as a flat JSON array. On first open
//! against an empty `events` table that file is imported once and renamed to
//! a `.backup` suffix.

pub mod persister;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;
use serde_json::Value;

use crate::application::ports::EventStore;
use crate::domain::event::{PROGRAM_STARTED, is_brew_program};

pub use persister::{HistoryPersister, PersistQueue};

/// Vendor limit: API calls per day.
const DAILY_CALL_LIMIT: u64 = 1000;
/// Vendor limit: token refreshes per day.
const DAILY_TOKEN_REFRESH_LIMIT: u64 = 100;

/// History storage errors.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Reading or renaming the legacy history file failed.
    #[error("legacy history file error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be serialized for storage.
    #[error("payload serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEvent {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: Value,
}

/// Daily API usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApiStatistics {
    /// REST calls recorded for the day.
    pub calls_count: u64,
    /// Token refreshes recorded for the day.
    pub token_refreshes_count: u64,
}

/// Append-only event log with aggregation queries.
///
/// `rusqlite::Connection` is `Send` but not `Sync`; the connection lives
/// behind a mutex so the store can be shared via `Arc`. Callers on async
/// paths wrap store calls in `spawn_blocking`.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the history database.
    ///
    /// `path` may name the database itself or the legacy `.json` history; in
    /// either case the database lands next to the legacy file and a pending
    /// legacy file is migrated once.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let (db_path, legacy_path) = Self::derive_paths(path);
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        store.migrate_from_legacy(&legacy_path);
        Ok(store)
    }

    /// Open an in-memory store. Useful for tests; destroyed on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Split a configured history path into (database, legacy JSON) paths.
    fn derive_paths(path: &Path) -> (PathBuf, PathBuf) {
        if path.extension().is_some_and(|ext| ext == "json") {
            (path.with_extension("db"), path.to_path_buf())
        } else {
            (path.to_path_buf(), path.with_extension("json"))
        }
    }

    /// Create tables and indices. Idempotent.
    fn init_schema(&self) -> Result<(), HistoryError> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_timestamp ON events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_type ON events(type);

            CREATE TABLE IF NOT EXISTS api_statistics (
                date TEXT PRIMARY KEY,
                calls_count INTEGER DEFAULT 0,
                token_refreshes_count INTEGER DEFAULT 0,
                last_updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_stats_date ON api_statistics(date);
            ",
        )?;
        Ok(())
    }

    // =========================================================================
    // Legacy Migration
    // =========================================================================

    /// Import the legacy flat-file history once, then rename it aside.
    ///
    /// Runs only when the events table is empty; a corrupt or empty legacy
    /// file is left untouched. Failures are logged, never raised: a broken
    /// migration must not prevent the daemon from starting.
    fn migrate_from_legacy(&self, legacy_path: &Path) {
        if !legacy_path.exists() {
            return;
        }
        match self.import_legacy(legacy_path) {
            Ok(0) => {}
            Ok(imported) => {
                let backup = legacy_path.with_extension("json.backup");
                if let Err(error) = std::fs::rename(legacy_path, &backup) {
                    tracing::warn!(error = %error, "could not rename legacy history to backup");
                } else {
                    tracing::info!(
                        imported,
                        backup = %backup.display(),
                        "migrated legacy history into sqlite"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "legacy history migration failed");
            }
        }
    }

    fn import_legacy(&self, legacy_path: &Path) -> Result<usize, HistoryError> {
        let mut conn = self.conn.lock();

        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(0);
        }

        let raw = std::fs::read_to_string(legacy_path)?;
        let entries: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(error = %error, "legacy history file is not a JSON array, skipping");
                return Ok(0);
            }
        };
        if entries.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction()?;
        let mut imported = 0;
        for entry in entries {
            let timestamp = entry
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let event_type = entry.get("type").and_then(Value::as_str).unwrap_or_default();
            let data = entry.get("data").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            tx.execute(
                "INSERT INTO events (timestamp, type, data) VALUES (?1, ?2, ?3)",
                params![timestamp, event_type, serde_json::to_string(&data)?],
            )?;
            imported += 1;
        }
        tx.commit()?;
        Ok(imported)
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Append one event, stamping the current time when none is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append_event(
        &self,
        event_type: &str,
        data: &Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), HistoryError> {
        let timestamp = timestamp
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        self.conn.lock().execute(
            "INSERT INTO events (timestamp, type, data) VALUES (?1, ?2, ?3)",
            params![timestamp, event_type, serde_json::to_string(data)?],
        )?;
        Ok(())
    }

    /// Append one event; failures are logged, never raised.
    ///
    /// History writes are never on a caller's critical path.
    pub fn add_event(&self, event_type: &str, data: &Value, timestamp: Option<DateTime<Utc>>) {
        if let Err(error) = self.append_event(event_type, data, timestamp) {
            tracing::warn!(event_type, error = %error, "failed to save event to history");
        }
    }

    /// Number of stored events.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn event_count(&self) -> Result<u64, HistoryError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Return events in chronological (ascending) order.
    ///
    /// `limit` always means "the most recent N matching events": the query
    /// takes the newest page (descending, bounded by `before_timestamp` when
    /// given) and reverses it. Insertion order breaks timestamp ties.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_history(
        &self,
        event_type: Option<&str>,
        limit: Option<usize>,
        before_timestamp: Option<&str>,
    ) -> Result<Vec<StoredEvent>, HistoryError> {
        let mut sql = "SELECT timestamp, type, data FROM events".to_string();
        let mut conditions: Vec<&str> = Vec::new();
        let mut bindings: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(event_type) = event_type {
            conditions.push("type = ?");
            bindings.push(event_type.to_string().into());
        }
        if let Some(before) = before_timestamp {
            conditions.push("timestamp < ?");
            bindings.push(before.to_string().into());
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let take_newest_first = before_timestamp.is_some() || limit.is_some();
        if take_newest_first {
            sql.push_str(" ORDER BY timestamp DESC, id DESC");
            if let Some(limit) = limit {
                sql.push_str(" LIMIT ?");
                bindings.push(i64::try_from(limit).unwrap_or(i64::MAX).into());
            }
        } else {
            sql.push_str(" ORDER BY timestamp ASC, id ASC");
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bindings))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: String = row.get(0)?;
            let event_type: String = row.get(1)?;
            let data_json: String = row.get(2)?;
            // Unparseable payloads are skipped, not fatal.
            let Ok(data) = serde_json::from_str(&data_json) else {
                continue;
            };
            events.push(StoredEvent {
                timestamp,
                event_type,
                data,
            });
        }

        if take_newest_first {
            events.reverse();
        }
        Ok(events)
    }

    /// Daily count of brew-program starts for the trailing `days`-day window
    /// ending today (UTC). Always returns exactly `days` keys, zero-filled.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_daily_usage(&self, days: u32) -> Result<BTreeMap<String, u64>, HistoryError> {
        let today = Utc::now().date_naive();
        let mut usage: BTreeMap<String, u64> = (0..days)
            .filter_map(|offset| today.checked_sub_days(Days::new(u64::from(offset))))
            .map(|date| (date.format("%Y-%m-%d").to_string(), 0))
            .collect();

        let cutoff = today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN)
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc().to_rfc3339_opts(SecondsFormat::Micros, true))
            .unwrap_or_default();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, data FROM events
             WHERE type = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC",
        )?;
        let mut rows = stmt.query(params![PROGRAM_STARTED, cutoff])?;

        while let Some(row) = rows.next()? {
            let timestamp: String = row.get(0)?;
            let data_json: String = row.get(1)?;
            let Ok(data) = serde_json::from_str::<Value>(&data_json) else {
                continue;
            };
            let program = data.get("program").and_then(Value::as_str).unwrap_or("Unknown");
            if !is_brew_program(program) {
                continue;
            }
            let Ok(event_time) = DateTime::parse_from_rfc3339(&timestamp) else {
                continue;
            };
            let date_key = event_time
                .with_timezone(&Utc)
                .format("%Y-%m-%d")
                .to_string();
            if let Some(count) = usage.get_mut(&date_key) {
                *count += 1;
            }
        }

        Ok(usage)
    }

    /// Lifetime count of brew-program starts per program key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_program_counts(&self) -> Result<BTreeMap<String, u64>, HistoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM events WHERE type = ?1")?;
        let mut rows = stmt.query(params![PROGRAM_STARTED])?;

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let data_json: String = row.get(0)?;
            let Ok(data) = serde_json::from_str::<Value>(&data_json) else {
                continue;
            };
            let program = data.get("program").and_then(Value::as_str).unwrap_or("Unknown");
            if is_brew_program(program) {
                *counts.entry(program.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    // =========================================================================
    // API Usage Statistics
    // =========================================================================

    /// API usage counters for `date` (`YYYY-MM-DD`), defaulting to today.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_api_statistics(&self, date: Option<&str>) -> Result<ApiStatistics, HistoryError> {
        let date = date.map_or_else(today_key, ToString::to_string);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT calls_count, token_refreshes_count FROM api_statistics WHERE date = ?1",
        )?;
        let mut rows = stmt.query(params![date])?;

        if let Some(row) = rows.next()? {
            let calls: i64 = row.get(0)?;
            let refreshes: i64 = row.get(1)?;
            Ok(ApiStatistics {
                calls_count: u64::try_from(calls).unwrap_or_default(),
                token_refreshes_count: u64::try_from(refreshes).unwrap_or_default(),
            })
        } else {
            Ok(ApiStatistics::default())
        }
    }

    /// Record one API call for today and return the new daily count.
    ///
    /// Emits warnings as the vendor's daily quota is approached.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn increment_api_call(&self) -> Result<u64, HistoryError> {
        let count = self.bump_statistic("calls_count")?;
        if count >= DAILY_CALL_LIMIT {
            tracing::warn!(count, "daily API call limit reached");
        } else if count * 100 >= DAILY_CALL_LIMIT * 95 {
            tracing::warn!(count, "API calls above 95% of the daily limit");
        } else if count * 100 >= DAILY_CALL_LIMIT * 80 {
            tracing::warn!(count, "API calls above 80% of the daily limit");
        }
        Ok(count)
    }

    /// Record one token refresh for today and return the new daily count.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn increment_token_refresh(&self) -> Result<u64, HistoryError> {
        let count = self.bump_statistic("token_refreshes_count")?;
        if count >= DAILY_TOKEN_REFRESH_LIMIT {
            tracing::warn!(count, "daily token refresh limit reached");
        } else if count * 2 >= DAILY_TOKEN_REFRESH_LIMIT {
            tracing::warn!(count, "token refreshes above half of the daily limit");
        }
        Ok(count)
    }

    fn bump_statistic(&self, column: &str) -> Result<u64, HistoryError> {
        let date = today_key();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.conn.lock();

        // `column` is one of two compile-time literals, never user input.
        let sql = format!(
            "INSERT INTO api_statistics (date, calls_count, token_refreshes_count, last_updated)
             VALUES (?1, {calls}, {refreshes}, ?2)
             ON CONFLICT(date) DO UPDATE SET {column} = {column} + 1, last_updated = ?2",
            calls = i32::from(column == "calls_count"),
            refreshes = i32::from(column == "token_refreshes_count"),
        );
        conn.execute(&sql, params![date, now])?;

        let count: i64 = conn.query_row(
            &format!("SELECT {column} FROM api_statistics WHERE date = ?1"),
            params![date],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl EventStore for HistoryStore {
    fn append(&self, event_type: &str, payload: &Value) -> anyhow::Result<()> {
        self.append_event(event_type, payload, None)?;
        Ok(())
    }
}

fn today_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
