//! SQLite database store implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Timestamp layout used for every stored time. Fixed width, so text
/// comparison orders the same way as time.
pub(crate) const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            DbError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
        Self::with_connection(conn)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run the embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }

        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Unavailable("connection lock poisoned".to_string()))
    }

    // --- Monitor CRUD ---

    /// Add a new monitor and return its ID.
    pub fn add_monitor(&self, monitor: &mut Monitor) -> Result<i64, DbError> {
        if monitor.interval_secs == 0 {
            monitor.interval_secs = 30;
        }
        if monitor.timeout_secs <= 0.0 {
            monitor.timeout_secs = 5.0;
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO monitors (name, kind, target, interval_secs, timeout_secs, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                monitor.name,
                monitor.kind.as_str(),
                monitor.target,
                monitor.interval_secs,
                monitor.timeout_secs,
                format_db_time(monitor.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        monitor.id = id;
        Ok(id)
    }

    /// Get all monitors.
    pub fn get_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, target, interval_secs, timeout_secs, created_at FROM monitors ORDER BY id",
        )?;

        let monitors = stmt
            .query_map([], monitor_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(monitors)
    }

    /// Get a monitor by ID.
    pub fn get_monitor(&self, id: i64) -> Result<Monitor, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, kind, target, interval_secs, timeout_secs, created_at FROM monitors WHERE id = ?1",
            params![id],
            monitor_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a monitor together with its pings, links and tracked state.
    pub fn delete_monitor(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM pings WHERE monitor_id = ?1", params![id])?;
        tx.execute("DELETE FROM monitors_to_incidents WHERE monitor_id = ?1", params![id])?;
        tx.execute("DELETE FROM monitors_to_events WHERE monitor_id = ?1", params![id])?;
        tx.execute("DELETE FROM tracked_states WHERE monitor_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(DbError::NotFound);
        }
        tx.commit()?;
        Ok(())
    }

    // --- Pings ---

    /// Append a probe result.
    pub fn insert_ping(&self, ping: &NewPing) -> Result<Ping, DbError> {
        let headers = ping.headers.as_ref().map(|h| h.to_string());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pings (monitor_id, success, latency_ms, status_code, headers, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ping.monitor_id,
                ping.success,
                ping.latency_ms,
                ping.status_code,
                headers,
                ping.body,
                format_db_time(ping.created_at),
            ],
        )?;

        Ok(Ping {
            id: conn.last_insert_rowid(),
            monitor_id: ping.monitor_id,
            success: ping.success,
            latency_ms: ping.latency_ms,
            status_code: ping.status_code,
            headers: ping.headers.clone(),
            body: ping.body.clone(),
            created_at: ping.created_at,
        })
    }

    /// Get pings for a monitor within a time range, oldest first.
    pub fn get_pings(
        &self,
        monitor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Ping>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, success, latency_ms, status_code, headers, body, created_at FROM pings
             WHERE monitor_id = ?1 AND created_at >= ?2 AND created_at < ?3 ORDER BY created_at ASC, id ASC LIMIT ?4",
        )?;

        let pings = stmt
            .query_map(
                params![monitor_id, format_db_time(start), format_db_time(end), limit],
                ping_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(pings)
    }

    /// Count pings stored for a monitor since `since`.
    pub fn count_pings_since(&self, monitor_id: i64, since: DateTime<Utc>) -> Result<PingCounts, DbError> {
        let conn = self.conn()?;
        let (total, failed): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0)
             FROM pings WHERE monitor_id = ?1 AND created_at >= ?2",
            params![monitor_id, format_db_time(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(PingCounts {
            total: total.max(0) as u64,
            failed: failed.max(0) as u64,
        })
    }

    /// Latencies of successful pings with a recorded latency since `since`.
    pub fn successful_latencies_since(&self, monitor_id: i64, since: DateTime<Utc>) -> Result<Vec<f64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT latency_ms FROM pings
             WHERE monitor_id = ?1 AND created_at >= ?2 AND success = 1 AND latency_ms IS NOT NULL",
        )?;

        let latencies = stmt
            .query_map(params![monitor_id, format_db_time(since)], |row| row.get(0))?
            .collect::<SqlResult<Vec<f64>>>()?;

        Ok(latencies)
    }

    /// Ping counts per UTC calendar day since `since`, oldest day first.
    pub fn daily_ping_counts(
        &self,
        monitor_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<(NaiveDate, PingCounts)>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT substr(created_at, 1, 10) AS day, COUNT(*), SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END)
             FROM pings WHERE monitor_id = ?1 AND created_at >= ?2
             GROUP BY day ORDER BY day",
        )?;

        let days = stmt
            .query_map(params![monitor_id, format_db_time(since)], |row| {
                let day: String = row.get(0)?;
                let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d").map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                })?;
                let total: i64 = row.get(1)?;
                let failed: i64 = row.get(2)?;
                Ok((
                    date,
                    PingCounts {
                        total: total.max(0) as u64,
                        failed: failed.max(0) as u64,
                    },
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(days)
    }
}

/// Format a timestamp for storage.
pub(crate) fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("invalid timestamp: {}", raw).into())
    })
}

pub(crate) fn opt_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(_) => time_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn monitor_from_row(row: &Row<'_>) -> SqlResult<Monitor> {
    let kind: String = row.get(2)?;
    Ok(Monitor {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: kind
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
        target: row.get(3)?,
        interval_secs: row.get(4)?,
        timeout_secs: row.get(5)?,
        created_at: time_column(row, 6)?,
    })
}

fn ping_from_row(row: &Row<'_>) -> SqlResult<Ping> {
    let headers: Option<String> = row.get(5)?;
    let headers = match headers {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        ),
        None => None,
    };

    Ok(Ping {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        success: row.get(2)?,
        latency_ms: row.get(3)?,
        status_code: row.get(4)?,
        headers,
        body: row.get(6)?,
        created_at: time_column(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn sample_monitor(store: &Store) -> i64 {
        let mut monitor = Monitor {
            name: "API".to_string(),
            target: "https://example.com/health".to_string(),
            ..Default::default()
        };
        store.add_monitor(&mut monitor).unwrap()
    }

    #[test]
    fn test_monitor_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut monitor = Monitor {
            name: "Test".to_string(),
            kind: ProbeKind::Tcp,
            target: "example.com:443".to_string(),
            interval_secs: 0,
            ..Default::default()
        };
        let id = store.add_monitor(&mut monitor).unwrap();
        assert!(id > 0);

        let fetched = store.get_monitor(id).unwrap();
        assert_eq!(fetched.name, "Test");
        assert_eq!(fetched.kind, ProbeKind::Tcp);
        assert_eq!(fetched.interval_secs, 30);

        assert_eq!(store.get_monitors().unwrap().len(), 1);

        store.delete_monitor(id).unwrap();
        assert!(matches!(store.get_monitor(id), Err(DbError::NotFound)));
        assert!(matches!(store.delete_monitor(id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_ping_roundtrip_keeps_metadata() {
        let store = Store::open_in_memory().unwrap();
        let monitor_id = sample_monitor(&store);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let mut ping = NewPing::success(monitor_id, 42.5, at);
        ping.status_code = Some(200);
        ping.headers = Some(serde_json::json!({"server": "nginx"}));
        let stored = store.insert_ping(&ping).unwrap();

        let fetched = store
            .get_pings(monitor_id, at - ChronoDuration::minutes(1), at + ChronoDuration::minutes(1), 10)
            .unwrap();
        assert_eq!(fetched, vec![stored]);
    }

    #[test]
    fn test_counts_and_latencies() {
        let store = Store::open_in_memory().unwrap();
        let monitor_id = sample_monitor(&store);
        let day = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        store.insert_ping(&NewPing::success(monitor_id, 10.0, day)).unwrap();
        store.insert_ping(&NewPing::success(monitor_id, 30.0, day + ChronoDuration::hours(1))).unwrap();
        store.insert_ping(&NewPing::failure(monitor_id, day + ChronoDuration::days(1))).unwrap();

        let counts = store.count_pings_since(monitor_id, day).unwrap();
        assert_eq!(counts, PingCounts { total: 3, failed: 1 });

        let mut latencies = store.successful_latencies_since(monitor_id, day).unwrap();
        latencies.sort_by(f64::total_cmp);
        assert_eq!(latencies, vec![10.0, 30.0]);

        let daily = store.daily_ping_counts(monitor_id, day - ChronoDuration::days(1)).unwrap();
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].0, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(daily[0].1, PingCounts { total: 2, failed: 0 });
        assert_eq!(daily[1].1, PingCounts { total: 1, failed: 1 });
    }

    #[test]
    fn test_parse_db_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_db_time("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(parse_db_time(&format_db_time(expected)), Some(expected));
        assert_eq!(parse_db_time("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_db_time("yesterday"), None);
    }
}
