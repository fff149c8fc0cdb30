//! Incident, report and tracked-state persistence.
//!
//! Every write that touches more than one table runs inside a single
//! transaction, so an incident never exists without its first report and a
//! tracked state never claims a report that was not stored.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};

use super::models::*;
use super::store::{format_db_time, opt_time_column, time_column, DbError, Store};

/// Input for [`Store::create_incident`].
#[derive(Debug, Clone)]
pub struct NewIncident<'a> {
    pub title: &'a str,
    pub started_at: DateTime<Utc>,
    pub monitor_ids: &'a [i64],
    pub message: &'a str,
}

const INCIDENT_COLUMNS: &str = "id, title, started_at, acknowledged_at, resolved_at, auto_resolved";

impl Store {
    // --- Incidents ---

    /// Create an incident, link its monitors and add the `investigating`
    /// report. Each tracked state is pointed at the new incident and saved in
    /// the same transaction.
    pub fn create_incident(
        &self,
        new: &NewIncident<'_>,
        tracked: &mut [TrackedState],
    ) -> Result<(Incident, IncidentReport), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO incidents (title, started_at, auto_resolved) VALUES (?1, ?2, 0)",
            params![new.title, format_db_time(new.started_at)],
        )?;
        let incident = Incident {
            id: tx.last_insert_rowid(),
            title: new.title.to_string(),
            started_at: new.started_at,
            acknowledged_at: None,
            resolved_at: None,
            auto_resolved: false,
        };

        for monitor_id in new.monitor_ids {
            tx.execute(
                "INSERT OR IGNORE INTO monitors_to_incidents (monitor_id, incident_id) VALUES (?1, ?2)",
                params![monitor_id, incident.id],
            )?;
        }

        let report = insert_report(
            &tx,
            incident.id,
            ReportStatus::Investigating,
            new.message,
            new.started_at,
        )?;

        for state in tracked.iter_mut() {
            state.incident = Some(TrackedIncident::from(&incident));
            save_tracked(&tx, state)?;
        }

        tx.commit()?;
        Ok((incident, report))
    }

    /// Get an incident by ID.
    pub fn get_incident(&self, id: i64) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![id],
            incident_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get incidents, newest first.
    pub fn get_incidents(&self, open_only: bool) -> Result<Vec<Incident>, DbError> {
        let sql = if open_only {
            format!(
                "SELECT {} FROM incidents WHERE resolved_at IS NULL ORDER BY started_at DESC, id DESC",
                INCIDENT_COLUMNS
            )
        } else {
            format!("SELECT {} FROM incidents ORDER BY started_at DESC, id DESC", INCIDENT_COLUMNS)
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let incidents = stmt
            .query_map([], incident_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(incidents)
    }

    /// Monitors linked to an incident.
    pub fn incident_monitor_ids(&self, incident_id: i64) -> Result<Vec<i64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT monitor_id FROM monitors_to_incidents WHERE incident_id = ?1 ORDER BY monitor_id",
        )?;
        let ids = stmt
            .query_map(params![incident_id], |row| row.get(0))?
            .collect::<SqlResult<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Open incidents linked to any of `monitor_ids`, with the
    /// `(monitor_id, incident_id)` pairs that link them.
    pub fn open_incident_links(
        &self,
        monitor_ids: &[i64],
    ) -> Result<(Vec<Incident>, Vec<(i64, i64)>), DbError> {
        if monitor_ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT mti.monitor_id, mti.incident_id FROM monitors_to_incidents mti
             JOIN incidents i ON i.id = mti.incident_id
             WHERE i.resolved_at IS NULL AND mti.monitor_id IN ({})",
            placeholders(monitor_ids.len())
        ))?;
        let links = stmt
            .query_map(params_from_iter(monitor_ids.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<SqlResult<Vec<(i64, i64)>>>()?;

        let mut incident_ids: Vec<i64> = links.iter().map(|(_, id)| *id).collect();
        incident_ids.sort_unstable();
        incident_ids.dedup();

        let mut incidents = Vec::with_capacity(incident_ids.len());
        if !incident_ids.is_empty() {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM incidents WHERE id IN ({})",
                INCIDENT_COLUMNS,
                placeholders(incident_ids.len())
            ))?;
            incidents = stmt
                .query_map(params_from_iter(incident_ids.iter()), incident_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
        }

        Ok((incidents, links))
    }

    /// Incidents linked to a monitor that were open at some point in `[start, end)`.
    pub fn incidents_for_monitor_between(
        &self,
        monitor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT i.id, i.title, i.started_at, i.acknowledged_at, i.resolved_at, i.auto_resolved
             FROM incidents i JOIN monitors_to_incidents mti ON mti.incident_id = i.id
             WHERE mti.monitor_id = ?1 AND i.started_at < ?3 AND (i.resolved_at IS NULL OR i.resolved_at >= ?2)
             ORDER BY i.started_at ASC",
        )?;
        let incidents = stmt
            .query_map(
                params![monitor_id, format_db_time(start), format_db_time(end)],
                incident_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(incidents)
    }

    /// Set the acknowledgement time (first call wins) and put every tracked
    /// state of the incident under manual control.
    pub fn acknowledge_incident(&self, incident_id: i64, at: DateTime<Utc>) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let updated = tx.execute(
            "UPDATE incidents SET acknowledged_at = COALESCE(acknowledged_at, ?2) WHERE id = ?1",
            params![incident_id, format_db_time(at)],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        mark_manual(&tx, incident_id)?;

        let incident = tx.query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![incident_id],
            incident_from_row,
        )?;
        tx.commit()?;
        Ok(incident)
    }

    /// Change an incident's title, keeping tracked shadows in sync.
    pub fn rename_incident(&self, incident_id: i64, title: &str) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let updated = tx.execute(
            "UPDATE incidents SET title = ?2 WHERE id = ?1",
            params![incident_id, title],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        tx.execute(
            "UPDATE tracked_states SET incident_title = ?2 WHERE incident_id = ?1",
            params![incident_id, title],
        )?;

        let incident = tx.query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![incident_id],
            incident_from_row,
        )?;
        tx.commit()?;
        Ok(incident)
    }

    /// Mark an incident resolved, add the `resolved` report and return every
    /// tracked state pointing at it to the healthy baseline. `tracked` rows
    /// are written after the reset.
    ///
    /// A reset state's staleness watermark is its last evaluated ping, or
    /// `watermark` when that is later or missing.
    ///
    /// Returns `None` when the incident was already resolved.
    pub fn resolve_incident(
        &self,
        incident_id: i64,
        resolved_at: DateTime<Utc>,
        auto: bool,
        message: &str,
        watermark: DateTime<Utc>,
        tracked: &[TrackedState],
    ) -> Result<Option<(Incident, IncidentReport)>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let updated = tx.execute(
            "UPDATE incidents SET resolved_at = ?2, auto_resolved = ?3 WHERE id = ?1 AND resolved_at IS NULL",
            params![incident_id, format_db_time(resolved_at), auto],
        )?;
        if updated == 0 {
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM incidents WHERE id = ?1", params![incident_id], |row| row.get(0))
                .optional()?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(DbError::NotFound),
            };
        }

        let report = insert_report(&tx, incident_id, ReportStatus::Resolved, message, resolved_at)?;

        tx.execute(
            "UPDATE tracked_states SET incident_id = NULL, incident_title = NULL, incident_started_at = NULL,
                consecutive_successes = 0, consecutive_failures = 0, investigating_emitted = 0,
                monitoring_emitted = 0, manual_override = 0,
                last_resolved_at = CASE WHEN last_ping_at > ?2 THEN last_ping_at ELSE ?2 END
             WHERE incident_id = ?1",
            params![incident_id, format_db_time(watermark)],
        )?;
        for state in tracked {
            save_tracked(&tx, state)?;
        }

        let incident = tx.query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![incident_id],
            incident_from_row,
        )?;
        tx.commit()?;
        Ok(Some((incident, report)))
    }

    // --- Reports ---

    /// Append a report. `tracked` rows are saved in the same transaction;
    /// with `manual` set, every tracked state of the incident is put under
    /// manual control.
    pub fn append_report(
        &self,
        incident_id: i64,
        status: ReportStatus,
        message: &str,
        at: DateTime<Utc>,
        tracked: &[TrackedState],
        manual: bool,
    ) -> Result<IncidentReport, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let report = insert_report(&tx, incident_id, status, message, at)?;
        for state in tracked {
            save_tracked(&tx, state)?;
        }
        if manual {
            mark_manual(&tx, incident_id)?;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Reports of an incident in timeline order.
    pub fn get_reports(&self, incident_id: i64) -> Result<Vec<IncidentReport>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, status, message, created_at FROM incident_reports
             WHERE incident_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let reports = stmt
            .query_map(params![incident_id], report_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(reports)
    }

    /// The most recent report of an incident.
    pub fn last_report(&self, incident_id: i64) -> Result<Option<IncidentReport>, DbError> {
        let conn = self.conn()?;
        let report = conn
            .query_row(
                "SELECT id, incident_id, status, message, created_at FROM incident_reports
                 WHERE incident_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![incident_id],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }

    // --- Tracked state ---

    /// Load the tracked state of a monitor, if one was ever saved.
    pub fn get_tracked_state(&self, monitor_id: i64) -> Result<Option<TrackedState>, DbError> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT monitor_id, incident_id, incident_title, incident_started_at, consecutive_successes,
                    consecutive_failures, investigating_emitted, monitoring_emitted, manual_override,
                    last_ping_at, last_resolved_at
                 FROM tracked_states WHERE monitor_id = ?1",
                params![monitor_id],
                tracked_from_row,
            )
            .optional()?;
        Ok(state)
    }

    /// Insert or replace the tracked state of a monitor.
    pub fn save_tracked_state(&self, state: &TrackedState) -> Result<(), DbError> {
        let conn = self.conn()?;
        save_tracked(&conn, state)?;
        Ok(())
    }
}

/// Insert a report, never earlier than the latest report of the incident.
fn insert_report(
    conn: &Connection,
    incident_id: i64,
    status: ReportStatus,
    message: &str,
    at: DateTime<Utc>,
) -> Result<IncidentReport, DbError> {
    let latest: Option<DateTime<Utc>> = conn
        .query_row(
            "SELECT MAX(created_at) FROM incident_reports WHERE incident_id = ?1",
            params![incident_id],
            |row| opt_time_column(row, 0),
        )?;
    let created_at = latest.map_or(at, |latest| latest.max(at));

    conn.execute(
        "INSERT INTO incident_reports (incident_id, status, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![incident_id, status.as_str(), message, format_db_time(created_at)],
    )?;

    Ok(IncidentReport {
        id: conn.last_insert_rowid(),
        incident_id,
        status,
        message: message.to_string(),
        created_at,
    })
}

fn mark_manual(conn: &Connection, incident_id: i64) -> SqlResult<usize> {
    conn.execute(
        "UPDATE tracked_states SET manual_override = 1 WHERE incident_id = ?1",
        params![incident_id],
    )
}

fn save_tracked(conn: &Connection, state: &TrackedState) -> SqlResult<usize> {
    let incident = state.incident.as_ref();
    conn.execute(
        "INSERT INTO tracked_states (monitor_id, incident_id, incident_title, incident_started_at,
            consecutive_successes, consecutive_failures, investigating_emitted, monitoring_emitted,
            manual_override, last_ping_at, last_resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(monitor_id) DO UPDATE SET
            incident_id = excluded.incident_id,
            incident_title = excluded.incident_title,
            incident_started_at = excluded.incident_started_at,
            consecutive_successes = excluded.consecutive_successes,
            consecutive_failures = excluded.consecutive_failures,
            investigating_emitted = excluded.investigating_emitted,
            monitoring_emitted = excluded.monitoring_emitted,
            manual_override = excluded.manual_override,
            last_ping_at = excluded.last_ping_at,
            last_resolved_at = excluded.last_resolved_at",
        params![
            state.monitor_id,
            incident.map(|i| i.id),
            incident.map(|i| i.title.clone()),
            incident.map(|i| format_db_time(i.started_at)),
            state.consecutive_successes,
            state.consecutive_failures,
            state.investigating_report_emitted,
            state.monitoring_report_emitted,
            state.manual_override,
            state.last_ping_at.map(format_db_time),
            state.last_resolved_at.map(format_db_time),
        ],
    )
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        title: row.get(1)?,
        started_at: time_column(row, 2)?,
        acknowledged_at: opt_time_column(row, 3)?,
        resolved_at: opt_time_column(row, 4)?,
        auto_resolved: row.get(5)?,
    })
}

fn report_from_row(row: &Row<'_>) -> SqlResult<IncidentReport> {
    let status: String = row.get(2)?;
    Ok(IncidentReport {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
        message: row.get(3)?,
        created_at: time_column(row, 4)?,
    })
}

fn tracked_from_row(row: &Row<'_>) -> SqlResult<TrackedState> {
    let incident_id: Option<i64> = row.get(1)?;
    let incident = match incident_id {
        Some(id) => Some(TrackedIncident {
            id,
            title: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            started_at: time_column(row, 3)?,
        }),
        None => None,
    };

    Ok(TrackedState {
        monitor_id: row.get(0)?,
        incident,
        consecutive_successes: row.get(4)?,
        consecutive_failures: row.get(5)?,
        investigating_report_emitted: row.get(6)?,
        monitoring_report_emitted: row.get(7)?,
        manual_override: row.get(8)?,
        last_ping_at: opt_time_column(row, 9)?,
        last_resolved_at: opt_time_column(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn setup() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let mut monitor = Monitor {
            name: "API".to_string(),
            target: "https://example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_monitor(&mut monitor).unwrap();
        (store, id)
    }

    fn open(store: &Store, monitor_id: i64, at: DateTime<Utc>) -> Incident {
        let mut tracked = vec![TrackedState::new(monitor_id)];
        let (incident, _) = store
            .create_incident(
                &NewIncident {
                    title: "API is down",
                    started_at: at,
                    monitor_ids: &[monitor_id],
                    message: "investigating",
                },
                &mut tracked,
            )
            .unwrap();
        incident
    }

    #[test]
    fn test_create_incident_writes_report_links_and_state() {
        let (store, monitor_id) = setup();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let incident = open(&store, monitor_id, at);

        assert!(incident.is_open());
        assert_eq!(store.incident_monitor_ids(incident.id).unwrap(), vec![monitor_id]);

        let reports = store.get_reports(incident.id).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ReportStatus::Investigating);

        let state = store.get_tracked_state(monitor_id).unwrap().unwrap();
        assert_eq!(state.incident.map(|i| i.id), Some(incident.id));
    }

    #[test]
    fn test_reports_never_go_back_in_time() {
        let (store, monitor_id) = setup();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let incident = open(&store, monitor_id, at);

        let report = store
            .append_report(
                incident.id,
                ReportStatus::Identified,
                "cause found",
                at - ChronoDuration::hours(1),
                &[],
                false,
            )
            .unwrap();
        assert_eq!(report.created_at, at);

        let last = store.last_report(incident.id).unwrap().unwrap();
        assert_eq!(last.status, ReportStatus::Identified);
    }

    #[test]
    fn test_resolve_resets_tracked_state_once() {
        let (store, monitor_id) = setup();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let incident = open(&store, monitor_id, at);
        let resolved_at = at + ChronoDuration::minutes(10);

        let (resolved, report) = store
            .resolve_incident(incident.id, resolved_at, false, "fixed", resolved_at, &[])
            .unwrap()
            .unwrap();
        assert_eq!(resolved.resolved_at, Some(resolved_at));
        assert!(!resolved.auto_resolved);
        assert_eq!(report.status, ReportStatus::Resolved);

        let state = store.get_tracked_state(monitor_id).unwrap().unwrap();
        assert!(state.incident.is_none());
        assert!(!state.investigating_report_emitted);
        assert_eq!(state.last_resolved_at, Some(resolved_at));

        let again = store
            .resolve_incident(incident.id, resolved_at, false, "fixed", resolved_at, &[])
            .unwrap();
        assert!(again.is_none());
        assert!(matches!(
            store.resolve_incident(999, resolved_at, false, "x", resolved_at, &[]),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_resolve_watermark_keeps_last_evaluated_ping() {
        let (store, monitor_id) = setup();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let incident = open(&store, monitor_id, at);

        let mut state = store.get_tracked_state(monitor_id).unwrap().unwrap();
        state.last_ping_at = Some(at + ChronoDuration::minutes(3));
        store.save_tracked_state(&state).unwrap();

        store
            .resolve_incident(incident.id, at + ChronoDuration::hours(1), false, "fixed", at, &[])
            .unwrap()
            .unwrap();

        let state = store.get_tracked_state(monitor_id).unwrap().unwrap();
        assert_eq!(state.last_resolved_at, Some(at + ChronoDuration::minutes(3)));
    }

    #[test]
    fn test_open_incident_links_and_window_query() {
        let (store, monitor_id) = setup();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let incident = open(&store, monitor_id, at);

        let (incidents, links) = store.open_incident_links(&[monitor_id, 77]).unwrap();
        assert_eq!(incidents, vec![incident.clone()]);
        assert_eq!(links, vec![(monitor_id, incident.id)]);

        let before = store
            .incidents_for_monitor_between(monitor_id, at - ChronoDuration::days(2), at - ChronoDuration::days(1))
            .unwrap();
        assert!(before.is_empty());
        let during = store
            .incidents_for_monitor_between(monitor_id, at, at + ChronoDuration::days(1))
            .unwrap();
        assert_eq!(during.len(), 1);
    }

    #[test]
    fn test_acknowledge_marks_manual_and_keeps_first_time() {
        let (store, monitor_id) = setup();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let incident = open(&store, monitor_id, at);

        let first = store.acknowledge_incident(incident.id, at + ChronoDuration::minutes(1)).unwrap();
        let second = store.acknowledge_incident(incident.id, at + ChronoDuration::minutes(5)).unwrap();
        assert_eq!(first.acknowledged_at, second.acknowledged_at);

        let state = store.get_tracked_state(monitor_id).unwrap().unwrap();
        assert!(state.manual_override);
    }
}
