//! Scheduled maintenance persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Result as SqlResult, Row};

use super::incidents::placeholders;
use super::models::*;
use super::store::{format_db_time, time_column, DbError, Store};

const EVENT_COLUMNS: &str = "e.id, e.title, e.message, e.starts_at, e.duration_minutes, e.auto_complete, e.completed";

impl Store {
    /// Store a maintenance window and link it to its monitors.
    pub fn create_event(&self, new: &NewEvent) -> Result<Event, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO events (title, message, starts_at, duration_minutes, auto_complete, completed)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                new.title,
                new.message,
                format_db_time(new.starts_at),
                new.duration_minutes,
                new.auto_complete,
            ],
        )?;
        let id = tx.last_insert_rowid();

        for monitor_id in &new.monitor_ids {
            tx.execute(
                "INSERT OR IGNORE INTO monitors_to_events (monitor_id, event_id) VALUES (?1, ?2)",
                params![monitor_id, id],
            )?;
        }

        tx.commit()?;
        Ok(Event {
            id,
            title: new.title.clone(),
            message: new.message.clone(),
            starts_at: new.starts_at,
            duration_minutes: new.duration_minutes,
            auto_complete: new.auto_complete,
            completed: false,
        })
    }

    /// Get an event by ID.
    pub fn get_event(&self, id: i64) -> Result<Event, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM events e WHERE e.id = ?1", EVENT_COLUMNS),
            params![id],
            event_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Events linked to a monitor that intersect `[start, end)`.
    pub fn events_for_monitor_between(
        &self,
        monitor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events e JOIN monitors_to_events mte ON mte.event_id = e.id
             WHERE mte.monitor_id = ?1 AND e.starts_at < ?2 ORDER BY e.starts_at ASC",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![monitor_id, format_db_time(end)], event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events.into_iter().filter(|e| e.overlaps(start, end)).collect())
    }

    /// Uncompleted events linked to any of `monitor_ids`, with the
    /// `(monitor_id, event_id)` pairs that link them.
    pub fn pending_event_links(
        &self,
        monitor_ids: &[i64],
    ) -> Result<(Vec<Event>, Vec<(i64, i64)>), DbError> {
        if monitor_ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT mte.monitor_id, {} FROM events e JOIN monitors_to_events mte ON mte.event_id = e.id
             WHERE e.completed = 0 AND mte.monitor_id IN ({})",
            EVENT_COLUMNS,
            placeholders(monitor_ids.len())
        ))?;
        let rows = stmt
            .query_map(params_from_iter(monitor_ids.iter()), |row| {
                let monitor_id: i64 = row.get(0)?;
                let event = event_from_row_at(row, 1)?;
                Ok((monitor_id, event))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let links = rows.iter().map(|(monitor_id, e)| (*monitor_id, e.id)).collect();
        let mut events: Vec<Event> = rows.into_iter().map(|(_, e)| e).collect();
        events.sort_by_key(|e| e.id);
        events.dedup_by_key(|e| e.id);

        Ok((events, links))
    }

    /// Mark auto-completing events whose window has ended as completed.
    /// Returns the IDs that changed.
    pub fn complete_due_events(&self, now: DateTime<Utc>) -> Result<Vec<i64>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let due: Vec<i64> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM events e WHERE e.auto_complete = 1 AND e.completed = 0 AND e.starts_at <= ?1",
                EVENT_COLUMNS
            ))?;
            let candidates = stmt
                .query_map(params![format_db_time(now)], event_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            candidates
                .into_iter()
                .filter(|e| e.ends_at() <= now)
                .map(|e| e.id)
                .collect()
        };

        for id in &due {
            tx.execute("UPDATE events SET completed = 1 WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        Ok(due)
    }
}

fn event_from_row(row: &Row<'_>) -> SqlResult<Event> {
    event_from_row_at(row, 0)
}

fn event_from_row_at(row: &Row<'_>, offset: usize) -> SqlResult<Event> {
    Ok(Event {
        id: row.get(offset)?,
        title: row.get(offset + 1)?,
        message: row.get(offset + 2)?,
        starts_at: time_column(row, offset + 3)?,
        duration_minutes: row.get(offset + 4)?,
        auto_complete: row.get(offset + 5)?,
        completed: row.get(offset + 6)?,
    })
}
