//! Scheduled maintenance windows.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::db::{Event, NewEvent, Store};
use crate::error::{EngineError, EngineResult};

/// Longest maintenance window accepted, one year.
pub const MAX_EVENT_MINUTES: i64 = 366 * 24 * 60;

/// Validate and store a maintenance window.
pub fn schedule_event(store: &Store, new: &NewEvent) -> EngineResult<Event> {
    if new.title.trim().is_empty() {
        return Err(EngineError::Validation("event title must not be empty".to_string()));
    }
    if new.duration_minutes <= 0 {
        return Err(EngineError::Validation(format!(
            "event duration must be positive, got {} minutes",
            new.duration_minutes
        )));
    }
    if new.duration_minutes > MAX_EVENT_MINUTES {
        return Err(EngineError::Validation(format!(
            "event duration must be at most {} minutes, got {}",
            MAX_EVENT_MINUTES, new.duration_minutes
        )));
    }
    for id in &new.monitor_ids {
        store
            .get_monitor(*id)
            .map_err(|e| EngineError::from_db(e, "monitor", *id))?;
    }

    let event = store.create_event(new)?;
    tracing::info!(event_id = event.id, starts_at = %event.starts_at, "Maintenance scheduled");
    Ok(event)
}

/// Flip `completed` on auto-completing events that have ended.
pub fn complete_due_events(store: &Store, now: DateTime<Utc>) -> EngineResult<Vec<i64>> {
    let completed = store.complete_due_events(now)?;
    for id in &completed {
        tracing::info!(event_id = id, "Maintenance completed");
    }
    Ok(completed)
}

/// Background manager completing elapsed maintenance windows.
pub struct EventCompleter {
    store: Arc<Store>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl EventCompleter {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the completer background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = complete_due_events(&store, Utc::now()) {
                            tracing::error!("EventCompleter: Failed to complete events: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the completer.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}
