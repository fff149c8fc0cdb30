//! Ping ingestion and evaluation.

use serde::Serialize;
use std::sync::Arc;

use super::locks::MonitorLocks;
use super::machine::{HealthPhase, Thresholds, Transition};
use crate::config::ConfigHandle;
use crate::db::{Monitor, NewPing, Ping, ReportStatus, Store, TrackedState};
use crate::error::{EngineError, EngineResult};
use crate::incident::IncidentManager;

/// Result of recording one ping.
#[derive(Debug, Clone, Serialize)]
pub struct PingOutcome {
    pub ping: Ping,
    pub transition: Transition,
    pub phase: HealthPhase,
    /// The incident open after evaluation, if any.
    pub incident_id: Option<i64>,
}

/// Runs one state machine per monitor.
pub struct HealthTracker {
    store: Arc<Store>,
    incidents: Arc<IncidentManager>,
    locks: Arc<MonitorLocks>,
    config: ConfigHandle,
}

impl HealthTracker {
    pub fn new(
        store: Arc<Store>,
        incidents: Arc<IncidentManager>,
        locks: Arc<MonitorLocks>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            store,
            incidents,
            locks,
            config,
        }
    }

    /// Store a ping and evaluate it against the monitor's tracked state.
    ///
    /// The ping is persisted before evaluation, so a failed evaluation never
    /// loses the signal. Pings for the same monitor are evaluated one at a
    /// time in arrival order.
    pub async fn record_ping(&self, ping: NewPing) -> EngineResult<PingOutcome> {
        if let Some(latency) = ping.latency_ms {
            if !latency.is_finite() || latency < 0.0 {
                return Err(EngineError::Validation(format!("invalid latency: {}", latency)));
            }
        }

        let monitor = self
            .store
            .get_monitor(ping.monitor_id)
            .map_err(|e| EngineError::from_db(e, "monitor", ping.monitor_id))?;

        let _guard = self.locks.lock(monitor.id).await;

        // The monitor may have been deleted while waiting for the lock.
        let monitor = self
            .store
            .get_monitor(monitor.id)
            .map_err(|e| EngineError::from_db(e, "monitor", monitor.id))?;

        let stored = self.store.insert_ping(&ping)?;
        let config = self.config.snapshot();

        let mut state = self
            .store
            .get_tracked_state(monitor.id)?
            .unwrap_or_else(|| TrackedState::new(monitor.id));

        if !config.incidents.auto_enabled {
            return Ok(outcome(stored, Transition::Disabled, &state));
        }

        let thresholds = Thresholds::from(&config.incidents);
        let transition = state.step(stored.success, stored.created_at, &thresholds);

        match transition {
            Transition::Stale => {
                tracing::debug!(
                    monitor_id = monitor.id,
                    ping_id = stored.id,
                    "Ping predates tracked state, stored without evaluation"
                );
                return Ok(outcome(stored, transition, &state));
            }
            Transition::Open => {
                self.incidents.open_tracked(
                    &mut state,
                    &format!("{} is down", monitor.name),
                    &down_message(&monitor),
                    stored.created_at,
                )?;
            }
            Transition::Relapse => {
                self.incidents.report_tracked(
                    &state,
                    ReportStatus::Investigating,
                    &format!("{} was recovering but is failing again. We are investigating.", monitor.name),
                    stored.created_at,
                )?;
            }
            Transition::Monitoring => {
                self.incidents.report_tracked(
                    &state,
                    ReportStatus::Monitoring,
                    &format!("{} is back online. Monitoring for stability.", monitor.name),
                    stored.created_at,
                )?;
            }
            Transition::Resolve => {
                self.incidents.resolve_tracked(
                    &mut state,
                    &format!("The incident has been resolved. {} is back online.", monitor.name),
                    stored.created_at,
                )?;
            }
            Transition::Disabled
            | Transition::Steady
            | Transition::Suspect
            | Transition::Reset
            | Transition::Recovering => {
                self.store.save_tracked_state(&state)?;
            }
        }

        if !matches!(transition, Transition::Steady | Transition::Recovering) {
            tracing::info!(
                monitor_id = monitor.id,
                transition = ?transition,
                phase = ?state.phase(),
                "Health transition"
            );
        }

        Ok(outcome(stored, transition, &state))
    }

    /// Current tracked state of a monitor.
    pub fn state(&self, monitor_id: i64) -> EngineResult<TrackedState> {
        self.store
            .get_monitor(monitor_id)
            .map_err(|e| EngineError::from_db(e, "monitor", monitor_id))?;
        Ok(self
            .store
            .get_tracked_state(monitor_id)?
            .unwrap_or_else(|| TrackedState::new(monitor_id)))
    }

    /// Delete a monitor with its pings and tracked state. Waits for any
    /// evaluation in progress for the monitor to finish first.
    pub async fn delete_monitor(&self, monitor_id: i64) -> EngineResult<()> {
        let guard = self.locks.lock(monitor_id).await;
        self.store
            .delete_monitor(monitor_id)
            .map_err(|e| EngineError::from_db(e, "monitor", monitor_id))?;
        drop(guard);

        self.locks.forget(monitor_id);
        tracing::info!(monitor_id, "Monitor deleted");
        Ok(())
    }
}

fn outcome(ping: Ping, transition: Transition, state: &TrackedState) -> PingOutcome {
    PingOutcome {
        ping,
        transition,
        phase: state.phase(),
        incident_id: state.incident.as_ref().map(|i| i.id),
    }
}

fn down_message(monitor: &Monitor) -> String {
    format!(
        "It appears that {} is down. We are currently investigating this incident.",
        monitor.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::ProbeKind;
    use crate::incident::{EventBus, IncidentEvent};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    struct Harness {
        tracker: HealthTracker,
        manager: Arc<IncidentManager>,
        locks: Arc<MonitorLocks>,
        store: Arc<Store>,
        config: ConfigHandle,
        monitor_id: i64,
    }

    fn harness() -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut monitor = Monitor {
            name: "Checkout".to_string(),
            kind: ProbeKind::Http,
            target: "https://shop.example.com".to_string(),
            ..Default::default()
        };
        let monitor_id = store.add_monitor(&mut monitor).unwrap();

        let locks = Arc::new(MonitorLocks::new());
        let manager = Arc::new(IncidentManager::new(store.clone(), locks.clone(), EventBus::default()));
        let config = ConfigHandle::new(EngineConfig::default());
        let tracker = HealthTracker::new(store.clone(), manager.clone(), locks.clone(), config.clone());

        Harness {
            tracker,
            manager,
            locks,
            store,
            config,
            monitor_id,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[tokio::test]
    async fn test_failure_opens_incident_with_report() {
        let h = harness();
        let mut rx = h.manager.bus().subscribe();

        let out = h.tracker.record_ping(NewPing::failure(h.monitor_id, t(0))).await.unwrap();
        assert_eq!(out.transition, Transition::Open);
        assert_eq!(out.phase, HealthPhase::Investigating);

        let incident_id = out.incident_id.unwrap();
        let detail = h.manager.incident(incident_id).unwrap();
        assert_eq!(detail.incident.title, "Checkout is down");
        assert_eq!(detail.incident.started_at, t(0));
        assert_eq!(detail.reports.len(), 1);

        assert!(matches!(rx.try_recv(), Ok(IncidentEvent::IncidentOpened { .. })));
    }

    #[tokio::test]
    async fn test_unknown_monitor_and_bad_latency() {
        let h = harness();
        assert!(matches!(
            h.tracker.record_ping(NewPing::failure(42, t(0))).await,
            Err(EngineError::NotFound { entity: "monitor", id: 42 })
        ));
        assert!(matches!(
            h.tracker.record_ping(NewPing::success(h.monitor_id, -3.0, t(0))).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_still_stores_pings() {
        let h = harness();
        let mut cfg = EngineConfig::default();
        cfg.incidents.auto_enabled = false;
        h.config.replace(cfg).unwrap();

        let out = h.tracker.record_ping(NewPing::failure(h.monitor_id, t(0))).await.unwrap();
        assert_eq!(out.transition, Transition::Disabled);
        assert!(h.manager.list_incidents(true).unwrap().is_empty());
        assert_eq!(h.store.count_pings_since(h.monitor_id, t(-1)).unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_late_ping_does_not_reopen_resolved_incident() {
        let h = harness();
        h.tracker.record_ping(NewPing::failure(h.monitor_id, t(0))).await.unwrap();
        for i in 1..=5 {
            h.tracker
                .record_ping(NewPing::success(h.monitor_id, 20.0, t(i * 30)))
                .await
                .unwrap();
        }
        assert!(h.manager.list_incidents(true).unwrap().is_empty());

        // A retried failure from before the resolution.
        let out = h.tracker.record_ping(NewPing::failure(h.monitor_id, t(45))).await.unwrap();
        assert_eq!(out.transition, Transition::Stale);
        assert!(h.manager.list_incidents(true).unwrap().is_empty());
        assert_eq!(h.store.count_pings_since(h.monitor_id, t(-1)).unwrap().total, 7);

        let out = h.tracker.record_ping(NewPing::failure(h.monitor_id, t(600))).await.unwrap();
        assert_eq!(out.transition, Transition::Open);
        assert_eq!(h.manager.list_incidents(false).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledged_incident_is_not_auto_resolved() {
        let h = harness();
        let out = h.tracker.record_ping(NewPing::failure(h.monitor_id, t(0))).await.unwrap();
        let incident_id = out.incident_id.unwrap();
        h.manager.acknowledge_incident(incident_id).await.unwrap();

        for i in 1..=10 {
            let out = h
                .tracker
                .record_ping(NewPing::success(h.monitor_id, 15.0, t(i * 30)))
                .await
                .unwrap();
            assert_eq!(out.phase, HealthPhase::Manual);
        }
        assert_eq!(h.manager.current_phase(incident_id).unwrap(), ReportStatus::Investigating);

        h.manager.resolve_incident(incident_id, false).await.unwrap();
        let state = h.tracker.state(h.monitor_id).unwrap();
        assert_eq!(state.phase(), HealthPhase::Healthy);
    }

    #[tokio::test]
    async fn test_ping_waiting_on_deleted_monitor_leaves_no_rows() {
        let h = Arc::new(harness());
        let guard = h.locks.lock(h.monitor_id).await;

        let pending = {
            let h = h.clone();
            tokio::spawn(async move { h.tracker.record_ping(NewPing::failure(h.monitor_id, t(0))).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.store.delete_monitor(h.monitor_id).unwrap();
        drop(guard);

        assert!(matches!(
            pending.await.unwrap(),
            Err(EngineError::NotFound { entity: "monitor", .. })
        ));
        assert_eq!(h.store.count_pings_since(h.monitor_id, t(-1)).unwrap().total, 0);
        assert!(h.store.get_tracked_state(h.monitor_id).unwrap().is_none());
        assert!(h.manager.list_incidents(false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_monitor_waits_for_evaluation() {
        let h = harness();
        h.tracker.record_ping(NewPing::failure(h.monitor_id, t(0))).await.unwrap();

        h.tracker.delete_monitor(h.monitor_id).await.unwrap();
        assert!(h.store.get_tracked_state(h.monitor_id).unwrap().is_none());
        assert!(matches!(
            h.tracker.delete_monitor(h.monitor_id).await,
            Err(EngineError::NotFound { entity: "monitor", .. })
        ));
    }
}
