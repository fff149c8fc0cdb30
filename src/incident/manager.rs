//! Incident lifecycle: creation, timeline reports and resolution.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::events::{EventBus, IncidentEvent};
use crate::db::{
    Incident, IncidentDetail, IncidentReport, NewIncident, ReportStatus, Store, TrackedIncident,
    TrackedState,
};
use crate::error::{EngineError, EngineResult};
use crate::health::MonitorLocks;

/// Owns every write to incidents and their reports.
///
/// Public operations take the per-monitor locks of every linked monitor.
/// The `*_tracked` variants are called by the health tracker, which already
/// holds the lock of the monitor it evaluates.
pub struct IncidentManager {
    store: Arc<Store>,
    locks: Arc<MonitorLocks>,
    bus: EventBus,
}

impl IncidentManager {
    pub fn new(store: Arc<Store>, locks: Arc<MonitorLocks>, bus: EventBus) -> Self {
        Self { store, locks, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Open an incident by hand for one or more monitors.
    pub async fn open_incident(&self, monitor_ids: &[i64], title: &str) -> EngineResult<Incident> {
        let mut ids = monitor_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        if ids.is_empty() {
            return Err(EngineError::Validation("an incident needs at least one monitor".to_string()));
        }
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("incident title must not be empty".to_string()));
        }
        for id in &ids {
            self.store
                .get_monitor(*id)
                .map_err(|e| EngineError::from_db(e, "monitor", *id))?;
        }

        let _guards = self.locks.lock_many(&ids).await;

        let (_, links) = self.store.open_incident_links(&ids)?;
        if let Some((monitor_id, incident_id)) = links.first() {
            return Err(EngineError::Conflict(format!(
                "monitor {} already has open incident {}",
                monitor_id, incident_id
            )));
        }

        let mut tracked = Vec::with_capacity(ids.len());
        for id in &ids {
            let mut state = self
                .store
                .get_tracked_state(*id)?
                .unwrap_or_else(|| TrackedState::new(*id));
            state.consecutive_successes = 0;
            state.consecutive_failures = 0;
            state.investigating_report_emitted = true;
            state.monitoring_report_emitted = false;
            state.manual_override = true;
            tracked.push(state);
        }

        let started_at = Utc::now();
        let (incident, report) = self.store.create_incident(
            &NewIncident {
                title,
                started_at,
                monitor_ids: &ids,
                message: "We are currently investigating this incident.",
            },
            &mut tracked,
        )?;

        tracing::info!(incident_id = incident.id, monitors = ?ids, "Incident opened manually");
        self.bus.publish(IncidentEvent::IncidentOpened {
            incident: incident.clone(),
            monitor_ids: ids,
            report,
        });

        Ok(incident)
    }

    /// Append an operator report. A `resolved` status closes the incident;
    /// re-applying it to a resolved incident returns the existing report.
    pub async fn append_report(
        &self,
        incident_id: i64,
        status: ReportStatus,
        message: &str,
    ) -> EngineResult<IncidentReport> {
        let monitor_ids = self.linked_monitors(incident_id)?;
        let _guards = self.locks.lock_many(&monitor_ids).await;

        let incident = self.load_incident(incident_id)?;
        if !incident.is_open() {
            if status == ReportStatus::Resolved {
                return self.store.last_report(incident_id)?.ok_or_else(|| {
                    EngineError::Conflict(format!("incident {} is resolved but has no report", incident_id))
                });
            }
            return Err(EngineError::Conflict(format!(
                "incident {} is resolved; cannot add a {} report",
                incident_id, status
            )));
        }

        if status == ReportStatus::Resolved {
            return match self.resolve_locked(&incident, false, message, Utc::now(), incident.started_at, &[])? {
                Some((_, report)) => Ok(report),
                None => self.store.last_report(incident_id)?.ok_or_else(|| {
                    EngineError::Conflict(format!("incident {} has no reports", incident_id))
                }),
            };
        }

        let report = self
            .store
            .append_report(incident_id, status, message, Utc::now(), &[], true)?;

        tracing::info!(incident_id, status = %status, "Incident report added");
        self.bus.publish(IncidentEvent::IncidentReportAdded {
            incident,
            report: report.clone(),
        });
        Ok(report)
    }

    /// Close an incident. Resolving an already resolved incident is a no-op.
    pub async fn resolve_incident(&self, incident_id: i64, auto: bool) -> EngineResult<Incident> {
        let monitor_ids = self.linked_monitors(incident_id)?;
        let _guards = self.locks.lock_many(&monitor_ids).await;

        let incident = self.load_incident(incident_id)?;
        if !incident.is_open() {
            return Ok(incident);
        }

        let now = Utc::now();
        let message = if auto {
            "The incident has been resolved automatically."
        } else {
            "The incident has been resolved."
        };
        // Each reset state keeps its last evaluated ping as the watermark.
        match self.resolve_locked(&incident, auto, message, now, incident.started_at, &[])? {
            Some((resolved, _)) => Ok(resolved),
            None => self.load_incident(incident_id),
        }
    }

    /// Record operator acknowledgement. Automatic reports and resolution
    /// stop for every linked monitor until the incident is resolved.
    pub async fn acknowledge_incident(&self, incident_id: i64) -> EngineResult<Incident> {
        let monitor_ids = self.linked_monitors(incident_id)?;
        let _guards = self.locks.lock_many(&monitor_ids).await;

        let incident = self.load_incident(incident_id)?;
        if !incident.is_open() {
            return Err(EngineError::Conflict(format!(
                "incident {} is already resolved",
                incident_id
            )));
        }

        let incident = self
            .store
            .acknowledge_incident(incident_id, Utc::now())
            .map_err(|e| EngineError::from_db(e, "incident", incident_id))?;
        tracing::info!(incident_id, "Incident acknowledged");
        Ok(incident)
    }

    pub async fn rename_incident(&self, incident_id: i64, title: &str) -> EngineResult<Incident> {
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("incident title must not be empty".to_string()));
        }

        let monitor_ids = self.linked_monitors(incident_id)?;
        let _guards = self.locks.lock_many(&monitor_ids).await;

        self.store
            .rename_incident(incident_id, title)
            .map_err(|e| EngineError::from_db(e, "incident", incident_id))
    }

    /// An incident with its monitors and full timeline.
    pub fn incident(&self, incident_id: i64) -> EngineResult<IncidentDetail> {
        let incident = self.load_incident(incident_id)?;
        Ok(IncidentDetail {
            monitor_ids: self.store.incident_monitor_ids(incident_id)?,
            reports: self.store.get_reports(incident_id)?,
            incident,
        })
    }

    pub fn list_incidents(&self, open_only: bool) -> EngineResult<Vec<Incident>> {
        Ok(self.store.get_incidents(open_only)?)
    }

    /// The phase announced by the latest report.
    pub fn current_phase(&self, incident_id: i64) -> EngineResult<ReportStatus> {
        self.load_incident(incident_id)?;
        self.store
            .last_report(incident_id)?
            .map(|r| r.status)
            .ok_or_else(|| EngineError::Conflict(format!("incident {} has no reports", incident_id)))
    }

    // --- Health tracker entry points (caller holds the monitor lock) ---

    /// Open an incident for the monitor of `state`, saving the state in the
    /// same transaction.
    pub(crate) fn open_tracked(
        &self,
        state: &mut TrackedState,
        title: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<Incident> {
        let monitor_ids = [state.monitor_id];

        // Operator incidents opened while this monitor had no tracked state
        // are adopted instead of duplicated.
        let (open, _) = self.store.open_incident_links(&monitor_ids)?;
        if let Some(existing) = open.into_iter().next() {
            state.incident = Some(TrackedIncident::from(&existing));
            state.manual_override = true;
            self.store.save_tracked_state(state)?;
            tracing::warn!(
                monitor_id = state.monitor_id,
                incident_id = existing.id,
                "Tracked state adopted an already open incident"
            );
            return Ok(existing);
        }

        let (incident, report) = self.store.create_incident(
            &NewIncident {
                title,
                started_at: at,
                monitor_ids: &monitor_ids,
                message,
            },
            std::slice::from_mut(state),
        )?;

        tracing::info!(monitor_id = state.monitor_id, incident_id = incident.id, "Incident opened");
        self.bus.publish(IncidentEvent::IncidentOpened {
            incident: incident.clone(),
            monitor_ids: monitor_ids.to_vec(),
            report,
        });
        Ok(incident)
    }

    /// Append an automatic report and save `state` atomically.
    pub(crate) fn report_tracked(
        &self,
        state: &TrackedState,
        status: ReportStatus,
        message: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<IncidentReport> {
        let incident_id = tracked_incident_id(state)?;
        let report = self
            .store
            .append_report(incident_id, status, message, at, std::slice::from_ref(state), false)?;
        let incident = self.load_incident(incident_id)?;

        tracing::info!(monitor_id = state.monitor_id, incident_id, status = %status, "Incident report added");
        self.bus.publish(IncidentEvent::IncidentReportAdded {
            incident,
            report: report.clone(),
        });
        Ok(report)
    }

    /// Auto-resolve the incident of `state`. On success `state` is back at
    /// the healthy baseline with `at` as its watermark.
    pub(crate) fn resolve_tracked(
        &self,
        state: &mut TrackedState,
        message: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<Incident>> {
        let incident_id = tracked_incident_id(state)?;
        let incident = self.load_incident(incident_id)?;

        let mut reset = state.clone();
        reset.reset_after_resolve(at);
        let resolved = self.resolve_locked(&incident, true, message, at, at, std::slice::from_ref(&reset))?;

        *state = reset;
        Ok(resolved.map(|(incident, _)| incident))
    }

    fn resolve_locked(
        &self,
        incident: &Incident,
        auto: bool,
        message: &str,
        resolved_at: DateTime<Utc>,
        watermark: DateTime<Utc>,
        tracked: &[TrackedState],
    ) -> EngineResult<Option<(Incident, IncidentReport)>> {
        // Never resolve before the incident started.
        let resolved_at = resolved_at.max(incident.started_at);
        let outcome = self
            .store
            .resolve_incident(incident.id, resolved_at, auto, message, watermark, tracked)
            .map_err(|e| EngineError::from_db(e, "incident", incident.id))?;

        if let Some((resolved, report)) = &outcome {
            tracing::info!(incident_id = resolved.id, auto, "Incident resolved");
            self.bus.publish(IncidentEvent::IncidentResolved {
                incident: resolved.clone(),
                report: report.clone(),
            });
        }
        Ok(outcome)
    }

    fn load_incident(&self, incident_id: i64) -> EngineResult<Incident> {
        self.store
            .get_incident(incident_id)
            .map_err(|e| EngineError::from_db(e, "incident", incident_id))
    }

    fn linked_monitors(&self, incident_id: i64) -> EngineResult<Vec<i64>> {
        self.load_incident(incident_id)?;
        Ok(self.store.incident_monitor_ids(incident_id)?)
    }
}

fn tracked_incident_id(state: &TrackedState) -> EngineResult<i64> {
    state.incident.as_ref().map(|i| i.id).ok_or_else(|| {
        EngineError::Conflict(format!("monitor {} has no open incident", state.monitor_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Monitor, ProbeKind};

    fn setup() -> (IncidentManager, Arc<Store>, Vec<i64>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut ids = Vec::new();
        for name in ["api", "web"] {
            let mut monitor = Monitor {
                name: name.to_string(),
                kind: ProbeKind::Http,
                target: format!("https://{}.example.com", name),
                ..Default::default()
            };
            ids.push(store.add_monitor(&mut monitor).unwrap());
        }
        let manager = IncidentManager::new(store.clone(), Arc::new(MonitorLocks::new()), EventBus::default());
        (manager, store, ids)
    }

    #[tokio::test]
    async fn test_open_incident_validates_input() {
        let (manager, _, ids) = setup();

        assert!(matches!(
            manager.open_incident(&[], "Outage").await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            manager.open_incident(&ids, "  ").await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            manager.open_incident(&[999], "Outage").await,
            Err(EngineError::NotFound { entity: "monitor", id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_open_incident_writes_initial_report_and_publishes() {
        let (manager, store, ids) = setup();
        let mut rx = manager.bus().subscribe();

        let incident = manager.open_incident(&ids, "Database outage").await.unwrap();
        let detail = manager.incident(incident.id).unwrap();
        assert_eq!(detail.monitor_ids, ids);
        assert_eq!(detail.reports.len(), 1);
        assert_eq!(detail.reports[0].status, ReportStatus::Investigating);
        assert_eq!(manager.current_phase(incident.id).unwrap(), ReportStatus::Investigating);

        let state = store.get_tracked_state(ids[0]).unwrap().unwrap();
        assert!(state.manual_override);
        assert!(state.investigating_report_emitted);

        match rx.recv().await.unwrap() {
            IncidentEvent::IncidentOpened { incident: opened, monitor_ids, .. } => {
                assert_eq!(opened.id, incident.id);
                assert_eq!(monitor_ids, ids);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(matches!(
            manager.open_incident(&ids[..1], "Again").await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_append_report_and_resolve_rules() {
        let (manager, store, ids) = setup();
        let incident = manager.open_incident(&ids[..1], "Slow responses").await.unwrap();

        let report = manager
            .append_report(incident.id, ReportStatus::Identified, "Cache node lost")
            .await
            .unwrap();
        assert_eq!(report.status, ReportStatus::Identified);
        assert_eq!(manager.current_phase(incident.id).unwrap(), ReportStatus::Identified);

        let resolved = manager.resolve_incident(incident.id, false).await.unwrap();
        assert!(resolved.resolved_at.is_some());
        assert!(!resolved.auto_resolved);

        let state = store.get_tracked_state(ids[0]).unwrap().unwrap();
        assert!(state.incident.is_none());
        assert!(!state.manual_override);

        // Idempotent resolution, then conflicts for anything else.
        let again = manager.resolve_incident(incident.id, false).await.unwrap();
        assert_eq!(again.resolved_at, resolved.resolved_at);
        let last = manager
            .append_report(incident.id, ReportStatus::Resolved, "done")
            .await
            .unwrap();
        assert_eq!(last.status, ReportStatus::Resolved);
        assert_eq!(store.get_reports(incident.id).unwrap().len(), 3);

        assert!(matches!(
            manager.append_report(incident.id, ReportStatus::Monitoring, "hm").await,
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            manager.acknowledge_incident(incident.id).await,
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            manager.append_report(404, ReportStatus::Identified, "x").await,
            Err(EngineError::NotFound { entity: "incident", id: 404 })
        ));
    }

    #[tokio::test]
    async fn test_resolved_report_closes_open_incident() {
        let (manager, _, ids) = setup();
        let incident = manager.open_incident(&ids, "Outage").await.unwrap();

        let report = manager
            .append_report(incident.id, ReportStatus::Resolved, "All clear")
            .await
            .unwrap();
        assert_eq!(report.status, ReportStatus::Resolved);
        assert_eq!(report.message, "All clear");

        let detail = manager.incident(incident.id).unwrap();
        assert!(!detail.incident.is_open());
        assert!(manager.list_incidents(true).unwrap().is_empty());
        assert_eq!(manager.list_incidents(false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_and_acknowledge() {
        let (manager, store, ids) = setup();
        let incident = manager.open_incident(&ids[..1], "Outage").await.unwrap();

        let renamed = manager.rename_incident(incident.id, "API outage").await.unwrap();
        assert_eq!(renamed.title, "API outage");
        let state = store.get_tracked_state(ids[0]).unwrap().unwrap();
        assert_eq!(state.incident.unwrap().title, "API outage");

        let acked = manager.acknowledge_incident(incident.id).await.unwrap();
        assert!(acked.acknowledged_at.is_some());
    }
}
