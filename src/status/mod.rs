//! Aggregate status of a set of monitors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::db::{Event, Incident, Store};
use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Operational,
    Degraded,
    Down,
    Maintenance,
}

/// Monitor to incident and monitor to event adjacency.
#[derive(Debug, Clone, Default)]
pub struct MonitorLinks {
    incidents: HashMap<i64, BTreeSet<i64>>,
    events: HashMap<i64, BTreeSet<i64>>,
}

impl MonitorLinks {
    /// Build from `(monitor_id, incident_id)` and `(monitor_id, event_id)` pairs.
    pub fn from_pairs(
        incident_links: impl IntoIterator<Item = (i64, i64)>,
        event_links: impl IntoIterator<Item = (i64, i64)>,
    ) -> Self {
        let mut links = Self::default();
        for (monitor_id, incident_id) in incident_links {
            links.incidents.entry(monitor_id).or_default().insert(incident_id);
        }
        for (monitor_id, event_id) in event_links {
            links.events.entry(monitor_id).or_default().insert(event_id);
        }
        links
    }

    pub fn incidents_of(&self, monitor_id: i64) -> impl Iterator<Item = i64> + '_ {
        self.incidents.get(&monitor_id).into_iter().flatten().copied()
    }

    pub fn events_of(&self, monitor_id: i64) -> impl Iterator<Item = i64> + '_ {
        self.events.get(&monitor_id).into_iter().flatten().copied()
    }
}

/// Everything [`project_status`] needs about a set of monitors.
#[derive(Debug, Clone)]
pub struct StatusInputs {
    pub monitor_ids: Vec<i64>,
    pub incidents: Vec<Incident>,
    pub events: Vec<Event>,
    pub links: MonitorLinks,
}

impl StatusInputs {
    /// Load open incidents and uncompleted events linked to `monitor_ids`.
    pub fn load(store: &Store, monitor_ids: &[i64]) -> EngineResult<Self> {
        let (incidents, incident_links) = store.open_incident_links(monitor_ids)?;
        let (events, event_links) = store.pending_event_links(monitor_ids)?;

        Ok(Self {
            monitor_ids: monitor_ids.to_vec(),
            incidents,
            events,
            links: MonitorLinks::from_pairs(incident_links, event_links),
        })
    }

    pub fn project(&self, now: DateTime<Utc>) -> PageStatus {
        project_status(&self.monitor_ids, &self.incidents, &self.events, &self.links, now)
    }
}

/// Combine incidents and maintenance windows into one label.
///
/// Maintenance wins over everything. `Down` needs every monitor covered by
/// an open incident; an empty set is operational.
pub fn project_status(
    monitor_ids: &[i64],
    incidents: &[Incident],
    events: &[Event],
    links: &MonitorLinks,
    now: DateTime<Utc>,
) -> PageStatus {
    if monitor_ids.is_empty() {
        return PageStatus::Operational;
    }

    let open: BTreeSet<i64> = incidents.iter().filter(|i| i.is_open()).map(|i| i.id).collect();
    let running: BTreeSet<i64> = events
        .iter()
        .filter(|e| e.is_in_progress(now))
        .map(|e| e.id)
        .collect();

    let in_maintenance = monitor_ids
        .iter()
        .any(|m| links.events_of(*m).any(|e| running.contains(&e)));
    if in_maintenance {
        return PageStatus::Maintenance;
    }

    let covered = monitor_ids
        .iter()
        .filter(|m| links.incidents_of(**m).any(|i| open.contains(&i)))
        .count();

    match covered {
        0 => PageStatus::Operational,
        n if n == monitor_ids.len() => PageStatus::Down,
        _ => PageStatus::Degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap()
    }

    fn incident(id: i64, resolved: bool) -> Incident {
        Incident {
            id,
            title: format!("incident {}", id),
            started_at: now() - ChronoDuration::hours(1),
            acknowledged_at: None,
            resolved_at: resolved.then(now),
            auto_resolved: false,
        }
    }

    fn event(id: i64, starts_in_minutes: i64, completed: bool) -> Event {
        Event {
            id,
            title: "Maintenance".to_string(),
            message: String::new(),
            starts_at: now() + ChronoDuration::minutes(starts_in_minutes),
            duration_minutes: 60,
            auto_complete: true,
            completed,
        }
    }

    #[test]
    fn test_empty_set_is_operational() {
        let links = MonitorLinks::from_pairs([(1, 10)], []);
        let status = project_status(&[], &[incident(10, false)], &[], &links, now());
        assert_eq!(status, PageStatus::Operational);
    }

    #[test]
    fn test_down_only_when_every_monitor_is_covered() {
        let incidents = [incident(10, false)];
        let links = MonitorLinks::from_pairs([(1, 10), (2, 10)], []);

        assert_eq!(project_status(&[1, 2], &incidents, &[], &links, now()), PageStatus::Down);
        assert_eq!(project_status(&[1, 2, 3], &incidents, &[], &links, now()), PageStatus::Degraded);
        assert_eq!(project_status(&[3], &incidents, &[], &links, now()), PageStatus::Operational);
    }

    #[test]
    fn test_resolved_incidents_do_not_count() {
        let incidents = [incident(10, true)];
        let links = MonitorLinks::from_pairs([(1, 10)], []);
        assert_eq!(project_status(&[1], &incidents, &[], &links, now()), PageStatus::Operational);
    }

    #[test]
    fn test_running_maintenance_takes_precedence() {
        let incidents = [incident(10, false)];
        let events = [event(20, -30, false), event(21, 30, false), event(22, -30, true)];

        let links = MonitorLinks::from_pairs([(1, 10)], [(2, 20)]);
        assert_eq!(project_status(&[1, 2], &incidents, &events, &links, now()), PageStatus::Maintenance);

        // Not started yet, or already completed.
        let links = MonitorLinks::from_pairs([(1, 10)], [(1, 21), (1, 22)]);
        assert_eq!(project_status(&[1], &incidents, &events, &links, now()), PageStatus::Down);
    }
}
