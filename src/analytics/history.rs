//! Day-bucketed history blocks.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::percentile::uptime_ratio;
use crate::db::{Event, Incident, PingCounts};

/// Display classification of one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayStatus {
    Empty,
    Operational,
    Degraded,
    Maintenance,
    Down,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOrder {
    #[default]
    #[serde(alias = "oldest_first")]
    Oldest,
    #[serde(alias = "newest_first")]
    Newest,
}

/// Aggregates of one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayBlock {
    pub date: NaiveDate,
    pub total_pings: u64,
    pub failed_pings: u64,
    pub incidents: Vec<Incident>,
    pub events: Vec<Event>,
}

impl DayBlock {
    pub fn status(&self) -> DayStatus {
        if self.total_pings == 0 {
            DayStatus::Empty
        } else if !self.events.is_empty() {
            DayStatus::Maintenance
        } else if self.failed_pings == self.total_pings {
            DayStatus::Down
        } else if !self.incidents.is_empty() || self.failed_pings > 0 {
            DayStatus::Degraded
        } else {
            DayStatus::Operational
        }
    }

    /// Uptime in percent, `None` for days without pings.
    pub fn uptime(&self) -> Option<f64> {
        uptime_ratio(self.total_pings.saturating_sub(self.failed_pings), self.total_pings)
    }
}

/// Start of a UTC day.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(date.and_time(chrono::NaiveTime::MIN), Utc)
}

/// The first day of a `days`-long history ending on `today`.
pub fn first_day(today: NaiveDate, days: u32) -> NaiveDate {
    today - ChronoDuration::days(i64::from(days.max(1)) - 1)
}

/// Build exactly `days` blocks ending on `today` (inclusive). Days without
/// any pings are kept with zero counts.
pub fn build_history(
    today: NaiveDate,
    days: u32,
    counts: &[(NaiveDate, PingCounts)],
    incidents: &[Incident],
    events: &[Event],
    order: HistoryOrder,
) -> Vec<DayBlock> {
    if days == 0 {
        return Vec::new();
    }

    let by_day: HashMap<NaiveDate, PingCounts> = counts.iter().copied().collect();
    let first = first_day(today, days);

    let mut blocks: Vec<DayBlock> = (0..i64::from(days))
        .map(|offset| {
            let date = first + ChronoDuration::days(offset);
            let start = day_start(date);
            let end = start + ChronoDuration::days(1);
            let counts = by_day.get(&date).copied().unwrap_or_default();

            DayBlock {
                date,
                total_pings: counts.total,
                failed_pings: counts.failed,
                incidents: incidents.iter().filter(|i| i.overlaps(start, end)).cloned().collect(),
                events: events.iter().filter(|e| e.overlaps(start, end)).cloned().collect(),
            }
        })
        .collect();

    if order == HistoryOrder::Newest {
        blocks.reverse();
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, d).unwrap()
    }

    fn incident(start: DateTime<Utc>, resolved: Option<DateTime<Utc>>) -> Incident {
        Incident {
            id: 1,
            title: "down".to_string(),
            started_at: start,
            acknowledged_at: None,
            resolved_at: resolved,
            auto_resolved: resolved.is_some(),
        }
    }

    #[test]
    fn test_history_has_fixed_length_and_order() {
        let counts = vec![(date(10), PingCounts { total: 10, failed: 1 })];
        let oldest = build_history(date(10), 45, &counts, &[], &[], HistoryOrder::Oldest);
        assert_eq!(oldest.len(), 45);
        assert_eq!(oldest[44].date, date(10));
        assert_eq!(oldest[44].total_pings, 10);
        assert_eq!(oldest[0].status(), DayStatus::Empty);
        assert_eq!(oldest[0].uptime(), None);

        let newest = build_history(date(10), 45, &counts, &[], &[], HistoryOrder::Newest);
        assert_eq!(newest[0].date, date(10));
        assert_eq!(newest.iter().rev().cloned().collect::<Vec<_>>(), oldest);

        assert!(build_history(date(10), 0, &counts, &[], &[], HistoryOrder::Oldest).is_empty());
    }

    #[test]
    fn test_incidents_attach_to_every_day_they_were_open() {
        let start = Utc.with_ymd_and_hms(2024, 8, 8, 23, 0, 0).unwrap();
        let resolved = Utc.with_ymd_and_hms(2024, 8, 9, 1, 0, 0).unwrap();
        let counts: Vec<_> = (7..=10).map(|d| (date(d), PingCounts { total: 4, failed: 0 })).collect();

        let blocks = build_history(
            date(10),
            4,
            &counts,
            &[incident(start, Some(resolved))],
            &[],
            HistoryOrder::Oldest,
        );
        let with_incident: Vec<_> = blocks.iter().map(|b| b.incidents.len()).collect();
        assert_eq!(with_incident, vec![0, 1, 1, 0]);
        assert_eq!(blocks[1].status(), DayStatus::Degraded);
        assert_eq!(blocks[3].status(), DayStatus::Operational);

        let open = build_history(date(10), 4, &counts, &[incident(start, None)], &[], HistoryOrder::Oldest);
        assert_eq!(open.iter().filter(|b| !b.incidents.is_empty()).count(), 3);
    }

    #[test]
    fn test_day_status_classification() {
        let mut block = DayBlock {
            date: date(1),
            total_pings: 5,
            failed_pings: 5,
            incidents: Vec::new(),
            events: Vec::new(),
        };
        assert_eq!(block.status(), DayStatus::Down);
        assert_eq!(block.uptime(), Some(0.0));

        block.failed_pings = 1;
        assert_eq!(block.status(), DayStatus::Degraded);
        assert_eq!(block.uptime(), Some(80.0));

        block.events.push(Event {
            id: 1,
            title: "Upgrade".to_string(),
            message: String::new(),
            starts_at: day_start(date(1)),
            duration_minutes: 30,
            auto_complete: true,
            completed: true,
        });
        assert_eq!(block.status(), DayStatus::Maintenance);
    }
}
