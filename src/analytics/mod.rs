//! Windowed statistics over stored pings.
//!
//! Everything here is read-only and may be called concurrently.

mod history;
mod percentile;

pub use history::*;
pub use percentile::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::db::Store;
use crate::error::{EngineError, EngineResult};

pub struct Analytics {
    store: Arc<Store>,
}

impl Analytics {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Percentage of successful pings in the last `window_days`.
    /// `None` when the window holds no pings.
    pub fn uptime_percentage(
        &self,
        monitor_id: i64,
        window_days: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<f64>> {
        let since = self.window_start(monitor_id, window_days, now)?;
        let counts = self.store.count_pings_since(monitor_id, since)?;
        Ok(uptime_ratio(counts.successful(), counts.total))
    }

    /// Interpolated latency percentiles of successful pings in the window.
    /// Percentiles are omitted when there is no latency sample.
    pub fn latency_percentiles(
        &self,
        monitor_id: i64,
        window_days: u32,
        percentiles: &[Percentile],
        now: DateTime<Utc>,
    ) -> EngineResult<BTreeMap<Percentile, Duration>> {
        let since = self.window_start(monitor_id, window_days, now)?;
        let samples = sorted_samples(self.store.successful_latencies_since(monitor_id, since)?);

        let mut result = BTreeMap::new();
        for p in percentiles {
            if let Some(ms) = interpolate(&samples, p.fraction()) {
                result.insert(*p, Duration::from_secs_f64(ms.max(0.0) / 1000.0));
            }
        }
        Ok(result)
    }

    /// One block per calendar day for the last `days` days, today included.
    pub fn daily_history(
        &self,
        monitor_id: i64,
        days: u32,
        order: HistoryOrder,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<DayBlock>> {
        self.ensure_monitor(monitor_id)?;
        if days == 0 {
            return Ok(Vec::new());
        }

        let today = now.date_naive();
        let start = day_start(first_day(today, days));
        let end = day_start(today) + ChronoDuration::days(1);

        let counts = self.store.daily_ping_counts(monitor_id, start)?;
        let incidents = self.store.incidents_for_monitor_between(monitor_id, start, end)?;
        let events = self.store.events_for_monitor_between(monitor_id, start, end)?;

        Ok(build_history(today, days, &counts, &incidents, &events, order))
    }

    fn window_start(&self, monitor_id: i64, window_days: u32, now: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
        if window_days == 0 {
            return Err(EngineError::Validation("window must be at least one day".to_string()));
        }
        self.ensure_monitor(monitor_id)?;
        Ok(now - ChronoDuration::days(i64::from(window_days)))
    }

    fn ensure_monitor(&self, monitor_id: i64) -> EngineResult<()> {
        self.store
            .get_monitor(monitor_id)
            .map(|_| ())
            .map_err(|e| EngineError::from_db(e, "monitor", monitor_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Monitor, NewPing};
    use chrono::TimeZone;

    fn setup() -> (Analytics, Arc<Store>, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut monitor = Monitor {
            name: "API".to_string(),
            target: "https://api.example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_monitor(&mut monitor).unwrap();
        (Analytics::new(store.clone()), store, id)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_uptime_without_pings_is_none() {
        let (analytics, _, id) = setup();
        assert_eq!(analytics.uptime_percentage(id, 7, now()).unwrap(), None);
        assert!(matches!(
            analytics.uptime_percentage(99, 7, now()),
            Err(EngineError::NotFound { entity: "monitor", .. })
        ));
        assert!(matches!(
            analytics.uptime_percentage(id, 0, now()),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_uptime_and_percentiles_ignore_failures_and_old_pings() {
        let (analytics, store, id) = setup();
        let at = now() - ChronoDuration::hours(1);
        for ms in [100.0, 200.0, 300.0] {
            store.insert_ping(&NewPing::success(id, ms, at)).unwrap();
        }
        let mut failed = NewPing::failure(id, at);
        failed.latency_ms = Some(5000.0);
        store.insert_ping(&failed).unwrap();
        store
            .insert_ping(&NewPing::success(id, 9000.0, now() - ChronoDuration::days(10)))
            .unwrap();

        let uptime = analytics.uptime_percentage(id, 7, now()).unwrap().unwrap();
        assert_eq!(uptime, 75.0);

        let latency = analytics.latency_percentiles(id, 7, &Percentile::STANDARD, now()).unwrap();
        assert_eq!(latency[&Percentile::P50].as_millis(), 200);
        assert!(latency[&Percentile::P99] < Duration::from_millis(301));
        assert_eq!(latency.len(), 5);

        let again = analytics.latency_percentiles(id, 7, &Percentile::STANDARD, now()).unwrap();
        assert_eq!(latency, again);
    }

    #[test]
    fn test_daily_history_is_stable() {
        let (analytics, store, id) = setup();
        store.insert_ping(&NewPing::failure(id, now())).unwrap();

        let first = analytics.daily_history(id, 45, HistoryOrder::Newest, now()).unwrap();
        let second = analytics.daily_history(id, 45, HistoryOrder::Newest, now()).unwrap();
        assert_eq!(first.len(), 45);
        assert_eq!(first, second);
        assert_eq!(first[0].date, now().date_naive());
        assert_eq!(first[0].status(), DayStatus::Down);
    }
}
