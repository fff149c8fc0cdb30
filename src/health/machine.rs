//! Pure transition rules of the per-monitor health state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::IncidentConfig;
use crate::db::TrackedState;

/// Debounce thresholds applied by [`TrackedState::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Consecutive failures that open an incident.
    pub failure: u32,
    /// Consecutive successes before the `monitoring` report (N).
    pub monitoring: u32,
    /// Consecutive successes before auto-resolution (M > N).
    pub resolve: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(&IncidentConfig::default())
    }
}

impl From<&IncidentConfig> for Thresholds {
    fn from(cfg: &IncidentConfig) -> Self {
        Self {
            failure: cfg.failure_threshold.max(1),
            monitoring: cfg.monitoring_threshold.max(1),
            resolve: cfg.resolve_threshold.max(cfg.monitoring_threshold + 1),
        }
    }
}

/// Observable phase of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPhase {
    Healthy,
    FailingUnconfirmed,
    Investigating,
    Monitoring,
    Manual,
}

/// What a single ping did to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Older than the current incident or the last resolution; stored only.
    Stale,
    /// Automatic evaluation is switched off.
    Disabled,
    /// Success while healthy.
    Steady,
    /// Failure below the failure threshold.
    Suspect,
    /// Failure that opens a new incident.
    Open,
    /// Failure during an open incident; recovery counters cleared.
    Reset,
    /// Failure after the `monitoring` report; the incident goes back to investigating.
    Relapse,
    /// Success during an open incident below any threshold.
    Recovering,
    /// Success reaching the monitoring threshold for the first time.
    Monitoring,
    /// Success reaching the resolve threshold.
    Resolve,
}

impl TrackedState {
    pub fn phase(&self) -> HealthPhase {
        match &self.incident {
            None if self.consecutive_failures > 0 => HealthPhase::FailingUnconfirmed,
            None => HealthPhase::Healthy,
            Some(_) if self.manual_override => HealthPhase::Manual,
            Some(_) if self.monitoring_report_emitted => HealthPhase::Monitoring,
            Some(_) => HealthPhase::Investigating,
        }
    }

    /// Whether a ping taken at `at` predates what this state already reflects.
    pub fn is_stale(&self, at: DateTime<Utc>) -> bool {
        match (&self.incident, self.last_resolved_at) {
            (Some(incident), _) => at < incident.started_at,
            (None, Some(resolved)) => at < resolved,
            (None, None) => false,
        }
    }

    /// Apply one ping. Counters and emission flags are updated in place;
    /// the caller persists the result and performs the incident side of
    /// `Open`, `Relapse`, `Monitoring` and `Resolve`.
    pub fn step(&mut self, success: bool, at: DateTime<Utc>, thresholds: &Thresholds) -> Transition {
        if self.is_stale(at) {
            return Transition::Stale;
        }
        self.last_ping_at = Some(at);

        if !success {
            self.consecutive_successes = 0;

            if self.incident.is_none() {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures < thresholds.failure {
                    return Transition::Suspect;
                }
                self.consecutive_failures = 0;
                self.investigating_report_emitted = true;
                self.monitoring_report_emitted = false;
                return Transition::Open;
            }

            if self.monitoring_report_emitted && !self.manual_override {
                self.monitoring_report_emitted = false;
                return Transition::Relapse;
            }
            return Transition::Reset;
        }

        if self.incident.is_none() {
            self.consecutive_failures = 0;
            return Transition::Steady;
        }

        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        if self.manual_override {
            return Transition::Recovering;
        }
        if self.consecutive_successes >= thresholds.resolve {
            return Transition::Resolve;
        }
        if self.consecutive_successes >= thresholds.monitoring && !self.monitoring_report_emitted {
            self.monitoring_report_emitted = true;
            return Transition::Monitoring;
        }
        Transition::Recovering
    }

    /// Return to the healthy baseline after the open incident was resolved.
    pub fn reset_after_resolve(&mut self, watermark: DateTime<Utc>) {
        self.incident = None;
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
        self.investigating_report_emitted = false;
        self.monitoring_report_emitted = false;
        self.manual_override = false;
        self.last_resolved_at = Some(watermark);
    }
}
