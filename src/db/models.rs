//! Database model types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a monitor is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Http,
    Tcp,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Http => "http",
            ProbeKind::Tcp => "tcp",
        }
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ProbeKind::Http),
            "tcp" => Ok(ProbeKind::Tcp),
            other => Err(format!("unknown probe kind: {}", other)),
        }
    }
}

/// A monitored endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub name: String,
    pub kind: ProbeKind,
    pub target: String,
    pub interval_secs: u32,
    pub timeout_secs: f64,
    pub created_at: DateTime<Utc>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            kind: ProbeKind::Http,
            target: String::new(),
            interval_secs: 30,
            timeout_secs: 5.0,
            created_at: Utc::now(),
        }
    }
}

/// A single stored probe result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    pub id: i64,
    pub monitor_id: i64,
    pub success: bool,
    /// Round-trip latency in milliseconds, absent when the probe never completed.
    pub latency_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub headers: Option<serde_json::Value>,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A probe result that has not been stored yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPing {
    pub monitor_id: i64,
    pub success: bool,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<serde_json::Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NewPing {
    pub fn success(monitor_id: i64, latency_ms: f64, at: DateTime<Utc>) -> Self {
        Self {
            monitor_id,
            success: true,
            latency_ms: Some(latency_ms),
            status_code: None,
            headers: None,
            body: None,
            created_at: at,
        }
    }

    pub fn failure(monitor_id: i64, at: DateTime<Utc>) -> Self {
        Self {
            monitor_id,
            success: false,
            latency_ms: None,
            status_code: None,
            headers: None,
            body: None,
            created_at: at,
        }
    }
}

/// Number of pings in some window and how many of them failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingCounts {
    pub total: u64,
    pub failed: u64,
}

impl PingCounts {
    pub fn successful(&self) -> u64 {
        self.total.saturating_sub(self.failed)
    }
}

/// A tracked period of unhealthiness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: i64,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_resolved: bool,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Whether the incident was open at any point in `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.started_at < end && self.resolved_at.map_or(true, |r| r >= start)
    }
}

/// Phase of an incident as announced by its reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Investigating => "investigating",
            ReportStatus::Identified => "identified",
            ReportStatus::Monitoring => "monitoring",
            ReportStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "investigating" => Ok(ReportStatus::Investigating),
            "identified" => Ok(ReportStatus::Identified),
            "monitoring" => Ok(ReportStatus::Monitoring),
            "resolved" => Ok(ReportStatus::Resolved),
            other => Err(format!("unknown report status: {}", other)),
        }
    }
}

/// A timeline entry of an incident.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentReport {
    pub id: i64,
    pub incident_id: i64,
    pub status: ReportStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// An incident together with its monitors and timeline.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentDetail {
    #[serde(flatten)]
    pub incident: Incident,
    pub monitor_ids: Vec<i64>,
    pub reports: Vec<IncidentReport>,
}

/// A scheduled maintenance window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub message: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub auto_complete: bool,
    pub completed: bool,
}

impl Event {
    /// End of the window, saturating at the latest representable time.
    pub fn ends_at(&self) -> DateTime<Utc> {
        ChronoDuration::try_minutes(self.duration_minutes)
            .and_then(|d| self.starts_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the window covers `now` and has not been completed.
    pub fn is_in_progress(&self, now: DateTime<Utc>) -> bool {
        !self.completed && self.starts_at <= now && now <= self.ends_at()
    }

    /// Whether the window intersects `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.starts_at < end && self.ends_at() >= start
    }
}

/// A maintenance window that has not been stored yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub title: String,
    #[serde(default)]
    pub message: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i64,
    #[serde(default = "default_auto_complete")]
    pub auto_complete: bool,
    #[serde(default)]
    pub monitor_ids: Vec<i64>,
}

fn default_auto_complete() -> bool {
    true
}

/// Shadow copy of the incident a tracked state points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedIncident {
    pub id: i64,
    pub title: String,
    pub started_at: DateTime<Utc>,
}

impl From<&Incident> for TrackedIncident {
    fn from(incident: &Incident) -> Self {
        Self {
            id: incident.id,
            title: incident.title.clone(),
            started_at: incident.started_at,
        }
    }
}

/// Per-monitor state of the health state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedState {
    pub monitor_id: i64,
    pub incident: Option<TrackedIncident>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub investigating_report_emitted: bool,
    pub monitoring_report_emitted: bool,
    pub manual_override: bool,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_resolved_at: Option<DateTime<Utc>>,
}

impl TrackedState {
    pub fn new(monitor_id: i64) -> Self {
        Self {
            monitor_id,
            incident: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            investigating_report_emitted: false,
            monitoring_report_emitted: false,
            manual_override: false,
            last_ping_at: None,
            last_resolved_at: None,
        }
    }
}
