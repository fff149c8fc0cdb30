//! HTTP request handlers.

use super::{ApiError, ApiResult, AppState};
use crate::analytics::{round2, DayBlock, DayStatus, HistoryOrder, Percentile};
use crate::db::{Incident, IncidentDetail, IncidentReport, Monitor, NewEvent, ProbeKind, ReportStatus, TrackedState};
use crate::error::EngineError;
use crate::health::{HealthPhase, PingOutcome};
use crate::maintenance::schedule_event;
use crate::status::{PageStatus, StatusInputs};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest window accepted by the analytics endpoints.
const MAX_WINDOW_DAYS: u32 = 366;

// ============================================================================
// API: Monitors
// ============================================================================

pub async fn handle_get_monitors(State(state): State<AppState>) -> ApiResult<Json<Vec<Monitor>>> {
    Ok(Json(state.store.get_monitors()?))
}

#[derive(Debug, Deserialize)]
pub struct CreateMonitorRequest {
    pub name: String,
    pub kind: ProbeKind,
    pub target: String,
    #[serde(default)]
    pub interval_secs: u32,
    #[serde(default)]
    pub timeout_secs: f64,
}

pub async fn handle_create_monitor(
    State(state): State<AppState>,
    Json(req): Json<CreateMonitorRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() || req.target.trim().is_empty() {
        return Err(EngineError::Validation("name and target are required".to_string()).into());
    }

    let mut monitor = Monitor {
        name: req.name.trim().to_string(),
        kind: req.kind,
        target: req.target.trim().to_string(),
        interval_secs: req.interval_secs,
        timeout_secs: req.timeout_secs,
        created_at: Utc::now(),
        ..Default::default()
    };
    state.store.add_monitor(&mut monitor)?;
    state.scheduler.add_monitor(monitor.clone()).await;

    Ok((StatusCode::CREATED, Json(monitor)))
}

pub async fn handle_delete_monitor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.scheduler.remove_monitor(id).await;
    state.tracker.delete_monitor(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RecordPingRequest {
    pub success: bool,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<serde_json::Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

pub async fn handle_record_ping(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RecordPingRequest>,
) -> ApiResult<impl IntoResponse> {
    let ping = crate::db::NewPing {
        monitor_id: id,
        success: req.success,
        latency_ms: req.latency_ms,
        status_code: req.status_code,
        headers: req.headers,
        body: req.body,
        created_at: req.created_at.unwrap_or_else(Utc::now),
    };
    let outcome: PingOutcome = state.tracker.record_ping(ping).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Serialize)]
pub struct MonitorStateResponse {
    pub phase: HealthPhase,
    #[serde(flatten)]
    pub state: TrackedState,
}

pub async fn handle_monitor_state(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<MonitorStateResponse>> {
    let tracked = state.tracker.state(id)?;
    Ok(Json(MonitorStateResponse {
        phase: tracked.phase(),
        state: tracked,
    }))
}

// ============================================================================
// API: Analytics
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub order: Option<HistoryOrder>,
}

fn window_days(requested: Option<u32>, default: u32) -> ApiResult<u32> {
    let days = requested.unwrap_or(default);
    if days > MAX_WINDOW_DAYS {
        return Err(ApiError::BadRequest(format!("days must be at most {}", MAX_WINDOW_DAYS)));
    }
    Ok(days)
}

#[derive(Debug, Serialize)]
pub struct UptimeResponse {
    pub monitor_id: i64,
    pub days: u32,
    /// `null` when the window holds no pings.
    pub uptime: Option<f64>,
}

pub async fn handle_uptime(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<UptimeResponse>> {
    let days = window_days(q.days, state.engine.snapshot().analytics.window_days)?;
    let uptime = state.analytics.uptime_percentage(id, days, Utc::now())?;

    Ok(Json(UptimeResponse {
        monitor_id: id,
        days,
        uptime: uptime.map(round2),
    }))
}

#[derive(Debug, Serialize)]
pub struct LatencyResponse {
    pub monitor_id: i64,
    pub days: u32,
    /// Milliseconds per percentile; empty without successful pings.
    pub percentiles: BTreeMap<Percentile, f64>,
}

pub async fn handle_latency(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<LatencyResponse>> {
    let days = window_days(q.days, state.engine.snapshot().analytics.window_days)?;
    let percentiles = state
        .analytics
        .latency_percentiles(id, days, &Percentile::STANDARD, Utc::now())?
        .into_iter()
        .map(|(p, d)| (p, round2(d.as_secs_f64() * 1000.0)))
        .collect();

    Ok(Json(LatencyResponse {
        monitor_id: id,
        days,
        percentiles,
    }))
}

#[derive(Debug, Serialize)]
pub struct DayBlockResponse {
    pub date: NaiveDate,
    pub status: DayStatus,
    pub uptime: Option<f64>,
    pub total_pings: u64,
    pub failed_pings: u64,
    pub incident_ids: Vec<i64>,
    pub event_ids: Vec<i64>,
}

impl From<&DayBlock> for DayBlockResponse {
    fn from(block: &DayBlock) -> Self {
        Self {
            date: block.date,
            status: block.status(),
            uptime: block.uptime().map(round2),
            total_pings: block.total_pings,
            failed_pings: block.failed_pings,
            incident_ids: block.incidents.iter().map(|i| i.id).collect(),
            event_ids: block.events.iter().map(|e| e.id).collect(),
        }
    }
}

pub async fn handle_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<Vec<DayBlockResponse>>> {
    let days = window_days(q.days, state.engine.snapshot().analytics.history_days)?;
    let blocks = state
        .analytics
        .daily_history(id, days, q.order.unwrap_or_default(), Utc::now())?;

    Ok(Json(blocks.iter().map(DayBlockResponse::from).collect()))
}

// ============================================================================
// API: Incidents
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListIncidentsQuery {
    #[serde(default)]
    pub open: bool,
}

pub async fn handle_list_incidents(
    State(state): State<AppState>,
    Query(q): Query<ListIncidentsQuery>,
) -> ApiResult<Json<Vec<Incident>>> {
    Ok(Json(state.incidents.list_incidents(q.open)?))
}

#[derive(Debug, Deserialize)]
pub struct OpenIncidentRequest {
    pub monitor_ids: Vec<i64>,
    pub title: String,
}

pub async fn handle_open_incident(
    State(state): State<AppState>,
    Json(req): Json<OpenIncidentRequest>,
) -> ApiResult<impl IntoResponse> {
    let incident = state.incidents.open_incident(&req.monitor_ids, &req.title).await?;
    Ok((StatusCode::CREATED, Json(incident)))
}

pub async fn handle_get_incident(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<IncidentDetail>> {
    Ok(Json(state.incidents.incident(id)?))
}

#[derive(Debug, Deserialize)]
pub struct RenameIncidentRequest {
    pub title: String,
}

pub async fn handle_rename_incident(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RenameIncidentRequest>,
) -> ApiResult<Json<Incident>> {
    Ok(Json(state.incidents.rename_incident(id, &req.title).await?))
}

#[derive(Debug, Deserialize)]
pub struct AppendReportRequest {
    pub status: ReportStatus,
    #[serde(default)]
    pub message: String,
}

pub async fn handle_append_report(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AppendReportRequest>,
) -> ApiResult<impl IntoResponse> {
    let report: IncidentReport = state.incidents.append_report(id, req.status, &req.message).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

pub async fn handle_resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Incident>> {
    Ok(Json(state.incidents.resolve_incident(id, false).await?))
}

pub async fn handle_acknowledge_incident(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Incident>> {
    Ok(Json(state.incidents.acknowledge_incident(id).await?))
}

// ============================================================================
// API: Maintenance
// ============================================================================

pub async fn handle_schedule_event(
    State(state): State<AppState>,
    Json(req): Json<NewEvent>,
) -> ApiResult<impl IntoResponse> {
    let event = schedule_event(&state.store, &req)?;
    Ok((StatusCode::CREATED, Json(event)))
}

// ============================================================================
// API: Status
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Comma separated monitor IDs; all monitors when absent.
    #[serde(default)]
    pub monitors: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: PageStatus,
    pub monitor_ids: Vec<i64>,
}

fn parse_ids(raw: &str) -> ApiResult<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| ApiError::BadRequest(format!("invalid monitor id: {}", s)))
        })
        .collect()
}

pub async fn handle_status(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> ApiResult<Json<StatusResponse>> {
    let monitor_ids = match q.monitors.as_deref() {
        Some(raw) => parse_ids(raw)?,
        None => state.store.get_monitors()?.into_iter().map(|m| m.id).collect(),
    };

    let inputs = StatusInputs::load(&state.store, &monitor_ids)?;
    Ok(Json(StatusResponse {
        status: inputs.project(Utc::now()),
        monitor_ids,
    }))
}
