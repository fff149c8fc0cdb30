//! Web server module.

mod error;
mod handlers;

pub use error::*;
pub use handlers::*;

use crate::analytics::Analytics;
use crate::config::{ConfigHandle, ServerConfig};
use crate::db::Store;
use crate::health::HealthTracker;
use crate::incident::IncidentManager;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub engine: ConfigHandle,
    pub store: Arc<Store>,
    pub tracker: Arc<HealthTracker>,
    pub incidents: Arc<IncidentManager>,
    pub analytics: Arc<Analytics>,
    pub scheduler: Arc<Scheduler>,
}

/// Build the router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        // Monitors
        .route("/api/monitors", get(handlers::handle_get_monitors).post(handlers::handle_create_monitor))
        .route("/api/monitors/{id}", delete(handlers::handle_delete_monitor))
        .route("/api/monitors/{id}/pings", post(handlers::handle_record_ping))
        .route("/api/monitors/{id}/state", get(handlers::handle_monitor_state))
        .route("/api/monitors/{id}/uptime", get(handlers::handle_uptime))
        .route("/api/monitors/{id}/latency", get(handlers::handle_latency))
        .route("/api/monitors/{id}/history", get(handlers::handle_history))
        // Incidents
        .route("/api/incidents", get(handlers::handle_list_incidents).post(handlers::handle_open_incident))
        .route("/api/incidents/{id}", get(handlers::handle_get_incident).patch(handlers::handle_rename_incident))
        .route("/api/incidents/{id}/reports", post(handlers::handle_append_report))
        .route("/api/incidents/{id}/resolve", post(handlers::handle_resolve_incident))
        .route("/api/incidents/{id}/acknowledge", post(handlers::handle_acknowledge_incident))
        // Maintenance
        .route("/api/events", post(handlers::handle_schedule_event))
        // Aggregate status
        .route("/api/status", get(handlers::handle_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}

/// Web server for uptrail.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = router(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
