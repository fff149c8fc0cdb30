//! uptrail - uptime monitoring service.

use uptrail::config::{ConfigHandle, ConfigReloader, ServerConfig};
use uptrail::db::Store;
use uptrail::maintenance::EventCompleter;
use uptrail::notify::Dispatcher;
use uptrail::scheduler::Scheduler;
use uptrail::web::{AppState, Server};
use uptrail::Engine;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let engine_config = ConfigHandle::load(cfg.config_path.clone());
    let reloader = ConfigReloader::new(engine_config.clone());
    reloader.start();

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let engine = Engine::new(store.clone(), engine_config.clone());

    // Background tasks
    Dispatcher::new(engine_config.clone())?.spawn(engine.bus());
    let completer = EventCompleter::new(store.clone());
    completer.start();

    let scheduler = Arc::new(Scheduler::new(store.clone(), engine.tracker.clone()));
    scheduler.start().await?;

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        engine: engine_config,
        store,
        tracker: engine.tracker.clone(),
        incidents: engine.incidents.clone(),
        analytics: engine.analytics.clone(),
        scheduler,
    });
    server.start().await?;

    Ok(())
}
