//! uptrail - monitor health evaluation and incident lifecycle engine.
//!
//! Probe results flow into the [`health::HealthTracker`], which drives one
//! debounced state machine per monitor and asks the
//! [`incident::IncidentManager`] to open, report on and resolve incidents.
//! [`analytics::Analytics`] and [`status`] derive read-only views from the
//! stored data.

pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod incident;
pub mod maintenance;
pub mod notify;
pub mod probe;
pub mod scheduler;
pub mod status;
pub mod web;

use std::sync::Arc;

use analytics::Analytics;
use config::ConfigHandle;
use db::Store;
use health::{HealthTracker, MonitorLocks};
use incident::{EventBus, IncidentManager};

/// The wired engine components, sharing one store and one lock table.
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<Store>,
    pub config: ConfigHandle,
    pub incidents: Arc<IncidentManager>,
    pub tracker: Arc<HealthTracker>,
    pub analytics: Arc<Analytics>,
}

impl Engine {
    pub fn new(store: Arc<Store>, config: ConfigHandle) -> Self {
        let locks = Arc::new(MonitorLocks::new());
        let incidents = Arc::new(IncidentManager::new(store.clone(), locks.clone(), EventBus::default()));
        let tracker = Arc::new(HealthTracker::new(
            store.clone(),
            incidents.clone(),
            locks,
            config.clone(),
        ));
        let analytics = Arc::new(Analytics::new(store.clone()));

        Self {
            store,
            config,
            incidents,
            tracker,
            analytics,
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.incidents.bus()
    }
}
