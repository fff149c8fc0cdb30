//! Incident lifecycle domain events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::{Incident, IncidentReport};

/// Emitted after the corresponding change has been committed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncidentEvent {
    IncidentOpened {
        incident: Incident,
        monitor_ids: Vec<i64>,
        report: IncidentReport,
    },
    IncidentReportAdded {
        incident: Incident,
        report: IncidentReport,
    },
    IncidentResolved {
        incident: Incident,
        report: IncidentReport,
    },
}

impl IncidentEvent {
    pub fn incident(&self) -> &Incident {
        match self {
            IncidentEvent::IncidentOpened { incident, .. }
            | IncidentEvent::IncidentReportAdded { incident, .. }
            | IncidentEvent::IncidentResolved { incident, .. } => incident,
        }
    }

    pub fn report(&self) -> &IncidentReport {
        match self {
            IncidentEvent::IncidentOpened { report, .. }
            | IncidentEvent::IncidentReportAdded { report, .. }
            | IncidentEvent::IncidentResolved { report, .. } => report,
        }
    }
}

/// Fan-out channel for [`IncidentEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IncidentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IncidentEvent> {
        self.tx.subscribe()
    }

    /// Publish without waiting for anyone. Having no subscriber is not an error.
    pub fn publish(&self, event: IncidentEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(incident_id = e.0.incident().id, "No subscribers for incident event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
