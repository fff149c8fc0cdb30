//! Notification dispatch for incident events.
//!
//! Delivery is best effort: failures are logged and never touch incident state.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::config::ConfigHandle;
use crate::incident::{EventBus, IncidentEvent};

/// Body POSTed to the configured webhook.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub text: String,
    pub event: &'a IncidentEvent,
}

/// Human readable one-liner for an event.
pub fn summary(event: &IncidentEvent) -> String {
    match event {
        IncidentEvent::IncidentOpened { incident, .. } => {
            format!("Incident opened: {}", incident.title)
        }
        IncidentEvent::IncidentReportAdded { incident, report } => {
            format!("[{}] {}: {}", report.status, incident.title, report.message)
        }
        IncidentEvent::IncidentResolved { incident, .. } => {
            format!("Incident resolved: {}", incident.title)
        }
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
    config: ConfigHandle,
}

impl Dispatcher {
    pub fn new(config: ConfigHandle) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .inspect_err(|e| tracing::error!("Dispatcher: failed to build webhook client: {}", e))?;
        Ok(Self { client, config })
    }

    /// Consume events from `bus` until it closes.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: broadcast::Receiver<IncidentEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.dispatch(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dispatcher: lagged behind, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn dispatch(&self, event: &IncidentEvent) {
        let text = summary(event);
        tracing::info!(incident_id = event.incident().id, "{}", text);

        let Some(url) = self.config.snapshot().notifications.webhook_url else {
            return;
        };

        let payload = WebhookPayload { text, event };
        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(incident_id = event.incident().id, "Webhook delivered");
            }
            Ok(resp) => {
                tracing::warn!(
                    incident_id = event.incident().id,
                    "Webhook {} answered {}",
                    url,
                    resp.status()
                );
            }
            Err(e) => {
                tracing::warn!(incident_id = event.incident().id, "Webhook {} failed: {}", url, e);
            }
        }
    }
}
