//! Probe module for endpoint checks.
//!
//! Supports HTTP and TCP connect probes.

mod http;
mod tcp;

pub use http::*;
pub use tcp::*;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::db::{Monitor, NewPing, ProbeKind};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    pub target: String,
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn new(kind: ProbeKind, target: &str, timeout: Duration) -> Self {
        Self {
            kind,
            target: target.to_string(),
            timeout,
        }
    }

    pub fn for_monitor(monitor: &Monitor) -> Self {
        let timeout = if monitor.timeout_secs.is_finite() && monitor.timeout_secs > 0.0 {
            monitor.timeout_secs
        } else {
            5.0
        };
        Self::new(monitor.kind, &monitor.target, Duration::from_secs_f64(timeout))
    }
}

/// What a probe observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: Option<f64>,
    pub status_code: Option<u16>,
    pub headers: Option<serde_json::Value>,
    pub body: Option<String>,
}

impl ProbeOutcome {
    /// A probe that never got an answer.
    pub fn failed(error: &ProbeError) -> Self {
        Self {
            success: false,
            body: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn into_ping(self, monitor_id: i64, at: DateTime<Utc>) -> NewPing {
        NewPing {
            monitor_id,
            success: self.success,
            latency_ms: self.latency_ms,
            status_code: self.status_code,
            headers: self.headers,
            body: self.body,
            created_at: at,
        }
    }
}

/// Run a probe with the given configuration.
///
/// Network failures and timeouts become failed outcomes; only configuration
/// problems are returned as errors.
pub async fn run_probe(config: &ProbeConfig) -> Result<ProbeOutcome, ProbeError> {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let result = match config.kind {
        ProbeKind::Http => run_http_probe(&config.target, config.timeout).await,
        ProbeKind::Tcp => run_tcp_probe(&config.target, config.timeout).await,
    };

    match result {
        Ok(mut outcome) => {
            if outcome.latency_ms.map_or(false, |ms| ms >= config.timeout.as_secs_f64() * 1000.0) {
                outcome.success = false;
            }
            Ok(outcome)
        }
        Err(ProbeError::Config(msg)) => Err(ProbeError::Config(msg)),
        Err(e) => Ok(ProbeOutcome::failed(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_into_ping() {
        let at = Utc::now();
        let outcome = ProbeOutcome {
            success: true,
            latency_ms: Some(12.5),
            status_code: Some(204),
            ..Default::default()
        };
        let ping = outcome.into_ping(7, at);
        assert_eq!(ping.monitor_id, 7);
        assert!(ping.success);
        assert_eq!(ping.status_code, Some(204));
        assert_eq!(ping.created_at, at);

        let failed = ProbeOutcome::failed(&ProbeError::Timeout(Duration::from_secs(1)));
        assert!(!failed.success);
        assert!(failed.latency_ms.is_none());
    }

    #[test]
    fn test_config_falls_back_to_default_timeout() {
        let monitor = Monitor {
            kind: ProbeKind::Tcp,
            target: "127.0.0.1:1".to_string(),
            timeout_secs: -1.0,
            ..Default::default()
        };
        let config = ProbeConfig::for_monitor(&monitor);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }
}
