//! Configuration module for uptrail.
//!
//! Server settings come from environment variables and need a restart.
//! Engine settings (incident thresholds, analytics windows, notifications)
//! come from an optional TOML file and can be reloaded while running.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::Mutex;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Optional engine config file
    pub config_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            config_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_CONFIG`: Engine config file (default: none)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("UPTRAIL_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(path) = env::var("UPTRAIL_CONFIG") {
            if !path.is_empty() {
                cfg.config_path = Some(PathBuf::from(path));
            }
        }

        cfg
    }
}

/// Automatic incident handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Evaluate pings and open/resolve incidents automatically.
    pub auto_enabled: bool,
    /// Consecutive failures that open an incident.
    pub failure_threshold: u32,
    /// Consecutive successes before the `monitoring` report.
    pub monitoring_threshold: u32,
    /// Consecutive successes before auto-resolution.
    pub resolve_threshold: u32,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            auto_enabled: true,
            failure_threshold: 1,
            monitoring_threshold: 3,
            resolve_threshold: 5,
        }
    }
}

/// Default windows for derived statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub window_days: u32,
    pub history_days: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            window_days: 45,
            history_days: 45,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Webhook receiving a JSON message for every incident event.
    pub webhook_url: Option<String>,
}

/// Reloadable engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub incidents: IncidentConfig,
    pub analytics: AnalyticsConfig,
    pub notifications: NotificationConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let i = &self.incidents;
        if i.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be at least 1".to_string()));
        }
        if i.monitoring_threshold == 0 {
            return Err(ConfigError::Invalid("monitoring_threshold must be at least 1".to_string()));
        }
        if i.resolve_threshold <= i.monitoring_threshold {
            return Err(ConfigError::Invalid(format!(
                "resolve_threshold ({}) must be greater than monitoring_threshold ({})",
                i.resolve_threshold, i.monitoring_threshold
            )));
        }
        if self.analytics.window_days == 0 || self.analytics.history_days == 0 {
            return Err(ConfigError::Invalid("analytics windows must be at least one day".to_string()));
        }
        Ok(())
    }
}

/// Shared handle to the current engine configuration.
///
/// Readers take a snapshot; a reload swaps the whole value at once.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<EngineConfig>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(config)),
            path: None,
        }
    }

    /// Load from `path`, falling back to defaults when the file cannot be used.
    pub fn load(path: Option<PathBuf>) -> Self {
        let config = match &path {
            Some(p) => EngineConfig::from_file(p).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {}: {}. Using defaults.", p.display(), e);
                EngineConfig::default()
            }),
            None => EngineConfig::default(),
        };

        Self {
            current: Arc::new(RwLock::new(config)),
            path,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A copy of the current configuration.
    pub fn snapshot(&self) -> EngineConfig {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the configuration after validating it.
    pub fn replace(&self, config: EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        match self.current.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        Ok(())
    }

    /// Re-read the backing file. Returns whether the configuration changed.
    /// On error the previous configuration stays in place.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let fresh = EngineConfig::from_file(path)?;
        if fresh == self.snapshot() {
            return Ok(false);
        }
        self.replace(fresh)?;
        Ok(true)
    }
}

/// Background task that reloads the engine config when its file changes.
pub struct ConfigReloader {
    handle: ConfigHandle,
    interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl ConfigReloader {
    pub fn new(handle: ConfigHandle) -> Self {
        Self {
            handle,
            interval: Duration::from_secs(30),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start polling the config file's modification time.
    pub fn start(&self) {
        let Some(path) = self.handle.path().map(Path::to_path_buf) else {
            tracing::debug!("ConfigReloader: no config file, reload disabled");
            return;
        };
        let handle = self.handle.clone();
        let stop = self.stop.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(period);
            let mut last_modified = modified_time(&path);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let modified = modified_time(&path);
                        if modified == last_modified {
                            continue;
                        }
                        last_modified = modified;

                        match handle.reload() {
                            Ok(true) => tracing::info!("ConfigReloader: reloaded {}", path.display()),
                            Ok(false) => {}
                            Err(e) => tracing::warn!(
                                "ConfigReloader: keeping previous config, reload of {} failed: {}",
                                path.display(),
                                e
                            ),
                        }
                    }
                }
            }
        });
    }

    /// Stop the reloader.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "uptrail.db");

        let engine = EngineConfig::default();
        assert_eq!(engine.incidents.monitoring_threshold, 3);
        assert_eq!(engine.incidents.resolve_threshold, 5);
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [incidents]
            resolve_threshold = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.incidents.resolve_threshold, 8);
        assert_eq!(cfg.incidents.monitoring_threshold, 3);
        assert!(cfg.incidents.auto_enabled);
        assert_eq!(cfg.analytics.history_days, 45);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = EngineConfig::from_toml_str(
            r#"
            [incidents]
            monitoring_threshold = 5
            resolve_threshold = 5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_reload_keeps_previous_on_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[incidents]\nresolve_threshold = 6").unwrap();

        let handle = ConfigHandle::load(Some(file.path().to_path_buf()));
        assert_eq!(handle.snapshot().incidents.resolve_threshold, 6);
        assert!(!handle.reload().unwrap());

        std::fs::write(file.path(), "[incidents]\nresolve_threshold = 7\n").unwrap();
        assert!(handle.reload().unwrap());
        assert_eq!(handle.snapshot().incidents.resolve_threshold, 7);

        std::fs::write(file.path(), "[incidents]\nresolve_threshold = 1\n").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().incidents.resolve_threshold, 7);
    }
}
