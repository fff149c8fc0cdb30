//! Scheduler module for running probes and recording their results.

use crate::db::{Monitor, Store};
use crate::error::EngineResult;
use crate::health::{HealthTracker, PingOutcome};
use crate::probe::{run_probe, ProbeConfig};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Attempts made to record one ping while the store is unavailable.
const RECORD_ATTEMPTS: u32 = 5;
const RECORD_BACKOFF: Duration = Duration::from_millis(200);

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    store: Arc<Store>,
    tracker: Arc<HealthTracker>,
    stop_chans: Arc<RwLock<HashMap<i64, tokio::sync::broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, tracker: Arc<HealthTracker>) -> Self {
        Self {
            store,
            tracker,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start probing every stored monitor.
    pub async fn start(&self) -> EngineResult<()> {
        let monitors = self.store.get_monitors()?;

        tracing::info!("Starting scheduler with {} monitors", monitors.len());

        for monitor in monitors {
            self.add_monitor(monitor).await;
        }

        Ok(())
    }

    /// Add a monitor to be probed.
    pub async fn add_monitor(&self, monitor: Monitor) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&monitor.id) {
            return; // Already running
        }

        let (stop_tx, _) = tokio::sync::broadcast::channel(1);
        stop_chans.insert(monitor.id, stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Scheduler: Adding monitor {}", monitor.name);

        let tracker = self.tracker.clone();
        let monitor_id = monitor.id;
        let stop_chans = self.stop_chans.clone();

        tokio::spawn(async move {
            run_probe_loop(monitor, tracker, stop_tx.subscribe()).await;

            let mut chans = stop_chans.write().await;
            chans.remove(&monitor_id);
        });
    }

    /// Stop probing a monitor.
    pub async fn remove_monitor(&self, id: i64) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(stop_tx) = stop_chans.remove(&id) {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: Removed monitor {}", id);
        }
    }

    /// Stop every probe loop.
    pub async fn stop(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
    }
}

/// Run the probe loop for a single monitor.
async fn run_probe_loop(
    monitor: Monitor,
    tracker: Arc<HealthTracker>,
    mut stop_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let interval_duration = Duration::from_secs(u64::from(monitor.interval_secs.max(1)));
    let config = ProbeConfig::for_monitor(&monitor);

    // One probe in flight per monitor, so pings are evaluated in the order
    // they were taken.
    let semaphore = Arc::new(tokio::sync::Semaphore::new(1));

    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping probe for {} due to overlap limit", monitor.name);
                        continue;
                    }
                };

                let config = config.clone();
                let tracker = tracker.clone();
                let monitor_id = monitor.id;
                let monitor_name = monitor.name.clone();

                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until done

                    let start_time = Utc::now();
                    let outcome = match run_probe(&config).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!("Probe failed for {}: {}", monitor_name, e);
                            return;
                        }
                    };

                    let ping = outcome.into_ping(monitor_id, start_time);
                    if let Err(e) = record_with_retry(&tracker, ping).await {
                        tracing::error!("Failed to record ping for {}: {}", monitor_name, e);
                    }
                });
            }
        }
    }
}

/// Record a ping, retrying with exponential backoff while the store reports
/// a transient failure.
pub async fn record_with_retry(
    tracker: &HealthTracker,
    ping: crate::db::NewPing,
) -> EngineResult<PingOutcome> {
    let monitor_id = ping.monitor_id;
    retry_transient(monitor_id, || tracker.record_ping(ping.clone())).await
}

/// Run `op` until it succeeds, fails permanently or runs out of attempts.
pub(crate) async fn retry_transient<T, F, Fut>(monitor_id: i64, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < RECORD_ATTEMPTS => {
                let delay = RECORD_BACKOFF * 2u32.pow(attempt);
                tracing::warn!(
                    monitor_id,
                    "Transient store error, retrying in {:?}: {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
