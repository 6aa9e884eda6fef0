pub mod cmdline;
pub mod processes;
pub mod supervisor;

use crate::metrics::Metrics;
use crate::state::{GpuProcessEntry, SharedState};
use processes::ProcessAttributor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub async fn refresh_processes(
    attributor: &ProcessAttributor,
    state: &SharedState,
    metrics: &Metrics,
) -> Arc<Vec<GpuProcessEntry>> {
    let (strategy, list) = attributor.scan().await;
    debug!(strategy = strategy.unwrap_or("none"), count = list.len(), "gpu process scan");
    metrics.record_process_scan(strategy.unwrap_or("none"), list.len());
    state.replace_processes(list);
    state.processes()
}

pub async fn run_process_scans(
    attributor: Arc<ProcessAttributor>,
    state: Arc<SharedState>,
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stopping gpu process scans");
                break;
            }
            _ = ticker.tick() => {
                if state.is_available() {
                    refresh_processes(&attributor, &state, &metrics).await;
                }
            }
        }
    }
}
