//! Background maintenance for a running node: housekeeping sweeps on one
//! interval, reconciliation attempts on another, both stopped by the
//! shutdown channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use toss_protocol::{OfflineDevice, TossError};

use crate::metrics::SharedMetrics;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub async fn maintenance_loop(
    device: Arc<OfflineDevice>,
    metrics: SharedMetrics,
    sweep_every: Duration,
    reconcile_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let housekeeper = device.housekeeper();
    let mut sweep_tick = tokio::time::interval(sweep_every.max(MIN_INTERVAL));
    let mut reconcile_tick = tokio::time::interval(reconcile_every.max(MIN_INTERVAL));
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        sweep_secs = sweep_every.as_secs(),
        reconcile_secs = reconcile_every.as_secs(),
        "maintenance loop starting"
    );

    loop {
        tokio::select! {
            _ = sweep_tick.tick() => {
                match housekeeper.sweep() {
                    Ok(report) => {
                        metrics.housekeeping_sweeps_total.inc();
                        if !report.is_empty() {
                            debug!(?report, "housekeeping sweep");
                        }
                    }
                    Err(e) => warn!(error = %e, "housekeeping sweep failed"),
                }
                metrics.active_peers.set(device.peers().active_peers().len() as i64);
            }
            _ = reconcile_tick.tick() => {
                match device.reconcile().await {
                    Ok(report) => {
                        metrics.record_reconciliation(&report);
                        if !report.results.is_empty() {
                            info!(
                                checkpoint = report.checkpoint,
                                results = report.results.len(),
                                conflicts = report.conflicts.len(),
                                "reconciliation pass finished"
                            );
                        }
                    }
                    Err(TossError::Ledger(e)) => {
                        debug!(error = %e, "ledger unreachable, reconciliation deferred")
                    }
                    Err(TossError::ReconciliationInProgress(_)) => {}
                    Err(e) => warn!(error = %e, "reconciliation failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("maintenance loop stopped");
}
