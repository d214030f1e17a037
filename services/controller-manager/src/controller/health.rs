//! Periodic health reporting for a controller instance.
//!
//! Each tick renews the instance's membership lease, writes its current
//! `workload_num` back to the registry (repairing a stale key pin or lock
//! flag on the way), and reaps peers whose lease has lapsed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::base::ControllerBase;
use crate::error::ControllerError;

/// One health tick. Returns whether the health report was written.
pub async fn report_once(base: &ControllerBase) -> Result<bool, ControllerError> {
    base.renew_membership().await?;
    let written = base.report_health().await?;
    base.reap_expired_peers().await?;
    Ok(written)
}

/// Run the health loop until shutdown.
pub async fn run_health_loop(
    base: Arc<ControllerBase>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        instance = %base.name(),
        interval_ms = interval.as_millis() as u64,
        "Starting health loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match report_once(&base).await {
                    Ok(written) => {
                        consecutive_failures = 0;
                        if written {
                            debug!(
                                instance = %base.name(),
                                workload_num = base.workload_num(),
                                "Health report written"
                            );
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Health report failed");
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Health report failed repeatedly"
                            );
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Health loop shutting down");
                    break;
                }
            }
        }
    }
}
