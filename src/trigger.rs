//! Drain triggers.
//!
//! Both sources end up in `DrainController::run`, whose single-flight guard
//! makes overlapping triggers harmless:
//! - periodic: a fixed-interval tick, started once the host is ready
//! - on demand: a socket `run` request or a submission with run-on-submit

use crate::controller::{DrainController, DrainOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Start a drain cycle in the background
pub fn trigger_now(controller: &Arc<DrainController>) -> JoinHandle<DrainOutcome> {
    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        let outcome = controller.run().await;
        debug!("Drain trigger finished: {:?}", outcome);
        outcome
    })
}

/// Trigger a drain cycle every `interval` until `shutdown` is cancelled
///
/// Waits for `ready` first; the first tick fires as soon as it arrives. If the
/// ready sender is dropped the periodic trigger never starts.
pub async fn run_periodic(
    controller: Arc<DrainController>,
    interval: Duration,
    ready: oneshot::Receiver<()>,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = shutdown.cancelled() => return,
        result = ready => {
            if result.is_err() {
                warn!("Host never became ready, periodic trigger not started");
                return;
            }
        }
    }

    info!("Periodic trigger started (every {:?})", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                debug!("Periodic drain tick");
                trigger_now(&controller);
            }
        }
    }

    info!("Periodic trigger stopped");
}
