//! The heartbeat loop task
//!
//! Single long-lived task: tick, occasionally clean up, sleep. A tick
//! that panics is caught and logged so one bad pass cannot take the
//! supervisor down; cancellation interrupts the sleep for prompt
//! shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::Supervisor;

pub(super) async fn run_loop(supervisor: Arc<Supervisor>, cancel: CancellationToken) {
    let interval = Duration::from_millis(supervisor.config.heartbeat.interval_ms.max(1));
    let cleanup_every =
        Duration::from_millis(supervisor.config.heartbeat.cleanup_interval_ms.max(1));

    // Stagger startup so restarted supervisors do not ping in lockstep.
    let jitter_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_cleanup = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Heartbeat loop cancelled");
                break;
            }
            _ = ticker.tick() => {
                if AssertUnwindSafe(supervisor.tick())
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("Heartbeat tick panicked");
                }

                if last_cleanup.elapsed() >= cleanup_every {
                    last_cleanup = Instant::now();
                    let supervisor = &supervisor;
                    if std::panic::catch_unwind(AssertUnwindSafe(|| supervisor.cleanup()))
                        .is_err()
                    {
                        error!("Cleanup pass panicked");
                    }
                }
            }
        }
    }
}
