//! Periodic clearing: one `run_cycle` per tick.

use std::sync::Arc;
use std::time::Duration;
use syntropism_core::Economy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub struct ClearingTicker {
    economy: Arc<Economy>,
    period: Duration,
}

/// Stops the ticker when asked or when dropped.
pub struct TickerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TickerHandle {
    /// Ask the loop to stop after the cycle in flight, then wait for it.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            error!(error = %err, "Clearing ticker panicked");
        }
    }
}

impl ClearingTicker {
    pub fn new(economy: Arc<Economy>, period: Duration) -> Self {
        Self { economy, period }
    }

    pub fn spawn(self) -> TickerHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticks = interval(self.period);
            // A slow cycle delays the next one instead of bunching them up.
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = self.period.as_millis() as u64, "Clearing ticker started");

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        match self.economy.run_cycle().await {
                            Ok(report) => debug!(
                                cycle = report.cycle,
                                winners = report.winners.len(),
                                "Tick cleared"
                            ),
                            // Already logged and published by the engine; the
                            // next tick retries from the last committed state.
                            Err(err) if err.is_user_error() => debug!(error = %err, "Tick skipped"),
                            Err(_) => {}
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Clearing ticker stopped");
        });
        TickerHandle { stop, task }
    }
}
