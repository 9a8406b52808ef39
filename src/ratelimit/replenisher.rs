//! Periodic pool replenishment.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::pool::TokenPool;
use crate::error::{Result, TollgateError};

/// A background timer that resets a [`TokenPool`] to full capacity once per
/// interval.
///
/// The first fire happens one interval after start, since the pool starts
/// full. Ticks missed while the runtime was stalled are skipped rather than
/// replayed; the next fire still resets the pool to capacity.
#[derive(Debug)]
pub struct Replenisher {
    /// Time between refills
    interval: Duration,
    /// Signals the background task to exit
    shutdown_tx: watch::Sender<bool>,
    /// Handle to the background task, taken on stop
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Replenisher {
    /// Spawn the refill task on the current tokio runtime.
    ///
    /// Returns a configuration error for a zero interval or one too large to
    /// schedule.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(pool: Arc<TokenPool>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(TollgateError::Config(
                "replenish interval must be positive".to_string(),
            ));
        }

        let first_fire = Instant::now().checked_add(interval).ok_or_else(|| {
            TollgateError::Config(format!("replenish interval {:?} is too large", interval))
        })?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(interval = ?interval, capacity = pool.capacity(), "Starting replenisher");

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(first_fire, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        pool.refill();
                    }
                }
            }

            debug!("Replenisher task exited");
        });

        Ok(Self {
            interval,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the timer task to exit without waiting for it.
    ///
    /// At most one refill already in progress can still land.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop refilling and wait for the timer task to exit.
    ///
    /// Once this returns no further refill will happen. Calling it again is a
    /// no-op. The stop signal is sent before the first await, so dropping this
    /// future part-way still ends the task.
    pub async fn stop(&self) {
        self.cancel();

        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        if let Err(e) = handle.await {
            warn!(error = %e, "Replenisher task ended abnormally");
        }

        info!("Replenisher stopped");
    }

    /// Whether the timer task is still scheduled.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Time between refills.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for Replenisher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
