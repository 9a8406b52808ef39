//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use super::gate::Admission;
use super::pool::TokenPool;
use super::replenisher::Replenisher;
use crate::config::LimiterConfig;
use crate::error::{Result, TollgateError};

/// Lifecycle state of a [`Limiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    /// Admitting callers and refilling on schedule
    Running,
    /// Shut down; terminal
    Stopped,
}

/// Admission gate that allows at most `capacity` calls per window.
///
/// The limiter is thread-safe and meant to be shared behind an [`Arc`] by
/// every caller of the quota-constrained service. Callers that find the pool
/// empty wait for the next window instead of failing.
#[derive(Debug)]
pub struct Limiter {
    /// Maximum calls per window
    capacity: u32,
    /// Window length, also the refill interval
    window: Duration,
    /// Available tokens
    pool: Arc<TokenPool>,
    /// Resets the pool every window
    replenisher: Replenisher,
    /// Current lifecycle state
    state: RwLock<LimiterState>,
}

impl Limiter {
    /// Create a running limiter with a full pool.
    ///
    /// The first `capacity` calls are admitted immediately; refills start one
    /// `window` later. Must be called from within a tokio runtime.
    pub fn new(capacity: u32, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(TollgateError::Config(
                "limiter window must be positive".to_string(),
            ));
        }

        let pool = Arc::new(TokenPool::new(capacity)?);
        let replenisher = Replenisher::start(pool.clone(), window)?;

        info!(capacity = capacity, window = ?window, "Rate limiter started");

        Ok(Self {
            capacity,
            window,
            pool,
            replenisher,
            state: RwLock::new(LimiterState::Running),
        })
    }

    /// Create a running limiter from configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.capacity, config.window())
    }

    /// Wait for a token. Call this before every outbound request.
    ///
    /// Waits as long as it takes for the next refill. Returns
    /// [`TollgateError::Closed`] once the limiter has been shut down,
    /// including for callers already waiting when shutdown happens.
    pub async fn acquire(&self) -> Result<()> {
        trace!(available = self.pool.available(), "Acquiring token");
        self.pool.acquire().await
    }

    /// Wait for a token for at most `timeout`.
    ///
    /// A timeout too large to represent as a deadline waits without bound.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.acquire_until(deadline).await,
            None => self.acquire().await,
        }
    }

    /// Wait for a token until `deadline`.
    ///
    /// Returns [`TollgateError::Timeout`] with the time spent waiting if the
    /// deadline passes first. A caller that times out consumes no token.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<()> {
        let started = Instant::now();
        match time::timeout_at(deadline, self.acquire()).await {
            Ok(result) => result,
            Err(_) => {
                let waited = started.elapsed();
                debug!(waited = ?waited, "Token acquire timed out");
                Err(TollgateError::Timeout(waited))
            }
        }
    }

    /// Wait for a token from a plain OS thread.
    ///
    /// Parks the current thread until a token is available or the limiter is
    /// closed. Must not be called from inside an async task, where it would
    /// stall the executor thread.
    pub fn blocking_acquire(&self) -> Result<()> {
        futures::executor::block_on(self.acquire())
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> Result<bool> {
        self.pool.try_acquire()
    }

    /// Stop the limiter.
    ///
    /// Closes the pool and signals the replenisher before the first await, so
    /// every pending and future acquire fails with [`TollgateError::Closed`]
    /// as soon as any `shutdown()` call has been polled once, even if that
    /// future is then dropped. A refill racing the close is a no-op on the
    /// closed pool. The returned future then waits for the timer task to exit.
    /// There is no restart; later calls only wait for the timer.
    pub async fn shutdown(&self) {
        let first = {
            let mut state = self.state.write();
            let first = *state == LimiterState::Running;
            *state = LimiterState::Stopped;
            first
        };

        if first {
            info!(
                capacity = self.capacity,
                held = self.pool.held(),
                refills = self.pool.refill_count(),
                "Shutting down rate limiter"
            );
        }

        self.replenisher.cancel();
        self.pool.close();
        self.replenisher.stop().await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LimiterState {
        *self.state.read()
    }

    /// Whether the limiter still admits callers.
    pub fn is_running(&self) -> bool {
        self.state() == LimiterState::Running
    }

    /// Maximum calls per window.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Tokens available right now.
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Number of refills that restored at least one token.
    pub fn refill_count(&self) -> u64 {
        self.pool.refill_count()
    }
}

#[async_trait]
impl Admission for Limiter {
    async fn admit(&self) -> Result<()> {
        self.acquire().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_limiter_creation() {
        let limiter = Limiter::new(10, Duration::from_secs(1)).unwrap();

        assert_eq!(limiter.capacity(), 10);
        assert_eq!(limiter.window(), Duration::from_secs(1));
        assert_eq!(limiter.available(), 10);
        assert_eq!(limiter.state(), LimiterState::Running);
        assert!(limiter.is_running());

        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_settings_rejected() {
        assert!(matches!(
            Limiter::new(0, Duration::from_secs(1)),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            Limiter::new(5, Duration::ZERO),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            Limiter::from_config(&LimiterConfig::new(0, Duration::from_secs(1))),
            Err(TollgateError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefilled_pool_admits_without_waiting() {
        let limiter = Limiter::new(5, Duration::from_secs(1)).unwrap();
        let start = Instant::now();

        for _ in 0..5 {
            assert_ok!(limiter.acquire().await);
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.available(), 0);
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_within_capacity_complete_immediately() {
        let limiter = Arc::new(Limiter::new(8, Duration::from_secs(1)).unwrap());
        let start = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await.unwrap();
                    start.elapsed()
                })
            })
            .collect();

        for elapsed in join_all(handles).await {
            assert_eq!(elapsed.unwrap(), Duration::ZERO);
        }
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_spread_across_windows() {
        let limiter = Arc::new(Limiter::new(10, Duration::from_secs(1)).unwrap());
        let start = Instant::now();

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.acquire().await.unwrap();
                    start.elapsed().as_secs()
                })
            })
            .collect();

        let mut per_window = [0usize; 3];
        for secs in join_all(handles).await {
            let secs = secs.unwrap() as usize;
            assert!(secs < per_window.len(), "admitted at {}s", secs);
            per_window[secs] += 1;
        }

        assert_eq!(per_window, [10, 10, 5]);
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_accumulates_past_capacity() {
        let limiter = Limiter::new(3, Duration::from_secs(1)).unwrap();
        limiter.acquire().await.unwrap();

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.available(), 3);

        for _ in 0..3 {
            assert!(limiter.try_acquire().unwrap());
        }
        assert!(!limiter.try_acquire().unwrap());
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_after_shutdown_is_closed() {
        let limiter = Limiter::new(5, Duration::from_secs(1)).unwrap();

        limiter.shutdown().await;

        assert_eq!(limiter.state(), LimiterState::Stopped);
        assert!(matches!(limiter.acquire().await, Err(TollgateError::Closed)));
        assert!(matches!(limiter.try_acquire(), Err(TollgateError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_pending_acquirers() {
        let limiter = Arc::new(Limiter::new(1, Duration::from_secs(60)).unwrap());
        limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        limiter.shutdown().await;

        assert!(matches!(waiter.await.unwrap(), Err(TollgateError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_stops_refills() {
        let limiter = Limiter::new(2, Duration::from_secs(1)).unwrap();
        limiter.acquire().await.unwrap();

        limiter.shutdown().await;
        limiter.shutdown().await;

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.refill_count(), 0);
        assert_eq!(limiter.state(), LimiterState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let limiter = Limiter::new(1, Duration::from_secs(10)).unwrap();
        limiter.acquire().await.unwrap();

        let err = assert_err!(limiter.acquire_timeout(Duration::from_millis(500)).await);
        assert!(matches!(err, TollgateError::Timeout(waited) if waited >= Duration::from_millis(500)));
        assert_eq!(limiter.available(), 0);

        // The refill lands before this deadline.
        assert_ok!(limiter.acquire_timeout(Duration::from_secs(20)).await);
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_deadline() {
        let limiter = Limiter::new(1, Duration::from_secs(2)).unwrap();
        limiter.acquire().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            limiter.acquire_until(deadline).await,
            Err(TollgateError::Timeout(_))
        ));
        assert_eq!(limiter.available(), 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        assert_ok!(limiter.acquire_until(deadline).await);
        limiter.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_acquire_from_thread() {
        let limiter = Arc::new(Limiter::new(2, Duration::from_millis(50)).unwrap());

        let worker = limiter.clone();
        let admitted = tokio::task::spawn_blocking(move || {
            (0..4).map(|_| worker.blocking_acquire()).collect::<Result<Vec<_>>>()
        })
        .await
        .unwrap();

        assert_eq!(admitted.unwrap().len(), 4);
        assert!(limiter.refill_count() >= 1);
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_as_admission() {
        let limiter = Limiter::new(1, Duration::from_secs(1)).unwrap();
        let admission: &dyn Admission = &limiter;

        assert_ok!(admission.admit().await);
        assert_eq!(limiter.available(), 0);
        limiter.shutdown().await;
        assert!(matches!(admission.admit().await, Err(TollgateError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_shutdown_still_closes() {
        let limiter = Limiter::new(1, Duration::from_secs(1)).unwrap();
        limiter.acquire().await.unwrap();

        let mut stopping = tokio_test::task::spawn(limiter.shutdown());
        let _ = stopping.poll();
        drop(stopping);

        assert_eq!(limiter.state(), LimiterState::Stopped);
        assert!(matches!(limiter.acquire().await, Err(TollgateError::Closed)));

        limiter.shutdown().await;
        assert!(matches!(
            limiter.acquire_timeout(Duration::from_secs(7200)).await,
            Err(TollgateError::Closed)
        ));
        assert_eq!(limiter.refill_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_shutdowns_both_close() {
        let limiter = Arc::new(Limiter::new(3, Duration::from_secs(1)).unwrap());

        let first = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.shutdown().await;
                limiter.try_acquire()
            })
        };
        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.shutdown().await;
                limiter.try_acquire()
            })
        };

        assert!(matches!(first.await.unwrap(), Err(TollgateError::Closed)));
        assert!(matches!(second.await.unwrap(), Err(TollgateError::Closed)));
        assert_eq!(limiter.state(), LimiterState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_with_unbounded_duration() {
        let limiter = Limiter::new(1, Duration::from_secs(1)).unwrap();

        assert_ok!(limiter.acquire_timeout(Duration::MAX).await);
        // The next token arrives with the first refill.
        assert_ok!(limiter.acquire_timeout(Duration::MAX).await);
        assert_eq!(limiter.refill_count(), 1);
        limiter.shutdown().await;
    }
}
