//! Token pool implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, trace};

use crate::error::{Result, TollgateError};

/// A capacity-bounded pool of interchangeable request tokens.
///
/// Tokens are semaphore permits that are forgotten on acquire, so they only
/// come back through [`TokenPool::refill`]. Acquires can only lower the count
/// and refills are serialized, which keeps the available count within
/// `0..=capacity` under any interleaving.
#[derive(Debug)]
pub struct TokenPool {
    /// Available tokens
    semaphore: Semaphore,
    /// Maximum number of tokens
    capacity: usize,
    /// Serializes refills against each other
    refill_lock: Mutex<()>,
    /// Number of refill events that restored at least one token
    refills: AtomicU64,
}

impl TokenPool {
    /// Create a full pool holding `capacity` tokens.
    pub fn new(capacity: u32) -> Result<Self> {
        let capacity = capacity as usize;
        if capacity == 0 {
            return Err(TollgateError::Config(
                "token pool capacity must be positive".to_string(),
            ));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(TollgateError::Config(format!(
                "token pool capacity {} exceeds the maximum of {}",
                capacity,
                Semaphore::MAX_PERMITS
            )));
        }

        Ok(Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            refill_lock: Mutex::new(()),
            refills: AtomicU64::new(0),
        })
    }

    /// Wait until a token is available and remove it.
    ///
    /// There is no upper bound on the wait. Returns [`TollgateError::Closed`]
    /// if the pool is closed before or while waiting.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TollgateError::Closed)?;
        permit.forget();
        trace!(available = self.available(), "Token acquired");
        Ok(())
    }

    /// Remove a token if one is available right now.
    pub fn try_acquire(&self) -> Result<bool> {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(true)
            }
            Err(TryAcquireError::NoPermits) => Ok(false),
            Err(TryAcquireError::Closed) => Err(TollgateError::Closed),
        }
    }

    /// Restore the pool to full capacity and return how many tokens were added.
    ///
    /// Tokens handed back here go straight to waiting acquirers, so a single
    /// refill can release up to `capacity` of them. Never blocks; a no-op on
    /// a full or closed pool.
    pub fn refill(&self) -> usize {
        let _guard = self.refill_lock.lock();

        if self.semaphore.is_closed() {
            return 0;
        }

        let available = self.semaphore.available_permits();
        if available >= self.capacity {
            return 0;
        }

        let restored = self.capacity - available;
        self.semaphore.add_permits(restored);
        self.refills.fetch_add(1, Ordering::Relaxed);

        debug!(restored = restored, capacity = self.capacity, "Token pool refilled");
        restored
    }

    /// Reject current and future acquirers with [`TollgateError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Number of tokens available right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of tokens taken and not yet replenished.
    pub fn held(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of refills that restored at least one token.
    pub fn refill_count(&self) -> u64 {
        self.refills.load(Ordering::Relaxed)
    }
}
