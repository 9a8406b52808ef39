//! Once-only limiter construction for single-quota processes.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::limiter::Limiter;
use crate::config::LimiterConfig;
use crate::error::Result;

/// Holds at most one [`Limiter`] for the lifetime of the cell.
///
/// Meant to sit at the composition root (for example in a `static`) when a
/// process talks to a single quota. The first successful
/// [`get_or_init`](Self::get_or_init) decides the configuration; later calls
/// get the same limiter back and their configuration is ignored.
#[derive(Debug, Default)]
pub struct LimiterCell {
    inner: OnceLock<Arc<Limiter>>,
}

impl LimiterCell {
    /// Create an empty cell.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Return the limiter, building it from `config` if the cell is empty.
    ///
    /// Must be called from within a tokio runtime. A failed build leaves the
    /// cell empty.
    pub fn get_or_init(&self, config: &LimiterConfig) -> Result<Arc<Limiter>> {
        if let Some(existing) = self.inner.get() {
            Self::note_ignored(existing, config);
            return Ok(existing.clone());
        }

        let candidate = Arc::new(Limiter::from_config(config)?);

        // Losing a concurrent race drops the candidate, which aborts its timer.
        let winner = self.inner.get_or_init(|| candidate.clone());
        if !Arc::ptr_eq(winner, &candidate) {
            Self::note_ignored(winner, config);
        }
        Ok(winner.clone())
    }

    /// The limiter, if one has been built.
    pub fn get(&self) -> Option<Arc<Limiter>> {
        self.inner.get().cloned()
    }

    fn note_ignored(existing: &Limiter, requested: &LimiterConfig) {
        if existing.capacity() != requested.capacity || existing.window() != requested.window() {
            debug!(
                capacity = existing.capacity(),
                window = ?existing.window(),
                requested_capacity = requested.capacity,
                requested_window = ?requested.window(),
                "Limiter already initialized, ignoring new configuration"
            );
        }
    }
}
