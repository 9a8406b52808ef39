//! Tollgate - Shared Admission Gate for Quota-Constrained Services
//!
//! This crate implements a process-wide rate limiter that keeps outbound
//! calls to a remote service within a fixed-window quota. Callers acquire a
//! token before each request and wait when the window's quota is spent; a
//! background timer resets the quota at the start of every window.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{Result, TollgateError};
pub use ratelimit::{gated, Admission, Limiter, LimiterCell, LimiterState};
