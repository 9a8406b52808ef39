//! Admission trait for putting a limiter in front of a remote service client.

use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;

/// Something a caller must pass before dispatching an outbound request.
///
/// Remote service clients depend on this trait instead of on [`Limiter`]
/// directly, so they can be exercised without a running timer.
///
/// [`Limiter`]: super::Limiter
#[async_trait]
pub trait Admission: Send + Sync {
    /// Wait until the caller may proceed.
    async fn admit(&self) -> Result<()>;
}

/// Run `call` once `admission` lets the caller through.
///
/// The call future is only built after admission succeeds, so a rejected
/// caller never starts its request.
pub async fn gated<A, F, Fut, T>(admission: &A, call: F) -> Result<T>
where
    A: Admission + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    admission.admit().await?;
    Ok(call().await)
}
