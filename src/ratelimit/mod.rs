//! Rate limiting logic and state management.

mod gate;
mod limiter;
mod pool;
mod replenisher;
mod shared;

pub use gate::{gated, Admission};
pub use limiter::{Limiter, LimiterState};
pub use pool::TokenPool;
pub use replenisher::Replenisher;
pub use shared::LimiterCell;
