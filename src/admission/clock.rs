//! Clock and timer abstraction used by the rate limiters.
//!
//! The limiter only needs to read the current time and to wait until a
//! scheduled instant. Production code uses the Tokio timer; tests run the
//! Tokio runtime with paused time, which turns the same clock into a virtual
//! one that advances only when every task is idle.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

/// Source of time and delayed wakeups.
pub trait Clock: Send + Sync {
    /// Get the current instant.
    fn now(&self) -> Instant;

    /// Return a future that completes at `deadline`.
    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;
}

/// Clock backed by the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl TokioClock {
    /// Create a new Tokio clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        tokio::time::sleep_until(deadline).boxed()
    }
}
