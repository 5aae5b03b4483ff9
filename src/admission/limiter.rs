//! Leaky bucket rate limiter.
//!
//! Each acquisition reserves the next free slot of the bucket: a request is
//! scheduled at `max(now, next_free_slot)` and pushes the slot forward by
//! `1 / qps`. Requests are therefore served strictly in submission order,
//! and a burst after an idle period starts immediately and is then paced.
//!
//! When a capacity is configured, the number of admitted but unreleased
//! requests is bounded and any acquisition beyond it is refused on the spot.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use super::clock::Clock;
use super::policy::RateLimitPolicy;

/// Returned by [`RateLimiter::acquire`] when the bucket is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("capacity of {capacity} outstanding messages exceeded")]
pub struct CapacityExceeded {
    /// The configured capacity
    pub capacity: u64,
}

/// Mutable bucket state, guarded by the limiter's lock.
#[derive(Debug, Default)]
struct Bucket {
    /// Earliest instant the next request may complete
    next_free_slot: Option<Instant>,
    /// Admitted but not yet released requests
    outstanding: u64,
}

impl Bucket {
    /// Reserve a slot and return its scheduled completion time.
    fn reserve(&mut self, now: Instant, interval: Duration) -> Instant {
        let scheduled = match self.next_free_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        self.next_free_slot = Some(scheduled + interval);
        self.outstanding += 1;
        scheduled
    }
}

/// Rate limiter for one bucket.
///
/// The limiter is shared through an `Arc` by every entity whose principal
/// resolves to it; permits keep it alive until they are released.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    interval: Option<Duration>,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("bucket", &*self.bucket.lock())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter for a policy.
    pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            interval: policy.interval(),
            bucket: Mutex::new(Bucket::default()),
            clock,
        }
    }

    /// Create a limiter that never throttles.
    pub fn unlimited(clock: Arc<dyn Clock>) -> Self {
        Self::new(RateLimitPolicy::UNLIMITED, clock)
    }

    /// Request permission to proceed.
    ///
    /// The decision is made synchronously: either a slot is reserved and the
    /// returned [`Acquired`] resolves to a [`Permit`] at the scheduled time,
    /// or the bucket is at capacity and nothing is reserved.
    pub fn acquire(self: &Arc<Self>) -> Result<Acquired, CapacityExceeded> {
        let interval = match self.interval {
            Some(interval) => interval,
            None => {
                return Ok(Acquired {
                    permit: Permit { limiter: None },
                    ready_at: None,
                    clock: Arc::clone(&self.clock),
                })
            }
        };

        let now = self.clock.now();
        let scheduled = {
            let mut bucket = self.bucket.lock();
            if let Some(capacity) = self.policy.capacity {
                if bucket.outstanding >= capacity {
                    return Err(CapacityExceeded { capacity });
                }
            }
            bucket.reserve(now, interval)
        };

        trace!(
            delay_ms = scheduled.saturating_duration_since(now).as_millis() as u64,
            "Reserved rate limiter slot"
        );

        Ok(Acquired {
            permit: Permit {
                limiter: Some(Arc::clone(self)),
            },
            ready_at: (scheduled > now).then_some(scheduled),
            clock: Arc::clone(&self.clock),
        })
    }

    fn release(&self) {
        let mut bucket = self.bucket.lock();
        debug_assert!(bucket.outstanding > 0, "released more permits than acquired");
        bucket.outstanding = bucket.outstanding.saturating_sub(1);
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Number of admitted but unreleased requests.
    pub fn outstanding(&self) -> u64 {
        self.bucket.lock().outstanding
    }

    /// The earliest instant the next request may complete, if any request
    /// has been scheduled yet.
    pub fn next_free_slot(&self) -> Option<Instant> {
        self.bucket.lock().next_free_slot
    }
}

/// A reserved slot that has not necessarily reached its scheduled time.
#[must_use = "dropping an Acquired releases its slot immediately"]
pub struct Acquired {
    permit: Permit,
    ready_at: Option<Instant>,
    clock: Arc<dyn Clock>,
}

impl Acquired {
    /// Whether the permit is available without waiting.
    pub fn is_ready(&self) -> bool {
        self.ready_at.is_none()
    }

    /// The scheduled completion time, if the request was delayed.
    pub fn ready_at(&self) -> Option<Instant> {
        self.ready_at
    }

    /// Wait until the scheduled time and take the permit.
    pub async fn wait(self) -> Permit {
        if let Some(deadline) = self.ready_at {
            self.clock.sleep_until(deadline).await;
        }
        self.permit
    }
}

impl fmt::Debug for Acquired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquired")
            .field("ready_at", &self.ready_at)
            .finish()
    }
}

/// Single-use capability to proceed.
///
/// Releasing consumes the permit, so a slot can only be given back once;
/// dropping the permit releases it as well.
#[derive(Debug)]
#[must_use = "dropping a Permit releases it immediately"]
pub struct Permit {
    limiter: Option<Arc<RateLimiter>>,
}

impl Permit {
    /// Give the slot back to the bucket.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
    }
}
