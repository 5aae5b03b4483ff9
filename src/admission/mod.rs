//! Admission control: rate limiting, counters and entity lifecycle.

mod clock;
mod control;
mod counter;
mod gate;
mod limiter;
mod policy;
mod registry;

pub use clock::{Clock, TokioClock};
pub use control::{AdmissionControl, EntityId};
pub use counter::{
    messages_processed_key, messages_received_key, CounterSnapshot, MessageCounters,
    MetricsSnapshot,
};
pub use gate::{Admission, Dispatcher, Gate, Rejection};
pub use limiter::{Acquired, CapacityExceeded, Permit, RateLimiter};
pub use policy::{PolicyTable, RateLimitEntry, RateLimitPolicy, RateLimits, Resolution, MAX_INTERVAL};
pub use registry::{Group, LimiterRegistry};
