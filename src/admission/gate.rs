//! Per-message admission.
//!
//! The gate counts every inbound message, reserves a slot in the group's
//! limiter and hands the message to the group's dispatch lane. The lane is a
//! single task per group that waits for each permit in admission order,
//! forwards the message and only then counts it as processed and releases
//! the permit. Submitting never blocks on the rate limit.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use super::control::EntityId;
use super::limiter::CapacityExceeded;
use super::registry::Group;

/// Receives admitted messages and rejection notices.
#[async_trait]
pub trait Dispatcher<M: Send + 'static>: Send + Sync + 'static {
    /// Handle a message whose permit has completed.
    async fn forward(&self, entity: &EntityId, message: M);

    /// Tell an entity that its message overflowed the capacity.
    async fn reject(&self, entity: &EntityId, rejection: Rejection);
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The message is forwarded without waiting.
    Immediate,
    /// The message is queued until the given instant.
    Delayed { ready_at: Instant },
}

/// Why a message was refused by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Principal of the overflowing group
    pub principal: Option<String>,
    /// The capacity that was reached
    pub capacity: u64,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message capacity of {} exceeded for principal {}",
            self.capacity,
            self.principal.as_deref().unwrap_or("<none>")
        )
    }
}

pub(crate) type Job = BoxFuture<'static, ()>;

/// FIFO dispatch queue of one group.
///
/// The worker task is started lazily and restarted if it ever went away.
#[derive(Default)]
pub(crate) struct Lane {
    tx: Option<mpsc::UnboundedSender<Job>>,
}

impl Lane {
    fn push(&mut self, job: Job) {
        let job = match &self.tx {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => {
                    warn!("Dispatch lane stopped, restarting");
                    job
                }
            },
            None => job,
        };

        let tx = spawn_lane();
        if tx.send(job).is_err() {
            error!("Failed to queue message on a fresh dispatch lane");
        }
        self.tx = Some(tx);
    }
}

fn spawn_lane() -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            // A panicking dispatcher loses its own message, not the queue
            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                error!("Dispatcher panicked while forwarding a message");
            }
        }
    });
    tx
}

/// Admission gate in front of a dispatcher.
pub struct Gate<M, D> {
    dispatcher: Arc<D>,
    _message: PhantomData<fn(M)>,
}

impl<M, D> Gate<M, D>
where
    M: Send + 'static,
    D: Dispatcher<M>,
{
    /// Create a gate forwarding to `dispatcher`.
    pub fn new(dispatcher: Arc<D>) -> Self {
        Self {
            dispatcher,
            _message: PhantomData,
        }
    }

    /// The dispatcher admitted messages are forwarded to.
    pub fn dispatcher(&self) -> &Arc<D> {
        &self.dispatcher
    }

    /// Admit one message from `entity` through its group.
    ///
    /// The message is counted as received in every case. On success it is
    /// queued for forwarding and the call returns without waiting. When the
    /// limiter is at capacity nothing is queued and the rejection is
    /// returned; the caller decides what happens to the entity.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn admit(&self, group: &Group, entity: &EntityId, message: M) -> Result<Admission, Rejection> {
        let mut lane = group.lane().lock();
        group.counters().record_received();

        let acquired = match group.limiter().acquire() {
            Ok(acquired) => acquired,
            Err(CapacityExceeded { capacity }) => {
                warn!(
                    entity = %entity,
                    principal = group.principal().unwrap_or("<none>"),
                    capacity = capacity,
                    "Message capacity exceeded"
                );
                return Err(Rejection {
                    principal: group.principal().map(str::to_owned),
                    capacity,
                });
            }
        };

        let admission = match acquired.ready_at() {
            None => Admission::Immediate,
            Some(ready_at) => Admission::Delayed { ready_at },
        };
        trace!(entity = %entity, admission = ?admission, "Message admitted");

        let dispatcher = Arc::clone(&self.dispatcher);
        let counters = Arc::clone(group.counters());
        let entity = entity.clone();
        lane.push(
            async move {
                let permit = acquired.wait().await;
                dispatcher.forward(&entity, message).await;
                counters.record_processed();
                permit.release();
            }
            .boxed(),
        );

        Ok(admission)
    }

    /// Notify the dispatcher of a rejection without blocking the caller.
    pub fn notify_rejected(&self, entity: &EntityId, rejection: Rejection) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let entity = entity.clone();
        tokio::spawn(async move {
            dispatcher.reject(&entity, rejection).await;
        });
    }
}
