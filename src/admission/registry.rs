//! Registry of principal groups.
//!
//! A group bundles the limiter, the message counters and the dispatch lane
//! shared by every entity that declares the same principal. Groups are
//! created on the first join and destroyed when the last member leaves.
//! Principals without an explicit policy all share one aggregate default
//! limiter, which is counted separately by the number of entities using it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::clock::{Clock, TokioClock};
use super::counter::{MessageCounters, MetricsSnapshot};
use super::gate::Lane;
use super::limiter::RateLimiter;
use super::policy::{PolicyTable, RateLimitPolicy, Resolution};

/// Shared state of every entity declaring one principal.
pub struct Group {
    principal: Option<String>,
    limiter: Arc<RateLimiter>,
    counters: Arc<MessageCounters>,
    lane: Mutex<Lane>,
}

impl Group {
    fn new(principal: Option<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            principal,
            limiter,
            counters: Arc::new(MessageCounters::new()),
            lane: Mutex::new(Lane::default()),
        }
    }

    /// The principal of this group (`None` for entities without one).
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// The limiter used by this group.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The group's message counters.
    pub fn counters(&self) -> &Arc<MessageCounters> {
        &self.counters
    }

    /// Admission for the group is serialized through this lock.
    pub(crate) fn lane(&self) -> &Mutex<Lane> {
        &self.lane
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("principal", &self.principal)
            .field("limiter", &self.limiter)
            .field("counters", &self.counters)
            .finish()
    }
}

struct Membership {
    group: Arc<Group>,
    members: usize,
    shares_default: bool,
}

struct SharedDefault {
    limiter: Arc<RateLimiter>,
    members: usize,
}

#[derive(Default)]
struct Groups {
    by_principal: HashMap<Option<String>, Membership>,
    aggregate_default: Option<SharedDefault>,
}

/// Maps principals to their shared group.
///
/// Lookups and snapshots take a read lock; only joins and leaves take the
/// write lock, so throttling of one principal never waits on another.
pub struct LimiterRegistry {
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    groups: RwLock<Groups>,
}

impl LimiterRegistry {
    /// Create a registry using the Tokio clock.
    pub fn new(policies: PolicyTable) -> Self {
        Self::with_clock(policies, Arc::new(TokioClock::new()))
    }

    /// Create a registry with a custom clock.
    pub fn with_clock(policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            clock,
            groups: RwLock::new(Groups::default()),
        }
    }

    /// The policy table the registry resolves against.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Add one member to the principal's group, creating it on first join.
    pub fn join(&self, principal: Option<&str>) -> Arc<Group> {
        let resolution = self.policies.resolve(principal);
        let mut groups = self.groups.write();

        if let Some(membership) = groups.by_principal.get_mut(&principal.map(str::to_owned)) {
            membership.members += 1;
            let group = Arc::clone(&membership.group);
            if membership.shares_default {
                if let Some(shared) = groups.aggregate_default.as_mut() {
                    shared.members += 1;
                }
            }
            return group;
        }

        let (limiter, shares_default) = match resolution {
            Resolution::Explicit(policy) => {
                (Arc::new(RateLimiter::new(policy, Arc::clone(&self.clock))), false)
            }
            Resolution::AggregateDefault(policy) => {
                (Self::join_default(&mut groups, policy, &self.clock), true)
            }
            Resolution::Unlimited => (Arc::new(RateLimiter::unlimited(Arc::clone(&self.clock))), false),
        };

        debug!(
            principal = principal.unwrap_or("<none>"),
            policy = ?limiter.policy(),
            shares_default = shares_default,
            "Creating principal group"
        );

        let group = Arc::new(Group::new(principal.map(str::to_owned), limiter));
        groups.by_principal.insert(
            principal.map(str::to_owned),
            Membership {
                group: Arc::clone(&group),
                members: 1,
                shares_default,
            },
        );
        group
    }

    fn join_default(
        groups: &mut Groups,
        policy: RateLimitPolicy,
        clock: &Arc<dyn Clock>,
    ) -> Arc<RateLimiter> {
        let shared = groups.aggregate_default.get_or_insert_with(|| {
            debug!(policy = ?policy, "Creating aggregate default limiter");
            SharedDefault {
                limiter: Arc::new(RateLimiter::new(policy, Arc::clone(clock))),
                members: 0,
            }
        });
        shared.members += 1;
        Arc::clone(&shared.limiter)
    }

    /// Remove one member from the principal's group.
    ///
    /// Returns `true` if this was the last member and the group, together
    /// with its counters, was destroyed. Permits still in flight keep the old
    /// limiter alive until released; a later join creates a fresh group.
    ///
    /// # Panics
    ///
    /// Panics if the principal has no live group, i.e. `leave` was called more
    /// often than `join`.
    pub fn leave(&self, principal: Option<&str>) -> bool {
        let key = principal.map(str::to_owned);
        let mut groups = self.groups.write();

        let membership = groups.by_principal.get_mut(&key).unwrap_or_else(|| {
            panic!(
                "principal group {:?} left more times than joined",
                principal
            )
        });
        membership.members -= 1;
        let shares_default = membership.shares_default;
        let destroyed = membership.members == 0;

        if destroyed {
            groups.by_principal.remove(&key);
            debug!(
                principal = principal.unwrap_or("<none>"),
                "Destroying principal group"
            );
        }

        if shares_default {
            let shared = groups
                .aggregate_default
                .as_mut()
                .expect("aggregate default limiter missing while a member uses it");
            shared.members -= 1;
            if shared.members == 0 {
                groups.aggregate_default = None;
                debug!("Destroying aggregate default limiter");
            }
        }

        destroyed
    }

    /// Look up the live group of a principal.
    pub fn group(&self, principal: Option<&str>) -> Option<Arc<Group>> {
        let groups = self.groups.read();
        groups
            .by_principal
            .get(&principal.map(str::to_owned))
            .map(|m| Arc::clone(&m.group))
    }

    /// Look up the limiter a live principal group uses.
    pub fn resolve(&self, principal: Option<&str>) -> Option<Arc<RateLimiter>> {
        self.group(principal).map(|g| Arc::clone(g.limiter()))
    }

    /// Number of members of a principal's group (zero if it is not live).
    pub fn members(&self, principal: Option<&str>) -> usize {
        let groups = self.groups.read();
        groups
            .by_principal
            .get(&principal.map(str::to_owned))
            .map_or(0, |m| m.members)
    }

    /// Number of entities currently sharing the aggregate default limiter.
    pub fn aggregate_default_members(&self) -> usize {
        let groups = self.groups.read();
        groups.aggregate_default.as_ref().map_or(0, |d| d.members)
    }

    /// Number of live groups.
    pub fn len(&self) -> usize {
        self.groups.read().by_principal.len()
    }

    /// Whether no group is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters of every live principal, read under one lock so groups
    /// cannot appear or disappear mid-snapshot.
    ///
    /// Entities registered without a principal have no metric keys.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let groups = self.groups.read();
        let mut snapshot = MetricsSnapshot::new();
        for membership in groups.by_principal.values() {
            if let Some(principal) = membership.group.principal() {
                snapshot.insert(principal, membership.group.counters().snapshot());
            }
        }
        snapshot
    }

    /// Drop every group. Returns the number of groups destroyed.
    pub fn teardown(&self) -> usize {
        let mut groups = self.groups.write();
        let count = groups.by_principal.len();
        groups.by_principal.clear();
        groups.aggregate_default = None;
        debug!(groups = count, "Registry torn down");
        count
    }
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("policies", &self.policies)
            .field("groups", &self.len())
            .finish()
    }
}
