//! Entity lifecycle and the admission entry point.
//!
//! `AdmissionControl` is what the coordinator owns: it reacts to entity
//! registration, removal and failover by joining and leaving principal
//! groups, and routes each inbound message through the gate.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::{Clock, TokioClock};
use super::counter::MetricsSnapshot;
use super::gate::{Admission, Dispatcher, Gate};
use super::policy::PolicyTable;
use super::registry::LimiterRegistry;
use crate::error::{AdmissionError, Result};

/// Identity of a registered entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an entity id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random entity id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct EntityState {
    principal: Option<String>,
    active: bool,
}

/// Admission control for all registered entities.
///
/// Lifecycle events are serialized by `lifecycle`; submissions only touch
/// the entity table and never wait on it. Lock order is lifecycle, entity
/// table, registry.
pub struct AdmissionControl<M, D> {
    registry: LimiterRegistry,
    gate: Gate<M, D>,
    entities: DashMap<EntityId, EntityState>,
    lifecycle: Mutex<()>,
}

impl<M, D> AdmissionControl<M, D>
where
    M: Send + 'static,
    D: Dispatcher<M>,
{
    /// Create admission control using the Tokio clock.
    pub fn new(policies: PolicyTable, dispatcher: Arc<D>) -> Self {
        Self::with_clock(policies, Arc::new(TokioClock::new()), dispatcher)
    }

    /// Create admission control with a custom clock.
    pub fn with_clock(policies: PolicyTable, clock: Arc<dyn Clock>, dispatcher: Arc<D>) -> Self {
        Self {
            registry: LimiterRegistry::with_clock(policies, clock),
            gate: Gate::new(dispatcher),
            entities: DashMap::new(),
            lifecycle: Mutex::new(()),
        }
    }

    /// The principal group registry.
    pub fn registry(&self) -> &LimiterRegistry {
        &self.registry
    }

    /// The admission gate.
    pub fn gate(&self) -> &Gate<M, D> {
        &self.gate
    }

    /// Register a new entity under a principal.
    pub fn on_entity_registered(&self, entity: EntityId, principal: Option<String>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        match self.entities.entry(entity) {
            Entry::Occupied(entry) => Err(AdmissionError::DuplicateEntity(entry.key().clone())),
            Entry::Vacant(entry) => {
                self.registry.join(principal.as_deref());
                info!(
                    entity = %entry.key(),
                    principal = principal.as_deref().unwrap_or("<none>"),
                    "Entity registered"
                );
                entry.insert(EntityState {
                    principal,
                    active: true,
                });
                Ok(())
            }
        }
    }

    /// Remove an entity, leaving its principal group.
    ///
    /// Messages already admitted for the entity are still forwarded.
    pub fn on_entity_removed(&self, entity: &EntityId) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let (entity, state) = self
            .entities
            .remove(entity)
            .ok_or_else(|| AdmissionError::UnknownEntity(entity.clone()))?;

        let destroyed = self.registry.leave(state.principal.as_deref());
        info!(
            entity = %entity,
            principal = state.principal.as_deref().unwrap_or("<none>"),
            group_destroyed = destroyed,
            "Entity removed"
        );
        Ok(())
    }

    /// Replace `old` with `new` after a failover.
    ///
    /// The new instance is active. When the principal is unchanged the group
    /// membership is handed over as is, so counters and bucket state carry
    /// over and the group's member count never changes. When the principal
    /// changes, the new group is joined before the old one is left.
    ///
    /// Fails with `DuplicateEntity` if `new` is already registered, in which
    /// case `old` is left untouched.
    pub fn on_entity_failed_over(
        &self,
        old: &EntityId,
        new: EntityId,
        principal: Option<String>,
    ) -> Result<()> {
        // Held until `new` is inserted so no registration can claim it first
        let _lifecycle = self.lifecycle.lock();
        if *old == new {
            let mut state = self
                .entities
                .get_mut(old)
                .ok_or_else(|| AdmissionError::UnknownEntity(old.clone()))?;
            self.move_membership(state.principal.as_deref(), principal.as_deref());
            state.principal = principal;
            state.active = true;
            info!(entity = %old, "Entity failed over in place");
            return Ok(());
        }

        if self.entities.contains_key(&new) {
            return Err(AdmissionError::DuplicateEntity(new));
        }
        let (_, state) = self
            .entities
            .remove(old)
            .ok_or_else(|| AdmissionError::UnknownEntity(old.clone()))?;

        self.move_membership(state.principal.as_deref(), principal.as_deref());
        info!(
            old = %old,
            new = %new,
            principal = principal.as_deref().unwrap_or("<none>"),
            "Entity failed over"
        );
        self.entities.insert(
            new,
            EntityState {
                principal,
                active: true,
            },
        );
        Ok(())
    }

    fn move_membership(&self, from: Option<&str>, to: Option<&str>) {
        if from != to {
            self.registry.join(to);
            self.registry.leave(from);
            debug!(
                from = from.unwrap_or("<none>"),
                to = to.unwrap_or("<none>"),
                "Moved entity between principal groups"
            );
        }
    }

    /// Submit an inbound message from `entity`.
    ///
    /// The message is always counted as received. On overflow the entity is
    /// deactivated and notified through the dispatcher; messages from a
    /// deactivated entity are refused until it fails over.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, entity: &EntityId, message: M) -> Result<Admission> {
        let mut state = self
            .entities
            .get_mut(entity)
            .ok_or_else(|| AdmissionError::UnknownEntity(entity.clone()))?;
        let group = self
            .registry
            .group(state.principal.as_deref())
            .ok_or_else(|| AdmissionError::UnknownEntity(entity.clone()))?;

        if !state.active {
            group.counters().record_received();
            debug!(entity = %entity, "Dropping message from deactivated entity");
            return Err(AdmissionError::EntityDeactivated(entity.clone()));
        }

        match self.gate.admit(&group, entity, message) {
            Ok(admission) => Ok(admission),
            Err(rejection) => {
                state.active = false;
                warn!(entity = %entity, "Deactivating entity after capacity overflow");
                let err = AdmissionError::CapacityExceeded {
                    principal: rejection.principal.clone(),
                    capacity: rejection.capacity,
                };
                self.gate.notify_rejected(entity, rejection);
                Err(err)
            }
        }
    }

    /// Whether an entity is registered and active.
    pub fn is_active(&self, entity: &EntityId) -> Option<bool> {
        self.entities.get(entity).map(|state| state.active)
    }

    /// Number of registered entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Counters of every live principal.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }

    /// Forget every entity and group.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock();
        let entities = self.entities.len();
        self.entities.clear();
        let groups = self.registry.teardown();
        info!(entities = entities, groups = groups, "Admission control shut down");
    }
}
