//! Policy sets resolved per `(action, entity, effect)` and memoized until evicted.

use crate::abac::errors::AbacError;
use crate::abac::source::PolicySource;
use crate::abac::types::{ActionEffect, Effect, Policy, PolicyKind, PolicyScope, TableEntityId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub action_id: String,
    pub entity: TableEntityId,
    pub effect: ActionEffect,
}

impl PolicyKey {
    pub fn new(action_id: impl Into<String>, entity: TableEntityId, effect: ActionEffect) -> Self {
        Self {
            action_id: action_id.into(),
            entity,
            effect,
        }
    }
}

/// universal ∪ action(action_id) ∪ entity(effect, entity)
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    pub universal: Vec<Policy>,
    pub action: Vec<Policy>,
    pub entity: Vec<Policy>,
}

impl PolicySet {
    /// Fetch the three parts from `source`, dropping policies that break
    /// their scope's invariants.
    pub fn resolve(source: &dyn PolicySource, key: &PolicyKey) -> Result<Self, AbacError> {
        let universal = keep_valid(source.universal_policies()?, |p| {
            p.scope == PolicyScope::Universal
        });
        let action = keep_valid(source.action_policies(&key.action_id)?, |p| {
            p.scope == PolicyScope::Action
        });
        let entity = keep_valid(source.entity_policies(key.effect, &key.entity)?, |p| {
            p.scope == PolicyScope::Entity
                && p.action_effect == Some(key.effect)
                && p.target_entity.as_ref() == Some(&key.entity)
        });
        tracing::debug!(
            action = %key.action_id,
            entity = %key.entity,
            effect = %key.effect,
            universal = universal.len(),
            action_scoped = action.len(),
            entity_scoped = entity.len(),
            "Resolved policy set"
        );
        Ok(Self {
            universal,
            action,
            entity,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.universal
            .iter()
            .chain(self.action.iter())
            .chain(self.entity.iter())
    }

    /// Universal and action-scoped policies that gate the action itself.
    pub fn gate_policies(&self) -> impl Iterator<Item = &Policy> {
        self.universal
            .iter()
            .chain(self.action.iter())
            .filter(|p| p.kind == PolicyKind::Action)
    }

    /// Policies that contribute a row condition for `effect`.
    pub fn data_policies(&self, effect: ActionEffect) -> impl Iterator<Item = &Policy> {
        self.iter().filter(move |p| p.governs_rows(effect))
    }

    /// Whether an allow entity policy exists, which also grants the action.
    pub fn has_entity_allow(&self) -> bool {
        self.entity.iter().any(|p| p.effect == Effect::Allow)
    }

    pub fn len(&self) -> usize {
        self.universal.len() + self.action.len() + self.entity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn keep_valid(policies: Vec<Policy>, belongs: impl Fn(&Policy) -> bool) -> Vec<Policy> {
    policies
        .into_iter()
        .filter(|p| match p.validate() {
            Ok(()) if belongs(p) => true,
            Ok(()) => {
                tracing::warn!(policy = %p.id, "skipping policy returned for the wrong scope");
                false
            }
            Err(e) => {
                tracing::warn!(policy = %p.id, error = %e, "skipping invalid policy");
                false
            }
        })
        .collect()
}

/// Memoized policy sets. Reads are concurrent; eviction takes the write lock.
///
/// Every eviction bumps `generation`. A set loaded across an eviction is
/// returned to its caller but never stored.
#[derive(Debug)]
pub struct PolicyCache {
    enabled: bool,
    generation: AtomicU64,
    entries: RwLock<HashMap<PolicyKey, Arc<PolicySet>>>,
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyCache {
    pub fn new() -> Self {
        Self {
            enabled: true,
            generation: AtomicU64::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A cache that always resolves afresh.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn get_or_load<F>(&self, key: &PolicyKey, load: F) -> Result<Arc<PolicySet>, AbacError>
    where
        F: FnOnce() -> Result<PolicySet, AbacError>,
    {
        if !self.enabled {
            return load().map(Arc::new);
        }
        if let Some(set) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Ok(Arc::clone(set));
        }
        let generation = self.generation.load(Ordering::Acquire);
        // concurrent misses may both load; the first insert wins
        let set = Arc::new(load()?);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            tracing::debug!(action = %key.action_id, entity = %key.entity, "Policy set loaded across an eviction, not cached");
            return Ok(set);
        }
        Ok(Arc::clone(entries.entry(key.clone()).or_insert(set)))
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &PolicyKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.remove(key).is_some()
    }

    /// Drop every entry touching `entity`.
    pub fn invalidate_entity(&self, entity: &TableEntityId) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.retain(|key, _| &key.entity != entity);
    }

    /// Drop everything.
    pub fn evict(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let evicted = entries.len();
        entries.clear();
        tracing::debug!(evicted, "Evicted policy cache");
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
