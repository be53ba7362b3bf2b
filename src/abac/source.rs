//! Read contracts for policies and subject attributes, plus in-memory sources.

use crate::abac::errors::AbacError;
use crate::abac::types::{ActionEffect, Policy, PolicyScope, TableEntityId};
use crate::formula::{AttributeBag, Value};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Supplies raw policy definitions.
pub trait PolicySource: Send + Sync {
    fn universal_policies(&self) -> Result<Vec<Policy>, AbacError>;

    fn action_policies(&self, action_id: &str) -> Result<Vec<Policy>, AbacError>;

    fn entity_policies(
        &self,
        effect: ActionEffect,
        entity: &TableEntityId,
    ) -> Result<Vec<Policy>, AbacError>;
}

/// Supplies the attributes of the authenticated user.
pub trait AttributeSource {
    fn user_attributes(&self) -> Result<AttributeBag, AbacError>;
}

impl AttributeSource for AttributeBag {
    fn user_attributes(&self) -> Result<AttributeBag, AbacError> {
        Ok(self.clone())
    }
}

/// The requesting subject: user attributes plus request environment.
#[derive(Debug, Clone)]
pub struct Subject {
    user: AttributeBag,
    environment: AttributeBag,
}

impl Subject {
    /// Subject with the default environment (`today`, `now`).
    pub fn new(user: AttributeBag) -> Self {
        let now = Utc::now();
        let environment = AttributeBag::new()
            .with("today", now.date_naive())
            .with("now", now.to_rfc3339());
        Self { user, environment }
    }

    /// Resolve the user once for the request.
    pub fn resolve(source: &dyn AttributeSource) -> Result<Self, AbacError> {
        Ok(Self::new(source.user_attributes()?))
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.environment.insert(key, value);
        self
    }

    pub fn user(&self) -> &AttributeBag {
        &self.user
    }

    pub fn environment(&self) -> &AttributeBag {
        &self.environment
    }
}

#[derive(Debug, Default)]
struct PolicyTables {
    universal: Vec<Policy>,
    action: HashMap<String, Vec<Policy>>,
    entity: HashMap<(ActionEffect, TableEntityId), Vec<Policy>>,
}

/// Policies held in memory, replaceable at runtime.
///
/// Callers that replace policies must evict the evaluator's cache.
#[derive(Debug, Default)]
pub struct MemoryPolicySource {
    tables: RwLock<PolicyTables>,
}

impl MemoryPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distribute validated policies by their scope.
    pub fn from_policies(policies: impl IntoIterator<Item = Policy>) -> Self {
        let source = Self::new();
        source.replace_all(policies);
        source
    }

    pub fn replace_all(&self, policies: impl IntoIterator<Item = Policy>) {
        let mut tables = PolicyTables::default();
        for policy in policies {
            match policy.scope {
                PolicyScope::Universal => tables.universal.push(policy),
                PolicyScope::Action => {
                    for action in &policy.actions {
                        tables
                            .action
                            .entry(action.clone())
                            .or_default()
                            .push(policy.clone());
                    }
                }
                PolicyScope::Entity => {
                    if let (Some(effect), Some(target)) =
                        (policy.action_effect, policy.target_entity.clone())
                    {
                        tables.entity.entry((effect, target)).or_default().push(policy);
                    }
                }
            }
        }
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = tables;
    }

    pub fn set_universal_policies(&self, policies: Vec<Policy>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .universal = policies;
    }

    pub fn set_action_policies(&self, action_id: impl Into<String>, policies: Vec<Policy>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .action
            .insert(action_id.into(), policies);
    }

    pub fn set_entity_policies(&self, effect: ActionEffect, entity: TableEntityId, policies: Vec<Policy>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entity
            .insert((effect, entity), policies);
    }

    pub fn clear(&self) {
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = PolicyTables::default();
    }

    pub fn policy_count(&self) -> usize {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.universal.len()
            + tables.action.values().map(Vec::len).sum::<usize>()
            + tables.entity.values().map(Vec::len).sum::<usize>()
    }
}

impl PolicySource for MemoryPolicySource {
    fn universal_policies(&self) -> Result<Vec<Policy>, AbacError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.universal.clone())
    }

    fn action_policies(&self, action_id: &str) -> Result<Vec<Policy>, AbacError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.action.get(action_id).cloned().unwrap_or_default())
    }

    fn entity_policies(
        &self,
        effect: ActionEffect,
        entity: &TableEntityId,
    ) -> Result<Vec<Policy>, AbacError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .entity
            .get(&(effect, entity.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abac::types::{Effect, PolicyKind};
    use crate::formula::Formula;

    fn employee() -> TableEntityId {
        TableEntityId::new("abac-demo", "abac_demo", "employee")
    }

    #[test]
    fn test_from_policies_distributes_by_scope() {
        let source = MemoryPolicySource::from_policies([
            Policy::universal("u", Effect::Allow, PolicyKind::Action, Formula::bool(true)),
            Policy::action("a", ["svc.fetch", "svc.list"], Effect::Allow, PolicyKind::Data, Formula::bool(true)),
            Policy::entity("e", Effect::Allow, ActionEffect::Read, employee(), Formula::bool(true)),
        ]);
        assert_eq!(source.universal_policies().unwrap().len(), 1);
        assert_eq!(source.action_policies("svc.list").unwrap().len(), 1);
        assert!(source.action_policies("svc.other").unwrap().is_empty());
        assert_eq!(
            source.entity_policies(ActionEffect::Read, &employee()).unwrap().len(),
            1
        );
        assert!(source
            .entity_policies(ActionEffect::Write, &employee())
            .unwrap()
            .is_empty());
        assert_eq!(source.policy_count(), 4);
    }

    #[test]
    fn test_setters_replace_tables() {
        let source = MemoryPolicySource::new();
        source.set_universal_policies(vec![Policy::universal(
            "u",
            Effect::Deny,
            PolicyKind::Data,
            Formula::bool(true),
        )]);
        assert_eq!(source.universal_policies().unwrap().len(), 1);
        source.clear();
        assert!(source.universal_policies().unwrap().is_empty());
    }

    #[test]
    fn test_subject_environment() {
        let subject = Subject::resolve(&AttributeBag::new().with("id", "u1"))
            .unwrap()
            .with_environment("operation", "create");
        assert!(matches!(subject.environment().get("today"), Some(Value::Date(_))));
        assert_eq!(
            subject.environment().get("operation"),
            Some(&Value::from("create"))
        );
        assert_eq!(subject.user().get("id"), Some(&Value::from("u1")));
    }
}
