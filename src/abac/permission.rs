//! The enforcement boundary: action gate, row grants and write checks.

use crate::abac::cache::{PolicyCache, PolicyKey, PolicySet};
use crate::abac::compiler::{compile, CompiledCondition};
use crate::abac::entity::FilterableEntity;
use crate::abac::errors::AbacError;
use crate::abac::source::{PolicySource, Subject};
use crate::abac::types::{ActionEffect, Effect, Policy, TableEntityId};
use crate::abac::visibility::{self, VisibleFieldsMode};
use crate::formula::{test, AttributeBag, EvalContext, FieldDef, Formula, FormulaError, Value};
use std::sync::Arc;

/// One request for an action touching one entity.
#[derive(Debug, Clone)]
pub struct AccessRequest<'a> {
    pub action_id: &'a str,
    pub entity: TableEntityId,
    pub subject: &'a Subject,
    pub fields: Option<&'static [FieldDef]>,
    pub filter: Option<&'a Formula>,
}

impl<'a> AccessRequest<'a> {
    pub fn new(action_id: &'a str, entity: TableEntityId, subject: &'a Subject) -> Self {
        Self {
            action_id,
            entity,
            subject,
            fields: None,
            filter: None,
        }
    }

    /// Request against a typed entity, with its field schema attached.
    pub fn for_entity<E: FilterableEntity>(action_id: &'a str, subject: &'a Subject) -> Self {
        Self {
            fields: Some(E::fields()),
            ..Self::new(action_id, E::table_entity(), subject)
        }
    }

    pub fn with_filter(mut self, filter: Option<&'a Formula>) -> Self {
        self.filter = filter;
        self
    }

    fn key(&self, effect: ActionEffect) -> PolicyKey {
        PolicyKey::new(self.action_id, self.entity.clone(), effect)
    }
}

/// A proposed mutation of one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Create { after: AttributeBag },
    Update { before: AttributeBag, after: AttributeBag },
    Delete { before: AttributeBag },
}

impl RowWrite {
    /// Value bound to `env.operation` while the write is checked.
    pub fn operation(&self) -> &'static str {
        match self {
            RowWrite::Create { .. } => "create",
            RowWrite::Update { .. } => "update",
            RowWrite::Delete { .. } => "delete",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            RowWrite::Create { .. } => "Creation",
            RowWrite::Update { .. } => "Update",
            RowWrite::Delete { .. } => "Deletion",
        }
    }

    pub fn record_id(&self) -> String {
        let row = match self {
            RowWrite::Create { after } => after,
            RowWrite::Update { before, .. } | RowWrite::Delete { before } => before,
        };
        match row.get("id") {
            Some(Value::Str(id)) => id.clone(),
            Some(value) if !value.is_null() => value.to_string(),
            _ => "<new>".to_string(),
        }
    }
}

/// What an authorized caller may touch: a compiled row condition plus the
/// policies needed to mask fields.
#[derive(Debug, Clone)]
pub struct Grant {
    action_id: String,
    entity: TableEntityId,
    effect: ActionEffect,
    policies: Arc<PolicySet>,
    condition: CompiledCondition,
    visible_fields: VisibleFieldsMode,
}

impl Grant {
    pub fn condition(&self) -> &CompiledCondition {
        &self.condition
    }

    pub fn into_condition(self) -> CompiledCondition {
        self.condition
    }

    pub fn effect(&self) -> ActionEffect {
        self.effect
    }

    pub fn entity(&self) -> &TableEntityId {
        &self.entity
    }

    /// Same grant with `filter` ANDed into the row condition.
    pub fn narrowed(mut self, filter: &Formula) -> Result<Self, FormulaError> {
        self.condition = self.condition.narrowed(filter)?;
        Ok(self)
    }

    /// Whether evaluating the condition needs the sibling rows.
    pub fn needs_siblings(&self) -> bool {
        self.condition.predicate().contains_aggregate()
    }

    /// The ALLOW policies whose condition holds for `row`.
    pub fn matched_policies(&self, row: &AttributeBag, siblings: &[AttributeBag]) -> Vec<&Policy> {
        let ctx = self.condition.context().with_entity(row).with_rows(siblings);
        self.policies
            .data_policies(self.effect)
            .filter(|p| p.effect == Effect::Allow)
            .filter(|p| test(&p.condition, &ctx).unwrap_or(false))
            .collect()
    }

    /// Mask the fields of `row` its matched policies hide.
    pub fn project(&self, row: &AttributeBag, siblings: &[AttributeBag]) -> AttributeBag {
        let matched = self.matched_policies(row, siblings);
        visibility::project(row, &matched, self.visible_fields)
    }

    pub fn project_entity<E: FilterableEntity>(&self, entity: &mut E, siblings: &[AttributeBag]) {
        let row = entity.attributes();
        let matched = self.matched_policies(&row, siblings);
        visibility::project_entity(entity, &matched, self.visible_fields);
    }

    /// Visible rows, masked. Aggregates in conditions range over all of `rows`.
    pub fn filter_rows(&self, rows: &[AttributeBag]) -> Result<Vec<AttributeBag>, FormulaError> {
        Ok(self
            .condition
            .filter_rows(rows)?
            .iter()
            .map(|row| self.project(row, rows))
            .collect())
    }

    /// Check one write against the compiled WRITE condition.
    ///
    /// An update must hold for the stored row and for the merged result.
    pub fn authorize_write(&self, write: &RowWrite, siblings: &[AttributeBag]) -> Result<(), AbacError> {
        let condition = self
            .condition
            .clone()
            .with_environment("operation", write.operation());
        let allowed = match write {
            RowWrite::Create { after } => condition.matches_write(after, None, siblings),
            RowWrite::Update { before, after } => {
                let merged = before.merged(after);
                condition
                    .matches_write(before, Some(before), siblings)
                    .and_then(|ok| {
                        if ok {
                            condition.matches_write(&merged, Some(before), siblings)
                        } else {
                            Ok(false)
                        }
                    })
            }
            RowWrite::Delete { before } => condition.matches_write(before, Some(before), siblings),
        };
        let allowed = allowed.unwrap_or_else(|e| {
            tracing::warn!(action = %self.action_id, error = %e, "Write condition failed to evaluate, denying");
            false
        });
        if allowed {
            return Ok(());
        }
        let record_id = write.record_id();
        tracing::debug!(
            action = %self.action_id,
            entity = %self.entity,
            record = %record_id,
            operation = write.operation(),
            "Write denied"
        );
        Err(AbacError::WriteDenied {
            verb: write.verb(),
            action_id: self.action_id.clone(),
            entity_id: self.entity.to_string(),
            record_id,
        })
    }
}

/// Resolves, caches and applies policies for actions.
pub struct PermissionEvaluator {
    source: Arc<dyn PolicySource>,
    cache: Arc<PolicyCache>,
    visible_fields: VisibleFieldsMode,
}

impl PermissionEvaluator {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self {
            source,
            cache: Arc::new(PolicyCache::new()),
            visible_fields: VisibleFieldsMode::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<PolicyCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_visible_fields(mut self, mode: VisibleFieldsMode) -> Self {
        self.visible_fields = mode;
        self
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    pub fn visible_fields(&self) -> VisibleFieldsMode {
        self.visible_fields
    }

    pub fn policy_set(&self, key: &PolicyKey) -> Result<Arc<PolicySet>, AbacError> {
        self.cache
            .get_or_load(key, || PolicySet::resolve(self.source.as_ref(), key))
    }

    /// Gate the action, then compile the row condition for `effect`.
    pub fn authorize(&self, request: &AccessRequest<'_>, effect: ActionEffect) -> Result<Grant, AbacError> {
        let policies = self.policy_set(&request.key(effect))?;
        gate(&policies, request)?;
        let condition = compile(&policies, effect, request.subject, request.filter, request.fields)?;
        Ok(Grant {
            action_id: request.action_id.to_string(),
            entity: request.entity.clone(),
            effect,
            policies,
            condition,
            visible_fields: self.visible_fields,
        })
    }

    pub fn authorize_read(&self, request: &AccessRequest<'_>) -> Result<Grant, AbacError> {
        self.authorize(request, ActionEffect::Read)
    }

    /// Gate the action and check one write. `siblings` are the stored rows
    /// cross-row conditions range over.
    pub fn authorize_write(
        &self,
        request: &AccessRequest<'_>,
        write: &RowWrite,
        siblings: &[AttributeBag],
    ) -> Result<(), AbacError> {
        self.authorize(request, ActionEffect::Write)?
            .authorize_write(write, siblings)
    }

    /// Run `operation` only once the action is authorized.
    pub fn with_authorization<R, E, F>(
        &self,
        request: &AccessRequest<'_>,
        effect: ActionEffect,
        operation: F,
    ) -> Result<R, E>
    where
        F: FnOnce(Grant) -> Result<R, E>,
        E: From<AbacError>,
    {
        let grant = self.authorize(request, effect)?;
        operation(grant)
    }

    /// Drop every cached policy set. Call after replacing policies.
    pub fn evict(&self) {
        self.cache.evict();
    }
}

/// Action-level check. Evaluation errors fail closed.
fn gate(policies: &PolicySet, request: &AccessRequest<'_>) -> Result<(), AbacError> {
    let subject = request.subject;
    let ctx = EvalContext::new(subject.user(), subject.environment());
    let mut granted = policies.has_entity_allow();

    for policy in policies.gate_policies() {
        match (policy.effect, test(&policy.condition, &ctx)) {
            (Effect::Allow, Ok(true)) => granted = true,
            (Effect::Deny, Ok(true)) => {
                tracing::debug!(action = %request.action_id, policy = %policy.id, "Action denied by policy");
                return Err(denied(request));
            }
            (Effect::Deny, Err(e)) => {
                tracing::warn!(policy = %policy.id, error = %e, "Deny gate policy failed to evaluate, denying");
                return Err(denied(request));
            }
            (Effect::Allow, Err(e)) => {
                tracing::warn!(policy = %policy.id, error = %e, "Allow gate policy failed to evaluate, ignoring");
            }
            _ => {}
        }
    }

    if granted {
        Ok(())
    } else {
        tracing::debug!(action = %request.action_id, entity = %request.entity, "No policy grants the action");
        Err(denied(request))
    }
}

fn denied(request: &AccessRequest<'_>) -> AbacError {
    AbacError::ActionDenied {
        action_id: request.action_id.to_string(),
    }
}
