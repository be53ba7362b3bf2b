use crate::abac::errors::AbacError;
use crate::formula::{Formula, FormulaSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Identity of a table: `service.schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableEntityId {
    pub service: String,
    pub schema: String,
    pub table: String,
}

impl TableEntityId {
    pub fn new(service: impl Into<String>, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.service, self.schema, self.table)
    }
}

impl FromStr for TableEntityId {
    type Err = AbacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [service, schema, table]
                if !service.is_empty() && !schema.is_empty() && !table.is_empty() =>
            {
                Ok(Self::new(*service, *schema, *table))
            }
            _ => Err(AbacError::configuration(
                s,
                "entity reference must look like `service.schema.table`",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    #[serde(alias = "UNIVERSAL")]
    Universal,
    #[serde(alias = "ACTION")]
    Action,
    #[serde(alias = "ENTITY")]
    Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    #[serde(alias = "allow")]
    Allow,
    #[serde(alias = "deny")]
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionEffect {
    #[serde(alias = "read")]
    Read,
    #[serde(alias = "write")]
    Write,
}

impl fmt::Display for ActionEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionEffect::Read => "read",
            ActionEffect::Write => "write",
        })
    }
}

/// What a universal or action-scoped policy governs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Gates invocation of the action.
    Action,
    /// Contributes a row condition.
    #[default]
    Data,
}

fn parse_enum<T: serde::de::DeserializeOwned>(policy: &str, field: &str, raw: &str) -> Result<T, AbacError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| AbacError::configuration(policy, format!("invalid {field} `{raw}`")))
}

impl PolicyScope {
    pub fn parse(policy: &str, raw: &str) -> Result<Self, AbacError> {
        parse_enum(policy, "scope", raw)
    }
}

impl Effect {
    pub fn parse(policy: &str, raw: &str) -> Result<Self, AbacError> {
        parse_enum(policy, "effect", raw)
    }
}

impl ActionEffect {
    pub fn parse(policy: &str, raw: &str) -> Result<Self, AbacError> {
        parse_enum(policy, "actionEffect", raw)
    }
}

impl PolicyKind {
    pub fn parse(policy: &str, raw: &str) -> Result<Self, AbacError> {
        parse_enum(policy, "kind", raw)
    }
}

/// A validated policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicyDocument", into = "PolicyDocument")]
pub struct Policy {
    pub id: String,
    pub scope: PolicyScope,
    pub effect: Effect,
    pub kind: PolicyKind,
    /// Actions an action-scoped policy is registered under.
    pub actions: Vec<String>,
    pub action_effect: Option<ActionEffect>,
    pub target_entity: Option<TableEntityId>,
    pub condition: Formula,
    pub visible_fields: Option<BTreeSet<String>>,
}

impl Policy {
    /// Entity-scoped policy for `(effect, entity)`.
    pub fn entity(
        id: impl Into<String>,
        effect: Effect,
        action_effect: ActionEffect,
        target: TableEntityId,
        condition: Formula,
    ) -> Self {
        Self {
            id: id.into(),
            scope: PolicyScope::Entity,
            effect,
            kind: PolicyKind::Data,
            actions: Vec::new(),
            action_effect: Some(action_effect),
            target_entity: Some(target),
            condition,
            visible_fields: None,
        }
    }

    /// Universal policy applying to every action.
    pub fn universal(id: impl Into<String>, effect: Effect, kind: PolicyKind, condition: Formula) -> Self {
        Self {
            id: id.into(),
            scope: PolicyScope::Universal,
            effect,
            kind,
            actions: Vec::new(),
            action_effect: None,
            target_entity: None,
            condition,
            visible_fields: None,
        }
    }

    /// Policy registered for the given actions.
    pub fn action(
        id: impl Into<String>,
        actions: impl IntoIterator<Item = impl Into<String>>,
        effect: Effect,
        kind: PolicyKind,
        condition: Formula,
    ) -> Self {
        Self {
            id: id.into(),
            scope: PolicyScope::Action,
            effect,
            kind,
            actions: actions.into_iter().map(Into::into).collect(),
            action_effect: None,
            target_entity: None,
            condition,
            visible_fields: None,
        }
    }

    pub fn with_visible_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.visible_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Check the structural invariants of the policy.
    pub fn validate(&self) -> Result<(), AbacError> {
        if self.id.trim().is_empty() {
            return Err(AbacError::configuration("<unnamed>", "policy id must not be empty"));
        }
        match self.scope {
            PolicyScope::Entity => {
                if self.target_entity.is_none() {
                    return Err(AbacError::configuration(
                        &self.id,
                        "entity-scoped policies require `targetEntity`",
                    ));
                }
                if self.action_effect.is_none() {
                    return Err(AbacError::configuration(
                        &self.id,
                        "entity-scoped policies require `actionEffect`",
                    ));
                }
                if self.kind == PolicyKind::Action {
                    return Err(AbacError::configuration(
                        &self.id,
                        "entity-scoped policies cannot be of kind `action`",
                    ));
                }
            }
            PolicyScope::Universal | PolicyScope::Action => {
                if self.target_entity.is_some() {
                    return Err(AbacError::configuration(
                        &self.id,
                        "only entity-scoped policies may name `targetEntity`",
                    ));
                }
            }
        }
        if self.visible_fields.is_some() && self.action_effect == Some(ActionEffect::Write) {
            return Err(AbacError::configuration(
                &self.id,
                "`visibleFields` only applies to read policies",
            ));
        }
        Ok(())
    }

    /// Whether this policy contributes a row condition for `effect`.
    pub fn governs_rows(&self, effect: ActionEffect) -> bool {
        match self.scope {
            PolicyScope::Entity => self.action_effect == Some(effect),
            _ => self.kind == PolicyKind::Data,
        }
    }
}

/// Serialized policy, as found in JSON files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub id: String,
    pub scope: PolicyScope,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PolicyKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_effect: Option<ActionEffect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity: Option<TableEntityId>,
    /// Missing means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<FormulaSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_fields: Option<BTreeSet<String>>,
}

impl TryFrom<PolicyDocument> for Policy {
    type Error = AbacError;

    fn try_from(doc: PolicyDocument) -> Result<Self, Self::Error> {
        let condition = match doc.condition {
            Some(source) => source.into_formula().map_err(|e| {
                AbacError::configuration(&doc.id, format!("invalid condition: {e}"))
            })?,
            None => Formula::bool(true),
        };
        let policy = Policy {
            id: doc.id,
            scope: doc.scope,
            effect: doc.effect,
            kind: doc.kind.unwrap_or_default(),
            actions: doc.actions,
            action_effect: doc.action_effect,
            target_entity: doc.target_entity,
            condition,
            visible_fields: doc.visible_fields,
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl From<Policy> for PolicyDocument {
    fn from(policy: Policy) -> Self {
        PolicyDocument {
            id: policy.id,
            scope: policy.scope,
            effect: policy.effect,
            kind: Some(policy.kind),
            actions: policy.actions,
            action_effect: policy.action_effect,
            target_entity: policy.target_entity,
            condition: Some(FormulaSource::Tree(policy.condition)),
            visible_fields: policy.visible_fields,
        }
    }
}
