//! Compiles a policy set into one row predicate.
//!
//! The predicate is `(any ALLOW) && !(any DENY)`, further narrowed by an
//! optional user filter. No ALLOW policy at all compiles to `false`.

use crate::abac::cache::PolicySet;
use crate::abac::errors::AbacError;
use crate::abac::source::Subject;
use crate::abac::types::{ActionEffect, Effect};
use crate::formula::{
    test, to_condition, AttributeBag, EvalContext, FieldDef, Formula, FormulaError, KindEnv,
    PushdownScope, Value,
};
use sea_orm::Condition;

/// A predicate closed over the subject of one request.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    predicate: Formula,
    user: AttributeBag,
    environment: AttributeBag,
    fields: Option<&'static [FieldDef]>,
}

/// Compile the policies governing `effect` for `subject`.
///
/// A policy whose condition fails the type check is failed closed on its
/// own: an ALLOW is dropped, a DENY matches every row. A malformed `filter`
/// is an error.
pub fn compile(
    policies: &PolicySet,
    effect: ActionEffect,
    subject: &Subject,
    filter: Option<&Formula>,
    fields: Option<&'static [FieldDef]>,
) -> Result<CompiledCondition, AbacError> {
    let kinds = KindEnv::new(subject.user(), subject.environment()).with_fields(fields);
    let mut allow = Vec::new();
    let mut deny = Vec::new();

    for policy in policies.data_policies(effect) {
        let checked = policy.condition.check_predicate(&kinds);
        match (policy.effect, checked) {
            (Effect::Allow, Ok(())) => allow.push(policy.condition.clone()),
            (Effect::Deny, Ok(())) => deny.push(policy.condition.clone()),
            (Effect::Allow, Err(e)) => {
                tracing::warn!(policy = %policy.id, error = %e, "Dropping allow policy that fails type checking");
            }
            (Effect::Deny, Err(e)) => {
                tracing::warn!(policy = %policy.id, error = %e, "Deny policy fails type checking, denying every row");
                deny.push(Formula::bool(true));
            }
        }
    }

    let mut predicate = Formula::and(
        Formula::any_of(allow),
        Formula::not(Formula::any_of(deny)),
    );
    if let Some(filter) = filter {
        filter.check_predicate(&kinds)?;
        predicate = Formula::and(predicate, filter.clone());
    }
    tracing::debug!(effect = %effect, predicate = %predicate, "Compiled row condition");

    Ok(CompiledCondition {
        predicate,
        user: subject.user().clone(),
        environment: subject.environment().clone(),
        fields,
    })
}

impl CompiledCondition {
    pub fn predicate(&self) -> &Formula {
        &self.predicate
    }

    pub fn user(&self) -> &AttributeBag {
        &self.user
    }

    pub fn environment(&self) -> &AttributeBag {
        &self.environment
    }

    pub fn is_always_false(&self) -> bool {
        self.predicate.as_constant_bool() == Some(false)
    }

    /// AND a user filter into the predicate. Never widens.
    pub fn narrowed(mut self, filter: &Formula) -> Result<Self, FormulaError> {
        filter.check_predicate(&KindEnv::new(&self.user, &self.environment).with_fields(self.fields))?;
        self.predicate = Formula::and(self.predicate, filter.clone());
        Ok(self)
    }

    /// Bind an extra environment attribute, such as `operation` for writes.
    pub fn with_environment(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.environment.insert(key, value);
        self
    }

    /// Context with the subject bound and no row.
    pub fn context(&self) -> EvalContext<'_> {
        EvalContext::new(&self.user, &self.environment)
    }

    /// Evaluate against one row; aggregates range over `siblings`.
    pub fn matches(&self, entity: &AttributeBag, siblings: &[AttributeBag]) -> Result<bool, FormulaError> {
        self.matches_write(entity, None, siblings)
    }

    /// Evaluate against a proposed row with the stored version bound as `current`.
    pub fn matches_write(
        &self,
        entity: &AttributeBag,
        current: Option<&AttributeBag>,
        siblings: &[AttributeBag],
    ) -> Result<bool, FormulaError> {
        let ctx = self
            .context()
            .with_entity(entity)
            .with_current(current)
            .with_rows(siblings);
        test(&self.predicate, &ctx)
    }

    /// Rows that satisfy the predicate; aggregates range over all of `rows`.
    pub fn filter_rows(&self, rows: &[AttributeBag]) -> Result<Vec<AttributeBag>, FormulaError> {
        let mut out = Vec::new();
        for row in rows {
            if self.matches(row, rows)? {
                out.push(row.clone());
            }
        }
        Ok(out)
    }

    /// Query-layer form of the predicate for rows of `table`.
    pub fn to_condition(&self, table: &str) -> Result<Condition, FormulaError> {
        let scope = PushdownScope::new(table, &self.user, &self.environment).with_fields(self.fields);
        to_condition(&self.predicate, &scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abac::types::{Policy, PolicyKind, TableEntityId};
    use crate::formula::{parse_formula, Kind};
    use serde_json::json;

    const FIELDS: &[FieldDef] = &[
        FieldDef::new("id", Kind::String),
        FieldDef::new("branch", Kind::String),
        FieldDef::new("salary", Kind::Number),
    ];

    fn employee() -> TableEntityId {
        TableEntityId::new("abac-demo", "abac_demo", "employee")
    }

    fn entity_policy(id: &str, effect: Effect, condition: &str) -> Policy {
        Policy::entity(
            id,
            effect,
            ActionEffect::Read,
            employee(),
            parse_formula(condition).unwrap(),
        )
    }

    fn subject() -> Subject {
        Subject::new(
            AttributeBag::from_json(&json!({ "id": "u1", "branch": "NY", "roles": ["chief_editor"] }))
                .unwrap(),
        )
    }

    fn rows() -> Vec<AttributeBag> {
        [
            json!({ "id": "1", "branch": "NY", "salary": 250000 }),
            json!({ "id": "2", "branch": "NY", "salary": 110000 }),
            json!({ "id": "3", "branch": "LA", "salary": 50000 }),
        ]
        .iter()
        .map(|j| AttributeBag::from_json(j).unwrap())
        .collect()
    }

    fn ids(rows: &[AttributeBag]) -> Vec<String> {
        rows.iter()
            .map(|r| r.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string())
            .collect()
    }

    fn compile_entity(policies: Vec<Policy>, filter: Option<&Formula>) -> Result<CompiledCondition, AbacError> {
        let set = PolicySet {
            entity: policies,
            ..Default::default()
        };
        compile(&set, ActionEffect::Read, &subject(), filter, Some(FIELDS))
    }

    #[test]
    fn test_no_allow_compiles_to_false() {
        let cond = compile_entity(vec![], None).unwrap();
        assert!(cond.is_always_false());
        assert!(cond.filter_rows(&rows()).unwrap().is_empty());

        let deny_only = compile_entity(vec![entity_policy("d", Effect::Deny, "entity.salary > 0")], None).unwrap();
        assert!(deny_only.is_always_false());
    }

    #[test]
    fn test_allow_policies_are_ored() {
        let cond = compile_entity(
            vec![
                entity_policy("a", Effect::Allow, "entity.branch == user.branch"),
                entity_policy("b", Effect::Allow, "entity.salary < 60000"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(ids(&cond.filter_rows(&rows()).unwrap()), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_deny_overrides_allow() {
        let cond = compile_entity(
            vec![
                entity_policy("a", Effect::Allow, "entity.branch == user.branch"),
                entity_policy("d", Effect::Deny, "entity.salary > 200000"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(ids(&cond.filter_rows(&rows()).unwrap()), vec!["2"]);
    }

    #[test]
    fn test_filter_only_narrows() {
        let filter = parse_formula("entity.salary < 200000").unwrap();
        let cond = compile_entity(
            vec![entity_policy("a", Effect::Allow, "entity.branch == user.branch")],
            Some(&filter),
        )
        .unwrap();
        assert_eq!(ids(&cond.filter_rows(&rows()).unwrap()), vec!["2"]);

        let wide = parse_formula("true || entity.salary > 0").unwrap();
        let cond = compile_entity(vec![], None).unwrap().narrowed(&wide).unwrap();
        assert!(cond.filter_rows(&rows()).unwrap().is_empty());
    }

    #[test]
    fn test_ill_typed_allow_is_dropped() {
        let cond = compile_entity(
            vec![
                entity_policy("bad", Effect::Allow, "entity.salary && true"),
                entity_policy("a", Effect::Allow, "entity.branch == \"LA\""),
            ],
            None,
        )
        .unwrap();
        assert_eq!(ids(&cond.filter_rows(&rows()).unwrap()), vec!["3"]);
    }

    #[test]
    fn test_ill_typed_deny_fails_closed() {
        let cond = compile_entity(
            vec![
                entity_policy("a", Effect::Allow, "true"),
                entity_policy("bad", Effect::Deny, "entity.branch > 3"),
            ],
            None,
        )
        .unwrap();
        assert!(cond.is_always_false());
    }

    #[test]
    fn test_malformed_filter_is_an_error() {
        let filter = parse_formula("entity.salary + 1").unwrap();
        let err = compile_entity(vec![entity_policy("a", Effect::Allow, "true")], Some(&filter)).unwrap_err();
        assert!(matches!(err, AbacError::Formula(FormulaError::TypeMismatch { .. })));
    }

    #[test]
    fn test_only_data_policies_contribute_rows() {
        let set = PolicySet {
            universal: vec![Policy::universal(
                "gate",
                Effect::Allow,
                PolicyKind::Action,
                Formula::bool(true),
            )],
            ..Default::default()
        };
        let cond = compile(&set, ActionEffect::Read, &subject(), None, None).unwrap();
        assert!(cond.is_always_false());
    }

    #[test]
    fn test_pushdown_of_compiled_condition() {
        use sea_orm::sea_query::{Alias, Asterisk, Query, SqliteQueryBuilder};
        let cond = compile_entity(
            vec![entity_policy(
                "a",
                Effect::Allow,
                "\"chief_editor\" in user.roles && entity.branch == user.branch",
            )],
            None,
        )
        .unwrap();
        let sql = Query::select()
            .column(Asterisk)
            .from(Alias::new("employee"))
            .cond_where(cond.to_condition("employee").unwrap())
            .to_string(SqliteQueryBuilder);
        assert!(sql.contains(r#""employee"."branch" = 'NY'"#), "{sql}");
    }
}
