//! Computed properties over visible rows.
//!
//! Aggregates see `ctx.rows`, which callers fill with the rows that survived
//! filtering and projection, never the raw table.

use crate::formula::ast::{ComputableFields, Formula};
use crate::formula::errors::FormulaError;
use crate::formula::eval::{evaluate, EvalContext};
use crate::formula::typecheck::KindEnv;
use crate::formula::value::{AttributeBag, Value};

fn typecheck(formula: &Formula, ctx: &EvalContext<'_>) -> Result<(), FormulaError> {
    formula.check(&KindEnv::new(ctx.user, ctx.environment))?;
    Ok(())
}

/// Evaluate a formula once against the context.
pub fn compute_scalar(formula: &Formula, ctx: &EvalContext<'_>) -> Result<Value, FormulaError> {
    typecheck(formula, ctx)?;
    evaluate(formula, ctx)
}

/// Evaluate a formula per row, or per group when `group_by` is given.
///
/// Without grouping the output has one value per row in input order. With
/// grouping it has one value per distinct key in order of first appearance,
/// each computed with `ctx.rows` narrowed to that group.
pub fn compute_array(
    formula: &Formula,
    ctx: &EvalContext<'_>,
    group_by: Option<&Formula>,
) -> Result<Vec<Value>, FormulaError> {
    typecheck(formula, ctx)?;
    let Some(group_by) = group_by else {
        return ctx
            .rows
            .iter()
            .map(|row| evaluate(formula, &ctx.with_entity(row)))
            .collect();
    };
    typecheck(group_by, ctx)?;

    let mut groups: Vec<(Value, Vec<AttributeBag>)> = Vec::new();
    for row in ctx.rows {
        let key = evaluate(group_by, &ctx.with_entity(row))?;
        let slot = groups.iter_mut().find(|(k, _)| same_key(k, &key));
        match slot {
            Some((_, rows)) => rows.push(row.clone()),
            None => groups.push((key, vec![row.clone()])),
        }
    }
    tracing::debug!(groups = groups.len(), formula = %formula, "computing grouped array");

    groups
        .iter()
        .map(|(_, rows)| {
            let group_ctx = EvalContext {
                entity: None,
                ..ctx.with_rows(rows)
            };
            evaluate(formula, &group_ctx)
        })
        .collect()
}

fn same_key(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        _ => a.loose_eq(b) == Some(true),
    }
}

/// Add every field of `fields` to `document`.
///
/// Fields are evaluated in name order with `entity` bound to the document as
/// it was before injection; each can read the ones before it via `computed.*`.
pub fn inject_computable_fields(
    document: &mut AttributeBag,
    fields: &ComputableFields,
    ctx: &EvalContext<'_>,
) -> Result<(), FormulaError> {
    let base = document.clone();
    let mut computed = AttributeBag::new();
    for (name, formula) in fields {
        typecheck(formula, ctx)?;
        let value = {
            let field_ctx = ctx.with_entity(&base).with_computed(&computed);
            evaluate(formula, &field_ctx)?
        };
        computed.insert(name.clone(), value);
    }
    for (name, value) in computed {
        document.insert(name, value);
    }
    Ok(())
}

/// Inject `fields` into every row, with aggregates ranging over all of `rows`.
pub fn inject_into_rows(
    rows: &mut [AttributeBag],
    fields: &ComputableFields,
    ctx: &EvalContext<'_>,
) -> Result<(), FormulaError> {
    if fields.is_empty() {
        return Ok(());
    }
    let snapshot = rows.to_vec();
    let row_ctx = ctx.with_rows(&snapshot);
    for row in rows.iter_mut() {
        inject_computable_fields(row, fields, &row_ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parse_formula;
    use serde_json::json;

    fn rows() -> Vec<AttributeBag> {
        [
            json!({ "id": "1", "branch": "NY", "salary": 250000 }),
            json!({ "id": "2", "branch": "NY", "salary": 110000 }),
            json!({ "id": "3", "branch": "NY", "salary": 50000 }),
            json!({ "id": "4", "branch": "LA", "salary": 250000 }),
            json!({ "id": "5", "branch": "LA", "salary": 110000 }),
        ]
        .iter()
        .map(|j| AttributeBag::from_json(j).unwrap())
        .collect()
    }

    #[test]
    fn test_divergence_array() {
        let rows = rows();
        let user = AttributeBag::new();
        let env = AttributeBag::new();
        let ctx = EvalContext::new(&user, &env).with_rows(&rows);
        let f = parse_formula("divergence(entity.salary by entity.branch)").unwrap();
        let values: Vec<i64> = compute_array(&f, &ctx, None)
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![113333, -26667, -86667, 70000, -70000]);
    }

    #[test]
    fn test_grouped_array_in_first_appearance_order() {
        let rows = rows();
        let user = AttributeBag::new();
        let env = AttributeBag::new();
        let ctx = EvalContext::new(&user, &env).with_rows(&rows);
        let f = parse_formula("count()").unwrap();
        let group = parse_formula("entity.branch").unwrap();
        assert_eq!(
            compute_array(&f, &ctx, Some(&group)).unwrap(),
            vec![Value::Int(3), Value::Int(2)]
        );
        let avg = parse_formula("avg(entity.salary)").unwrap();
        assert_eq!(
            compute_array(&avg, &ctx, Some(&group)).unwrap(),
            vec![Value::Float(410000.0 / 3.0), Value::Float(180000.0)]
        );
    }

    #[test]
    fn test_scalar_salary_by_skill() {
        let user = AttributeBag::from_json(&json!({
            "salary": 250000,
            "skills": ["Politics", "Sports"]
        }))
        .unwrap();
        let env = AttributeBag::new();
        let ctx = EvalContext::new(&user, &env);
        let f = parse_formula("user.salary / size(user.skills)").unwrap();
        assert_eq!(compute_scalar(&f, &ctx).unwrap().as_i64(), Some(125000));
    }

    #[test]
    fn test_scalar_rejects_ill_typed_formula() {
        let user = AttributeBag::new().with("name", "Anna");
        let env = AttributeBag::new();
        let ctx = EvalContext::new(&user, &env);
        let f = parse_formula("user.name * 2").unwrap();
        assert!(matches!(
            compute_scalar(&f, &ctx),
            Err(FormulaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_inject_chains_computed_fields() {
        let user = AttributeBag::new();
        let env = AttributeBag::new();
        let ctx = EvalContext::new(&user, &env);
        let mut doc = AttributeBag::new().with("salary", 100).with("bonus", 20);
        let mut fields = ComputableFields::new();
        fields.insert("a_total".into(), parse_formula("entity.salary + entity.bonus").unwrap());
        fields.insert("b_double".into(), parse_formula("computed.a_total * 2").unwrap());
        inject_computable_fields(&mut doc, &fields, &ctx).unwrap();
        assert_eq!(doc.get("a_total"), Some(&Value::Int(120)));
        assert_eq!(doc.get("b_double"), Some(&Value::Int(240)));
        assert_eq!(doc.get("salary"), Some(&Value::Int(100)));
    }

    #[test]
    fn test_inject_into_rows_uses_row_set() {
        let mut rows = rows();
        let user = AttributeBag::new();
        let env = AttributeBag::new();
        let ctx = EvalContext::new(&user, &env);
        let mut fields = ComputableFields::new();
        fields.insert(
            "divergence".into(),
            parse_formula("divergence(entity.salary by entity.branch)").unwrap(),
        );
        inject_into_rows(&mut rows, &fields, &ctx).unwrap();
        assert_eq!(rows[3].get("divergence"), Some(&Value::Int(70000)));
    }
}
