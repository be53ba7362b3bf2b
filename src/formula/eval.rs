//! In-memory evaluation with SQL three-valued logic.
//!
//! Null stands for "unknown": comparisons and arithmetic with a null operand
//! yield null, `&&`/`||`/`!` follow Kleene logic, and a predicate only holds
//! when it evaluates to `true`. Comparing against a `null` literal tests
//! nullness instead (`x == null` is `x IS NULL`).

use crate::formula::ast::{AggregateFn, BinaryOp, Formula, Scope, UnaryOp};
use crate::formula::errors::FormulaError;
use crate::formula::value::{AttributeBag, Kind, Value};
use std::cmp::Ordering;

/// Bindings visible to a formula during evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub user: &'a AttributeBag,
    pub environment: &'a AttributeBag,
    pub entity: Option<&'a AttributeBag>,
    pub current: Option<&'a AttributeBag>,
    pub outer: Option<&'a AttributeBag>,
    pub computed: Option<&'a AttributeBag>,
    /// Rows aggregates range over.
    pub rows: &'a [AttributeBag],
}

impl<'a> EvalContext<'a> {
    pub fn new(user: &'a AttributeBag, environment: &'a AttributeBag) -> Self {
        Self {
            user,
            environment,
            entity: None,
            current: None,
            outer: None,
            computed: None,
            rows: &[],
        }
    }

    pub fn with_entity(mut self, entity: &'a AttributeBag) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_current(mut self, current: Option<&'a AttributeBag>) -> Self {
        self.current = current;
        self
    }

    pub fn with_computed(mut self, computed: &'a AttributeBag) -> Self {
        self.computed = Some(computed);
        self
    }

    pub fn with_rows(mut self, rows: &'a [AttributeBag]) -> Self {
        self.rows = rows;
        self
    }

    fn scope(&self, scope: Scope) -> Option<&'a AttributeBag> {
        match scope {
            Scope::User => Some(self.user),
            Scope::Environment => Some(self.environment),
            Scope::Entity => self.entity,
            Scope::Current => self.current,
            Scope::Outer => self.outer,
            Scope::Computed => self.computed,
        }
    }

    fn resolve(&self, scope: Scope, path: &[String]) -> Value {
        self.scope(scope)
            .and_then(|bag| bag.get_path(path))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Evaluate a formula to a value.
pub fn evaluate(formula: &Formula, ctx: &EvalContext<'_>) -> Result<Value, FormulaError> {
    match formula {
        Formula::Literal { value } => Ok(value.to_value()),
        Formula::Attribute { scope, path } => Ok(ctx.resolve(*scope, path)),
        Formula::Unary { op, operand } => {
            let value = evaluate(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(truth(formula, &value)?.map(|b| !b).into()),
                UnaryOp::Neg => match value {
                    Value::Null => Ok(Value::Null),
                    Value::Int(n) => Ok(n
                        .checked_neg()
                        .map_or(Value::Float(-(n as f64)), Value::Int)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(FormulaError::mismatch(formula, Kind::Number, other.kind())),
                },
                UnaryOp::Size => match value {
                    Value::Null => Ok(Value::Null),
                    Value::List(items) => Ok(Value::Int(items.len() as i64)),
                    Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                    other => Err(FormulaError::mismatch(formula, Kind::Array, other.kind())),
                },
            }
        }
        Formula::Binary { op, left, right } => eval_binary(formula, *op, left, right, ctx),
        Formula::Aggregate {
            function,
            over,
            group_by,
            filter,
        } => eval_aggregate(
            *function,
            over.as_deref(),
            group_by.as_deref(),
            filter.as_deref(),
            ctx,
        ),
    }
}

/// Evaluate a predicate. Only a definite `true` passes; null does not.
pub fn test(formula: &Formula, ctx: &EvalContext<'_>) -> Result<bool, FormulaError> {
    let value = evaluate(formula, ctx)?;
    Ok(truth(formula, &value)? == Some(true))
}

fn truth(node: &Formula, value: &Value) -> Result<Option<bool>, FormulaError> {
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(FormulaError::mismatch(node, Kind::Bool, other.kind())),
    }
}

fn number(node: &Formula, value: &Value) -> Result<f64, FormulaError> {
    value
        .as_f64()
        .ok_or_else(|| FormulaError::mismatch(node, Kind::Number, value.kind()))
}

fn eval_binary(
    node: &Formula,
    op: BinaryOp,
    left: &Formula,
    right: &Formula,
    ctx: &EvalContext<'_>,
) -> Result<Value, FormulaError> {
    match op {
        BinaryOp::And => {
            let l = truth(node, &evaluate(left, ctx)?)?;
            if l == Some(false) {
                return Ok(Value::Bool(false));
            }
            let r = truth(node, &evaluate(right, ctx)?)?;
            Ok(match (l, r) {
                (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            })
        }
        BinaryOp::Or => {
            let l = truth(node, &evaluate(left, ctx)?)?;
            if l == Some(true) {
                return Ok(Value::Bool(true));
            }
            let r = truth(node, &evaluate(right, ctx)?)?;
            Ok(match (l, r) {
                (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            })
        }
        BinaryOp::Eq | BinaryOp::Ne if left.is_null_literal() || right.is_null_literal() => {
            let other = if left.is_null_literal() { right } else { left };
            let is_null = evaluate(other, ctx)?.is_null();
            Ok(Value::Bool(if op == BinaryOp::Eq { is_null } else { !is_null }))
        }
        BinaryOp::Eq | BinaryOp::Ne => {
            let l = evaluate(left, ctx)?;
            let r = evaluate(right, ctx)?;
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let eq = l
                .loose_eq(&r)
                .ok_or_else(|| FormulaError::mismatch(node, l.kind(), r.kind()))?;
            Ok(Value::Bool(if op == BinaryOp::Eq { eq } else { !eq }))
        }
        BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le => {
            let l = evaluate(left, ctx)?;
            let r = evaluate(right, ctx)?;
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = l
                .sql_cmp(&r)
                .ok_or_else(|| FormulaError::mismatch(node, l.kind(), r.kind()))?;
            let result = match op {
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Ge => ord != Ordering::Less,
                _ => ord != Ordering::Greater,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::In => {
            let element = evaluate(left, ctx)?;
            let collection = evaluate(right, ctx)?;
            let items = match &collection {
                Value::Null => return Ok(Value::Null),
                Value::List(items) => items,
                other => return Err(FormulaError::mismatch(node, Kind::Array, other.kind())),
            };
            if element.is_null() {
                return Ok(if items.is_empty() {
                    Value::Bool(false)
                } else {
                    Value::Null
                });
            }
            let mut unknown = false;
            for item in items {
                match element.loose_eq(item) {
                    Some(true) => return Ok(Value::Bool(true)),
                    Some(false) => {}
                    None if item.is_null() => unknown = true,
                    None => {
                        return Err(FormulaError::mismatch(node, element.kind(), item.kind()));
                    }
                }
            }
            Ok(if unknown { Value::Null } else { Value::Bool(false) })
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            let l = evaluate(left, ctx)?;
            let r = evaluate(right, ctx)?;
            if l.is_null() || r.is_null() {
                // still reject non-numeric operands
                if !l.is_null() {
                    number(node, &l)?;
                }
                if !r.is_null() {
                    number(node, &r)?;
                }
                return Ok(Value::Null);
            }
            arithmetic(node, op, &l, &r)
        }
    }
}

fn arithmetic(node: &Formula, op: BinaryOp, l: &Value, r: &Value) -> Result<Value, FormulaError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::Int(n));
        }
    }
    let a = number(node, l)?;
    let b = number(node, r)?;
    Ok(match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        // division is always real-valued; by zero it is unknown
        _ if b == 0.0 => Value::Null,
        _ => Value::Float(a / b),
    })
}

/// Round half up: `floor(x + 0.5)`.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

fn eval_aggregate(
    function: AggregateFn,
    over: Option<&Formula>,
    group_by: Option<&Formula>,
    filter: Option<&Formula>,
    ctx: &EvalContext<'_>,
) -> Result<Value, FormulaError> {
    let anchor = ctx.entity;
    // grouping only applies relative to an enclosing row
    let group = match (group_by, anchor) {
        (Some(g), Some(_)) => Some((g, evaluate(g, ctx)?)),
        _ => None,
    };

    let mut matched = 0usize;
    let mut values = Vec::new();
    for row in ctx.rows {
        let inner = EvalContext {
            entity: Some(row),
            outer: anchor,
            ..*ctx
        };
        if let Some((g, key)) = &group {
            if evaluate(g, &inner)?.loose_eq(key) != Some(true) {
                continue;
            }
        }
        if let Some(filter) = filter {
            if !test(filter, &inner)? {
                continue;
            }
        }
        matched += 1;
        if let Some(over) = over {
            let value = evaluate(over, &inner)?;
            if !value.is_null() {
                values.push(value);
            }
        }
    }

    let node = || {
        Formula::aggregate(
            function,
            over.cloned(),
            group_by.cloned(),
            filter.cloned(),
        )
    };
    match function {
        AggregateFn::Exists => Ok(Value::Bool(matched > 0)),
        AggregateFn::Count => {
            let n = if over.is_some() { values.len() } else { matched };
            Ok(Value::Int(n as i64))
        }
        AggregateFn::Sum => sum(&node(), &values),
        AggregateFn::Avg => Ok(average(&node(), &values)?.map_or(Value::Null, Value::Float)),
        AggregateFn::Min | AggregateFn::Max => {
            let mut best: Option<&Value> = None;
            for value in &values {
                let ord = match best {
                    None => None,
                    Some(b) => Some(value.sql_cmp(b).ok_or_else(|| {
                        FormulaError::mismatch(node(), b.kind(), value.kind())
                    })?),
                };
                let better = match (function, ord) {
                    (_, None) => true,
                    (AggregateFn::Min, Some(o)) => o == Ordering::Less,
                    (_, Some(o)) => o == Ordering::Greater,
                };
                if better {
                    best = Some(value);
                }
            }
            Ok(best.cloned().unwrap_or(Value::Null))
        }
        AggregateFn::Divergence => {
            let (Some(over), Some(_)) = (over, anchor) else {
                return Ok(Value::Null);
            };
            let own = evaluate(over, ctx)?;
            if own.is_null() {
                return Ok(Value::Null);
            }
            let own = number(&node(), &own)?;
            Ok(average(&node(), &values)?
                .map_or(Value::Null, |avg| Value::Int(round_half_up(own - avg))))
        }
    }
}

fn sum(node: &Formula, values: &[Value]) -> Result<Value, FormulaError> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    let mut exact: Option<i64> = Some(0);
    let mut total = 0.0;
    for value in values {
        total += number(node, value)?;
        exact = match (exact, value) {
            (Some(acc), Value::Int(n)) => acc.checked_add(*n),
            _ => None,
        };
    }
    Ok(exact.map_or(Value::Float(total), Value::Int))
}

fn average(node: &Formula, values: &[Value]) -> Result<Option<f64>, FormulaError> {
    if values.is_empty() {
        return Ok(None);
    }
    let mut total = 0.0;
    for value in values {
        total += number(node, value)?;
    }
    Ok(Some(total / values.len() as f64))
}
