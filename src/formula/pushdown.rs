//! Translation of formulas into SQL conditions for the row store.
//!
//! Subtrees that reference neither the row nor an aggregate are evaluated
//! up front and bound as parameters, so a predicate such as
//! `"admin" in user.roles && entity.branch == user.branch` reaches the
//! database as `"employee"."branch" = 'NY'`. Aggregates become correlated
//! subqueries over the same table aliased `sibling`.
//!
//! Constructs with no faithful SQL form (list-valued columns, nested document
//! paths, `size` of a row attribute, `divergence`) fail with
//! [`FormulaError::NotTranslatable`]; callers evaluate in memory instead.
//! Division is emitted as `l * 1.0 / r`: SQLite yields null on a zero
//! divisor like the in-memory evaluator does, PostgreSQL raises an error.

use crate::formula::ast::{AggregateFn, BinaryOp, Formula, Scope, UnaryOp};
use crate::formula::errors::FormulaError;
use crate::formula::eval::{evaluate, EvalContext};
use crate::formula::typecheck::FieldDef;
use crate::formula::value::{AttributeBag, Kind, Value};
use sea_orm::sea_query::{
    Alias, Expr, Func, Keyword, Query, SimpleExpr, Value as SqlValue,
};
use sea_orm::Condition;

/// Alias of the table inside aggregate subqueries.
pub const SIBLING_ALIAS: &str = "sibling";

/// Everything the translator needs besides the formula.
#[derive(Debug, Clone, Copy)]
pub struct PushdownScope<'a> {
    pub table: &'a str,
    pub user: &'a AttributeBag,
    pub environment: &'a AttributeBag,
    pub current: Option<&'a AttributeBag>,
    pub fields: Option<&'a [FieldDef]>,
}

impl<'a> PushdownScope<'a> {
    pub fn new(table: &'a str, user: &'a AttributeBag, environment: &'a AttributeBag) -> Self {
        Self {
            table,
            user,
            environment,
            current: None,
            fields: None,
        }
    }

    pub fn with_current(mut self, current: Option<&'a AttributeBag>) -> Self {
        self.current = current;
        self
    }

    pub fn with_fields(mut self, fields: Option<&'a [FieldDef]>) -> Self {
        self.fields = fields;
        self
    }
}

/// Translate a predicate into a condition for `Select::filter`.
pub fn to_condition(formula: &Formula, scope: &PushdownScope<'_>) -> Result<Condition, FormulaError> {
    let translator = Translator::root(scope);
    match translator.translate(formula)? {
        Sql::Const(Value::Bool(true)) => Ok(Condition::all()),
        Sql::Const(Value::Bool(false) | Value::Null) => Ok(Condition::all().add(never())),
        Sql::Const(other) => Err(FormulaError::mismatch(formula, Kind::Bool, other.kind())),
        Sql::Expr(expr) => Ok(Condition::all().add(expr)),
    }
}

/// Translate any formula into a SQL expression.
pub fn to_sql_expr(formula: &Formula, scope: &PushdownScope<'_>) -> Result<SimpleExpr, FormulaError> {
    Translator::root(scope).expr(formula)
}

fn never() -> SimpleExpr {
    Expr::val(1).eq(SimpleExpr::Value(SqlValue::from(0)))
}

enum Sql {
    Const(Value),
    Expr(SimpleExpr),
}

struct Translator<'s, 'a> {
    scope: &'s PushdownScope<'a>,
    row: String,
    outer: Option<String>,
    depth: usize,
}

impl<'s, 'a> Translator<'s, 'a> {
    fn root(scope: &'s PushdownScope<'a>) -> Self {
        Self {
            scope,
            row: scope.table.to_string(),
            outer: None,
            depth: 0,
        }
    }

    fn nested(&self) -> Self {
        let row = if self.depth == 0 {
            SIBLING_ALIAS.to_string()
        } else {
            format!("{SIBLING_ALIAS}_{}", self.depth + 1)
        };
        Self {
            scope: self.scope,
            row,
            outer: Some(self.row.clone()),
            depth: self.depth + 1,
        }
    }

    fn depends_on_row(&self, formula: &Formula) -> bool {
        let mut found = false;
        formula.walk(&mut |f| match f {
            Formula::Aggregate { .. } => found = true,
            Formula::Attribute {
                scope: Scope::Entity,
                ..
            } => found = true,
            Formula::Attribute {
                scope: Scope::Outer,
                ..
            } => found |= self.outer.is_some(),
            _ => {}
        });
        found
    }

    fn fold(&self, formula: &Formula) -> Result<Value, FormulaError> {
        let ctx = EvalContext::new(self.scope.user, self.scope.environment)
            .with_current(self.scope.current);
        evaluate(formula, &ctx)
    }

    fn field_kind(&self, formula: &Formula) -> Kind {
        match formula {
            Formula::Attribute {
                scope: Scope::Entity | Scope::Outer,
                path,
            } if path.len() == 1 => self
                .scope
                .fields
                .and_then(|fields| fields.iter().find(|f| f.name == path[0]))
                .map_or(Kind::Any, |f| f.kind),
            _ => Kind::Any,
        }
    }

    fn expr(&self, formula: &Formula) -> Result<SimpleExpr, FormulaError> {
        match self.translate(formula)? {
            Sql::Const(value) => constant(formula, &value, Kind::Any),
            Sql::Expr(expr) => Ok(expr),
        }
    }

    /// Translate `formula`, binding a constant with the kind of the column it meets.
    fn operand(&self, formula: &Formula, counterpart: &Formula) -> Result<SimpleExpr, FormulaError> {
        match self.translate(formula)? {
            Sql::Const(value) => constant(formula, &value, self.field_kind(counterpart)),
            Sql::Expr(expr) => Ok(expr),
        }
    }

    fn translate(&self, formula: &Formula) -> Result<Sql, FormulaError> {
        if !self.depends_on_row(formula) {
            return Ok(Sql::Const(self.fold(formula)?));
        }
        match formula {
            Formula::Literal { value } => Ok(Sql::Const(value.to_value())),
            Formula::Attribute { scope, path } => self.column(formula, *scope, path),
            Formula::Unary { op, operand } => match op {
                UnaryOp::Not => Ok(match self.translate(operand)? {
                    Sql::Const(v) => Sql::Const(match v {
                        Value::Bool(b) => Value::Bool(!b),
                        other => other,
                    }),
                    Sql::Expr(e) => Sql::Expr(e.not()),
                }),
                UnaryOp::Neg => {
                    let inner = self.expr(operand)?;
                    Ok(Sql::Expr(Expr::val(0).sub(inner)))
                }
                UnaryOp::Size => Err(FormulaError::not_translatable(
                    formula,
                    "`size` of a row attribute has no portable SQL form",
                )),
            },
            Formula::Binary { op, left, right } => self.binary(formula, *op, left, right),
            Formula::Aggregate {
                function,
                over,
                group_by,
                filter,
            } => self.aggregate(
                formula,
                *function,
                over.as_deref(),
                group_by.as_deref(),
                filter.as_deref(),
            ),
        }
    }

    fn column(&self, formula: &Formula, scope: Scope, path: &[String]) -> Result<Sql, FormulaError> {
        let alias = match scope {
            Scope::Entity => &self.row,
            Scope::Outer => match &self.outer {
                Some(outer) => outer,
                None => return Ok(Sql::Const(Value::Null)),
            },
            _ => return Ok(Sql::Const(self.fold(formula)?)),
        };
        let [name] = path else {
            return Err(FormulaError::not_translatable(
                formula,
                "nested document paths are not stored as columns",
            ));
        };
        if matches!(self.field_kind(formula), Kind::Array | Kind::Document) {
            return Err(FormulaError::not_translatable(
                formula,
                "list and document columns are stored serialized",
            ));
        }
        Ok(Sql::Expr(
            Expr::col((Alias::new(alias.as_str()), Alias::new(name.as_str()))).into(),
        ))
    }

    fn binary(
        &self,
        formula: &Formula,
        op: BinaryOp,
        left: &Formula,
        right: &Formula,
    ) -> Result<Sql, FormulaError> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                let l = self.translate(left)?;
                let r = self.translate(right)?;
                let (absorbing, neutral) = if op == BinaryOp::And {
                    (false, true)
                } else {
                    (true, false)
                };
                Ok(match (l, r) {
                    (Sql::Const(Value::Bool(b)), _) | (_, Sql::Const(Value::Bool(b)))
                        if b == absorbing =>
                    {
                        Sql::Const(Value::Bool(absorbing))
                    }
                    (Sql::Const(Value::Bool(b)), other) | (other, Sql::Const(Value::Bool(b)))
                        if b == neutral =>
                    {
                        other
                    }
                    (l, r) => {
                        let l = self.sql_of(left, l)?;
                        let r = self.sql_of(right, r)?;
                        Sql::Expr(if op == BinaryOp::And { l.and(r) } else { l.or(r) })
                    }
                })
            }
            BinaryOp::Eq | BinaryOp::Ne if left.is_null_literal() || right.is_null_literal() => {
                let other = if left.is_null_literal() { right } else { left };
                let e = Expr::expr(self.expr(other)?);
                Ok(Sql::Expr(if op == BinaryOp::Eq {
                    e.is_null()
                } else {
                    e.is_not_null()
                }))
            }
            BinaryOp::In => {
                let collection = match self.translate(right)? {
                    Sql::Const(v) => v,
                    Sql::Expr(_) => {
                        return Err(FormulaError::not_translatable(
                            formula,
                            "membership in a row attribute needs the list in memory",
                        ));
                    }
                };
                let items = match collection {
                    Value::Null => return Ok(Sql::Const(Value::Null)),
                    Value::List(items) => items,
                    other => return Err(FormulaError::mismatch(formula, Kind::Array, other.kind())),
                };
                if items.is_empty() {
                    return Ok(Sql::Const(Value::Bool(false)));
                }
                let hint = self.field_kind(left);
                let values = items
                    .iter()
                    .map(|item| constant(formula, item, hint))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Sql::Expr(Expr::expr(self.expr(left)?).is_in(values)))
            }
            _ => {
                let l = Expr::expr(self.operand(left, right)?);
                let r = self.operand(right, left)?;
                Ok(Sql::Expr(match op {
                    BinaryOp::Eq => l.eq(r),
                    BinaryOp::Ne => l.ne(r),
                    BinaryOp::Gt => l.gt(r),
                    BinaryOp::Lt => l.lt(r),
                    BinaryOp::Ge => l.gte(r),
                    BinaryOp::Le => l.lte(r),
                    BinaryOp::Add => l.add(r),
                    BinaryOp::Sub => l.sub(r),
                    BinaryOp::Mul => l.mul(r),
                    _ => Expr::expr(l.mul(SimpleExpr::Value(SqlValue::from(1.0f64)))).div(r),
                }))
            }
        }
    }

    fn sql_of(&self, formula: &Formula, sql: Sql) -> Result<SimpleExpr, FormulaError> {
        match sql {
            Sql::Const(value) => constant(formula, &value, Kind::Any),
            Sql::Expr(expr) => Ok(expr),
        }
    }

    fn aggregate(
        &self,
        formula: &Formula,
        function: AggregateFn,
        over: Option<&Formula>,
        group_by: Option<&Formula>,
        filter: Option<&Formula>,
    ) -> Result<Sql, FormulaError> {
        if function == AggregateFn::Divergence {
            return Err(FormulaError::not_translatable(
                formula,
                "divergence is computed in memory",
            ));
        }
        let inner = self.nested();
        let mut select = Query::select();
        select.from_as(Alias::new(self.scope.table), Alias::new(inner.row.as_str()));

        if let Some(group_by) = group_by {
            let key = inner.expr(group_by)?;
            select.and_where(Expr::expr(key).eq(self.expr(group_by)?));
        }
        if let Some(filter) = filter {
            match inner.translate(filter)? {
                Sql::Const(Value::Bool(true)) => {}
                Sql::Const(Value::Bool(false) | Value::Null) => {
                    select.and_where(never());
                }
                Sql::Const(other) => {
                    return Err(FormulaError::mismatch(filter, Kind::Bool, other.kind()));
                }
                Sql::Expr(e) => {
                    select.and_where(e);
                }
            }
        }

        let operand = || -> Result<SimpleExpr, FormulaError> {
            match over {
                Some(over) => inner.expr(over),
                None => Ok(SimpleExpr::Value(SqlValue::from(1i64))),
            }
        };
        match function {
            AggregateFn::Exists => {
                select.expr(SimpleExpr::Value(SqlValue::from(1i64)));
                return Ok(Sql::Expr(Expr::exists(select.to_owned())));
            }
            AggregateFn::Count => select.expr(Func::count(operand()?)),
            AggregateFn::Sum => select.expr(Func::sum(operand()?)),
            AggregateFn::Avg => select.expr(Func::avg(operand()?)),
            AggregateFn::Min => select.expr(Func::min(operand()?)),
            AggregateFn::Max => select.expr(Func::max(operand()?)),
            AggregateFn::Divergence => unreachable!("rejected above"),
        };
        Ok(Sql::Expr(SimpleExpr::SubQuery(
            None,
            Box::new(select.to_owned().into_sub_query_statement()),
        )))
    }
}

/// Bind a constant. Strings meeting a date column are bound as dates.
fn constant(formula: &Formula, value: &Value, hint: Kind) -> Result<SimpleExpr, FormulaError> {
    let bound = match value {
        Value::Null => return Ok(SimpleExpr::Keyword(Keyword::Null)),
        Value::Bool(b) => SqlValue::from(*b),
        Value::Int(n) => SqlValue::from(*n),
        Value::Float(f) => SqlValue::from(*f),
        Value::Str(s) if hint == Kind::Date => match value.as_date() {
            Some(d) => SqlValue::from(d),
            None => SqlValue::from(s.clone()),
        },
        Value::Str(s) => SqlValue::from(s.clone()),
        Value::Date(d) => SqlValue::from(*d),
        Value::List(_) | Value::Document(_) => {
            return Err(FormulaError::not_translatable(
                formula,
                "lists and documents cannot be bound as a single SQL value",
            ));
        }
    };
    Ok(SimpleExpr::Value(bound))
}
