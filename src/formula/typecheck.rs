//! Static kind checking of formula trees against known attribute kinds.

use crate::formula::ast::{AggregateFn, BinaryOp, Formula, Scope, UnaryOp};
use crate::formula::errors::FormulaError;
use crate::formula::value::{AttributeBag, Kind};

/// A column of a filterable entity and the kind of its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: Kind,
}

impl FieldDef {
    pub const fn new(name: &'static str, kind: Kind) -> Self {
        Self { name, kind }
    }
}

/// What the checker knows about each scope.
///
/// User and environment kinds come from the concrete subject attributes.
/// Row scopes come from the entity schema when one is given; otherwise any
/// row attribute is accepted as [`Kind::Any`].
#[derive(Debug, Clone, Copy)]
pub struct KindEnv<'a> {
    user: &'a AttributeBag,
    environment: &'a AttributeBag,
    fields: Option<&'a [FieldDef]>,
}

impl<'a> KindEnv<'a> {
    pub fn new(user: &'a AttributeBag, environment: &'a AttributeBag) -> Self {
        Self {
            user,
            environment,
            fields: None,
        }
    }

    pub fn with_fields(mut self, fields: Option<&'a [FieldDef]>) -> Self {
        self.fields = fields;
        self
    }

    fn attribute_kind(&self, scope: Scope, path: &[String]) -> Result<Kind, FormulaError> {
        match scope {
            // a missing user attribute evaluates to null
            Scope::User => Ok(self.user.get_path(path).map_or(Kind::Null, |v| v.kind())),
            // environment entries such as `operation` are bound per request
            Scope::Environment => Ok(self
                .environment
                .get_path(path)
                .map_or(Kind::Any, |v| v.kind())),
            Scope::Computed => Ok(Kind::Any),
            Scope::Entity | Scope::Current | Scope::Outer => {
                let Some(fields) = self.fields else {
                    return Ok(Kind::Any);
                };
                let Some(first) = path.first() else {
                    return Ok(Kind::Any);
                };
                let field = fields.iter().find(|f| f.name == first).ok_or_else(|| {
                    FormulaError::UnknownAttribute {
                        scope: scope.keyword().to_string(),
                        field: first.clone(),
                    }
                })?;
                if path.len() == 1 {
                    Ok(field.kind)
                } else {
                    Ok(Kind::Any)
                }
            }
        }
    }
}

fn expect(node: &Formula, actual: Kind, expected: Kind) -> Result<(), FormulaError> {
    if actual.satisfies(expected) {
        Ok(())
    } else {
        Err(FormulaError::mismatch(node, expected, actual))
    }
}

impl Formula {
    /// Infer the kind of this formula, failing on the first operand that
    /// cannot meet its operator.
    pub fn check(&self, env: &KindEnv<'_>) -> Result<Kind, FormulaError> {
        match self {
            Formula::Literal { value } => Ok(value.to_value().kind()),
            Formula::Attribute { scope, path } => env.attribute_kind(*scope, path),
            Formula::Unary { op, operand } => {
                let kind = operand.check(env)?;
                match op {
                    UnaryOp::Not => {
                        expect(self, kind, Kind::Bool)?;
                        Ok(Kind::Bool)
                    }
                    UnaryOp::Neg => {
                        expect(self, kind, Kind::Number)?;
                        Ok(Kind::Number)
                    }
                    UnaryOp::Size => {
                        if !(kind.satisfies(Kind::Array) || kind == Kind::String) {
                            return Err(FormulaError::mismatch(self, Kind::Array, kind));
                        }
                        Ok(Kind::Number)
                    }
                }
            }
            Formula::Binary { op, left, right } => {
                let l = left.check(env)?;
                let r = right.check(env)?;
                match op {
                    BinaryOp::And | BinaryOp::Or => {
                        expect(self, l, Kind::Bool)?;
                        expect(self, r, Kind::Bool)?;
                        Ok(Kind::Bool)
                    }
                    BinaryOp::Eq | BinaryOp::Ne => {
                        if !l.compatible(r) {
                            return Err(FormulaError::mismatch(self, l, r));
                        }
                        Ok(Kind::Bool)
                    }
                    BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le => {
                        if !l.compatible(r) {
                            return Err(FormulaError::mismatch(self, l, r));
                        }
                        if !l.orderable() {
                            return Err(FormulaError::mismatch(self, Kind::Number, l));
                        }
                        if !r.orderable() {
                            return Err(FormulaError::mismatch(self, Kind::Number, r));
                        }
                        Ok(Kind::Bool)
                    }
                    BinaryOp::In => {
                        expect(self, r, Kind::Array)?;
                        if let Formula::Literal { value } = right.as_ref() {
                            for item in value.to_value().as_list().unwrap_or_default() {
                                if !l.compatible(item.kind()) {
                                    return Err(FormulaError::mismatch(self, l, item.kind()));
                                }
                            }
                        }
                        Ok(Kind::Bool)
                    }
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                        expect(self, l, Kind::Number)?;
                        expect(self, r, Kind::Number)?;
                        Ok(Kind::Number)
                    }
                }
            }
            Formula::Aggregate {
                function,
                over,
                group_by,
                filter,
            } => {
                if function.needs_operand() && over.is_none() {
                    return Err(FormulaError::InvalidExpression(format!(
                        "`{}` needs an operand",
                        function.name()
                    )));
                }
                if let Some(group_by) = group_by {
                    group_by.check(env)?;
                }
                if let Some(filter) = filter {
                    expect(filter, filter.check(env)?, Kind::Bool)?;
                }
                let over_kind = match over {
                    Some(over) => over.check(env)?,
                    None => Kind::Any,
                };
                match function {
                    AggregateFn::Count => Ok(Kind::Number),
                    AggregateFn::Exists => Ok(Kind::Bool),
                    AggregateFn::Sum | AggregateFn::Avg | AggregateFn::Divergence => {
                        expect(self, over_kind, Kind::Number)?;
                        Ok(Kind::Number)
                    }
                    AggregateFn::Min | AggregateFn::Max => {
                        if !over_kind.orderable() {
                            return Err(FormulaError::mismatch(self, Kind::Number, over_kind));
                        }
                        Ok(over_kind)
                    }
                }
            }
        }
    }

    /// Check that the formula can serve as a predicate.
    pub fn check_predicate(&self, env: &KindEnv<'_>) -> Result<(), FormulaError> {
        expect(self, self.check(env)?, Kind::Bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parse_formula;

    const FIELDS: &[FieldDef] = &[
        FieldDef::new("id", Kind::String),
        FieldDef::new("branch", Kind::String),
        FieldDef::new("salary", Kind::Number),
        FieldDef::new("skills", Kind::Array),
        FieldDef::new("publication_date", Kind::Date),
    ];

    fn user() -> AttributeBag {
        AttributeBag::new()
            .with("branch", "NY")
            .with("roles", vec!["admin".to_string()])
            .with("salary", 100)
    }

    fn check(text: &str) -> Result<Kind, FormulaError> {
        let user = user();
        let env = AttributeBag::new();
        let kinds = KindEnv::new(&user, &env).with_fields(Some(FIELDS));
        parse_formula(text).unwrap().check(&kinds)
    }

    #[test]
    fn test_well_typed_predicates() {
        assert_eq!(
            check(r#""admin" in user.roles && entity.branch == user.branch"#).unwrap(),
            Kind::Bool
        );
        assert_eq!(
            check(r#"entity.publication_date < "2023-06-01""#).unwrap(),
            Kind::Bool
        );
        assert_eq!(check("user.salary / size(entity.skills)").unwrap(), Kind::Number);
        assert_eq!(check("env.operation == \"create\"").unwrap(), Kind::Bool);
    }

    #[test]
    fn test_boolean_operator_rejects_numbers() {
        let err = check("entity.salary && true").unwrap_err();
        assert!(matches!(
            err,
            FormulaError::TypeMismatch {
                expected: Kind::Bool,
                actual: Kind::Number,
                ..
            }
        ));
    }

    #[test]
    fn test_comparison_rejects_mixed_kinds() {
        assert!(check(r#"entity.branch > 5"#).is_err());
        assert!(check(r#"entity.salary in ["a", "b"]"#).is_err());
        assert!(check("user.roles > user.roles").is_err());
    }

    #[test]
    fn test_unknown_column_is_reported() {
        let err = check("entity.nickname == \"x\"").unwrap_err();
        assert!(matches!(err, FormulaError::UnknownAttribute { .. }));
    }

    #[test]
    fn test_missing_user_attribute_is_null() {
        assert_eq!(check("user.missing > 5").unwrap(), Kind::Bool);
    }

    #[test]
    fn test_aggregate_kinds() {
        assert_eq!(
            check("avg(entity.salary by entity.branch)").unwrap(),
            Kind::Number
        );
        assert_eq!(
            check("max(entity.publication_date)").unwrap(),
            Kind::Date
        );
        assert!(check("sum(entity.branch)").is_err());
        assert!(check("count(where entity.salary)").is_err());
    }
}
