//! Formula trees.
//!
//! A [`Formula`] is a closed expression tree over attribute references,
//! literals and operators. Trees serialize to a tagged JSON form that
//! round-trips without loss, and print (via `Display`) in the textual
//! syntax accepted by [`crate::formula::parse_formula`].

use crate::formula::errors::FormulaError;
use crate::formula::parser::parse_formula;
use crate::formula::value::Value;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where an attribute reference is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Entity,
    Environment,
    Computed,
    /// Stored version of the row under write.
    Current,
    /// Enclosing row of an aggregate.
    Outer,
}

impl Scope {
    pub fn keyword(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Entity => "entity",
            Scope::Environment => "env",
            Scope::Computed => "computed",
            Scope::Current => "current",
            Scope::Outer => "outer",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Scope> {
        match word {
            "user" => Some(Scope::User),
            "entity" => Some(Scope::Entity),
            "env" | "environment" => Some(Scope::Environment),
            "computed" => Some(Scope::Computed),
            "current" => Some(Scope::Current),
            "outer" => Some(Scope::Outer),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    Not,
    Neg,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Gt
                | BinaryOp::Lt
                | BinaryOp::Ge
                | BinaryOp::Le
                | BinaryOp::In
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
        )
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div => 5,
            _ => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Exists,
    /// Value of the enclosing row minus the group average, rounded half up.
    Divergence,
}

impl AggregateFn {
    pub fn name(self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Exists => "exists",
            AggregateFn::Divergence => "divergence",
        }
    }

    pub fn from_name(name: &str) -> Option<AggregateFn> {
        match name {
            "count" => Some(AggregateFn::Count),
            "sum" => Some(AggregateFn::Sum),
            "avg" => Some(AggregateFn::Avg),
            "min" => Some(AggregateFn::Min),
            "max" => Some(AggregateFn::Max),
            "exists" => Some(AggregateFn::Exists),
            "divergence" => Some(AggregateFn::Divergence),
            _ => None,
        }
    }

    /// Functions that cannot work without an `over` operand.
    pub fn needs_operand(self) -> bool {
        !matches!(self, AggregateFn::Count | AggregateFn::Exists)
    }
}

/// A literal carried in a formula tree, tagged so dates and floats survive JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    List(Vec<Literal>),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(n) => Value::Int(*n),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::Str(s.clone()),
            Literal::Date(d) => Value::Date(*d),
            Literal::List(items) => Value::List(items.iter().map(Literal::to_value).collect()),
        }
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Int(n)
    }
}

impl From<i32> for Literal {
    fn from(n: i32) -> Self {
        Literal::Int(n.into())
    }
}

impl From<f64> for Literal {
    fn from(f: f64) -> Self {
        Literal::Float(f)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_string())
    }
}

impl From<NaiveDate> for Literal {
    fn from(d: NaiveDate) -> Self {
        Literal::Date(d)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum Formula {
    Literal {
        value: Literal,
    },
    Attribute {
        scope: Scope,
        path: Vec<String>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Formula>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Formula>,
        right: Box<Formula>,
    },
    Aggregate {
        function: AggregateFn,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        over: Option<Box<Formula>>,
        #[serde(default, rename = "groupBy", skip_serializing_if = "Option::is_none")]
        group_by: Option<Box<Formula>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Box<Formula>>,
    },
}

impl Formula {
    pub fn literal(value: impl Into<Literal>) -> Formula {
        Formula::Literal {
            value: value.into(),
        }
    }

    pub fn null() -> Formula {
        Formula::Literal {
            value: Literal::Null,
        }
    }

    pub fn bool(b: bool) -> Formula {
        Formula::literal(b)
    }

    /// Attribute reference; `path` is dot-separated (`"address.city"`).
    pub fn attr(scope: Scope, path: &str) -> Formula {
        Formula::Attribute {
            scope,
            path: path.split('.').map(str::to_string).collect(),
        }
    }

    pub fn binary(op: BinaryOp, left: Formula, right: Formula) -> Formula {
        Formula::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, operand: Formula) -> Formula {
        Formula::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn aggregate(
        function: AggregateFn,
        over: Option<Formula>,
        group_by: Option<Formula>,
        filter: Option<Formula>,
    ) -> Formula {
        Formula::Aggregate {
            function,
            over: over.map(Box::new),
            group_by: group_by.map(Box::new),
            filter: filter.map(Box::new),
        }
    }

    /// Conjunction that folds constant operands away.
    pub fn and(left: Formula, right: Formula) -> Formula {
        match (left.as_constant_bool(), right.as_constant_bool()) {
            (Some(false), _) | (_, Some(false)) => Formula::bool(false),
            (Some(true), _) => right,
            (_, Some(true)) => left,
            _ => Formula::binary(BinaryOp::And, left, right),
        }
    }

    /// Disjunction that folds constant operands away.
    pub fn or(left: Formula, right: Formula) -> Formula {
        match (left.as_constant_bool(), right.as_constant_bool()) {
            (Some(true), _) | (_, Some(true)) => Formula::bool(true),
            (Some(false), _) => right,
            (_, Some(false)) => left,
            _ => Formula::binary(BinaryOp::Or, left, right),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(operand: Formula) -> Formula {
        match operand.as_constant_bool() {
            Some(b) => Formula::bool(!b),
            None => Formula::unary(UnaryOp::Not, operand),
        }
    }

    /// Disjunction of all operands; empty yields `false`.
    pub fn any_of(operands: impl IntoIterator<Item = Formula>) -> Formula {
        operands
            .into_iter()
            .fold(Formula::bool(false), Formula::or)
    }

    /// Conjunction of all operands; empty yields `true`.
    pub fn all_of(operands: impl IntoIterator<Item = Formula>) -> Formula {
        operands.into_iter().fold(Formula::bool(true), Formula::and)
    }

    pub fn as_constant_bool(&self) -> Option<bool> {
        match self {
            Formula::Literal {
                value: Literal::Bool(b),
            } => Some(*b),
            _ => None,
        }
    }

    pub fn is_null_literal(&self) -> bool {
        matches!(
            self,
            Formula::Literal {
                value: Literal::Null
            }
        )
    }

    /// Whether any attribute of `scope` occurs in the tree, aggregates included.
    pub fn references(&self, scope: Scope) -> bool {
        let mut found = false;
        self.walk(&mut |f| {
            if let Formula::Attribute { scope: s, .. } = f {
                found |= *s == scope;
            }
        });
        found
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |f| found |= matches!(f, Formula::Aggregate { .. }));
        found
    }

    /// Pre-order traversal.
    pub fn walk(&self, visit: &mut dyn FnMut(&Formula)) {
        visit(self);
        match self {
            Formula::Literal { .. } | Formula::Attribute { .. } => {}
            Formula::Unary { operand, .. } => operand.walk(visit),
            Formula::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Formula::Aggregate {
                over,
                group_by,
                filter,
                ..
            } => {
                for child in [over, group_by, filter].into_iter().flatten() {
                    child.walk(visit);
                }
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Formula::Binary { op, .. } => op.precedence(),
            Formula::Unary { op: UnaryOp::Size, .. } => 7,
            Formula::Unary { .. } => 6,
            _ => 7,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("null"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(n) => write!(f, "{n}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::String(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
            Literal::Date(d) => write!(f, "date(\"{}\")", d.format("%Y-%m-%d")),
            Literal::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Formula::Literal { value } => write!(f, "{value}"),
            Formula::Attribute { scope, path } => write!(f, "{scope}.{}", path.join(".")),
            Formula::Unary { op, operand } => match op {
                UnaryOp::Size => write!(f, "size({operand})"),
                UnaryOp::Not => {
                    f.write_str("!")?;
                    operand.fmt_child(f, 6)
                }
                UnaryOp::Neg => {
                    // `-5` would read back as a negative literal
                    if matches!(**operand, Formula::Literal { .. }) {
                        write!(f, "-({operand})")
                    } else {
                        f.write_str("-")?;
                        operand.fmt_child(f, 6)
                    }
                }
            },
            Formula::Binary { op, left, right } => {
                let p = op.precedence();
                let left_min = if op.is_comparison() { p + 1 } else { p };
                left.fmt_child(f, left_min)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_child(f, p + 1)
            }
            Formula::Aggregate {
                function,
                over,
                group_by,
                filter,
            } => {
                write!(f, "{}(", function.name())?;
                let mut sep = "";
                if let Some(over) = over {
                    write!(f, "{over}")?;
                    sep = " ";
                }
                if let Some(group_by) = group_by {
                    write!(f, "{sep}by {group_by}")?;
                    sep = " ";
                }
                if let Some(filter) = filter {
                    if *function == AggregateFn::Exists && over.is_none() && group_by.is_none() {
                        write!(f, "{filter}")?;
                    } else {
                        write!(f, "{sep}where {filter}")?;
                    }
                }
                f.write_str(")")
            }
        }
    }
}

/// A formula as it appears in configuration: either text or a JSON tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormulaSource {
    Expression(String),
    Tree(Formula),
}

impl FormulaSource {
    pub fn into_formula(self) -> Result<Formula, FormulaError> {
        match self {
            FormulaSource::Expression(text) => parse_formula(&text),
            FormulaSource::Tree(formula) => Ok(formula),
        }
    }
}

impl From<Formula> for FormulaSource {
    fn from(formula: Formula) -> Self {
        FormulaSource::Tree(formula)
    }
}

/// Named formulas injected into documents as derived fields.
pub type ComputableFields = BTreeMap<String, Formula>;

/// Parse a JSON object of `name -> formula` (text or tree).
pub fn parse_computable_fields(json: &str) -> Result<ComputableFields, FormulaError> {
    let raw: BTreeMap<String, FormulaSource> = serde_json::from_str(json)?;
    raw.into_iter()
        .map(|(name, source)| Ok((name, source.into_formula()?)))
        .collect()
}

/// Parse a single formula document (text or tree).
pub fn parse_formula_document(json: &str) -> Result<Formula, FormulaError> {
    serde_json::from_str::<FormulaSource>(json)?.into_formula()
}
