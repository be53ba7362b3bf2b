//! Formula language shared by policy conditions, user filters and computed
//! properties: tree, text syntax, type checker, evaluator and SQL push-down.

pub mod ast;
pub mod compute;
pub mod errors;
pub mod eval;
pub mod parser;
pub mod pushdown;
pub mod typecheck;
pub mod value;

pub use ast::{
    parse_computable_fields, parse_formula_document, AggregateFn, BinaryOp, ComputableFields,
    Formula, FormulaSource, Literal, Scope, UnaryOp,
};
pub use compute::{compute_array, compute_scalar, inject_computable_fields, inject_into_rows};
pub use errors::FormulaError;
pub use eval::{evaluate, test, EvalContext};
pub use parser::parse_formula;
pub use pushdown::{to_condition, to_sql_expr, PushdownScope, SIBLING_ALIAS};
pub use typecheck::{FieldDef, KindEnv};
pub use value::{AttributeBag, Kind, Value};
