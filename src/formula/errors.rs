use crate::formula::value::Kind;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FormulaError {
    #[error("Invalid formula expression: {0}")]
    #[diagnostic(
        code(rowguard::formula::invalid_expression),
        help("Supported operators: ==, !=, >, <, >=, <=, &&, ||, !, in, +, -, *, /. Attributes use a scope prefix (user., entity., env., computed., current., outer.)")
    )]
    InvalidExpression(String),

    #[error("Type mismatch in `{node}`: expected {expected}, found {actual}")]
    #[diagnostic(
        code(rowguard::formula::type_mismatch),
        help("Operands of comparisons must share a kind; `&&`, `||` and `!` need booleans; arithmetic needs numbers")
    )]
    TypeMismatch {
        node: String,
        expected: Kind,
        actual: Kind,
    },

    #[error("Unknown attribute `{scope}.{field}`")]
    #[diagnostic(
        code(rowguard::formula::unknown_attribute),
        help("Row attributes must name a column of the entity the formula is evaluated against")
    )]
    UnknownAttribute { scope: String, field: String },

    #[error("Formula `{node}` cannot be translated into a query condition: {reason}")]
    #[diagnostic(
        code(rowguard::formula::not_translatable),
        help("The caller should fall back to evaluating the condition in memory")
    )]
    NotTranslatable { node: String, reason: String },

    #[error("Invalid formula document: {0}")]
    #[diagnostic(
        code(rowguard::formula::document),
        help("A formula is either an expression string or a JSON tree with a `node` tag")
    )]
    Document(#[from] serde_json::Error),
}

impl FormulaError {
    pub(crate) fn mismatch(node: impl ToString, expected: Kind, actual: Kind) -> Self {
        FormulaError::TypeMismatch {
            node: node.to_string(),
            expected,
            actual,
        }
    }

    pub(crate) fn not_translatable(node: impl ToString, reason: impl Into<String>) -> Self {
        FormulaError::NotTranslatable {
            node: node.to_string(),
            reason: reason.into(),
        }
    }
}
