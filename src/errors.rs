use crate::abac::AbacError;
use crate::formula::FormulaError;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RowguardError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(rowguard::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(rowguard::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(rowguard::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(rowguard::db))]
    Db(#[from] sea_orm::DbErr),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Access(#[from] AbacError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Formula(#[from] FormulaError),

    #[error("Invalid `{entity}` row: {reason}")]
    #[diagnostic(code(rowguard::invalid_row))]
    InvalidRow { entity: String, reason: String },

    #[error("Bad request: {0}")]
    #[diagnostic(code(rowguard::bad_request))]
    BadRequest(String),
}

impl RowguardError {
    /// Whether the error is an access denial rather than a fault.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, RowguardError::Access(e) if e.is_access_denied())
    }

    pub(crate) fn invalid_row(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        RowguardError::InvalidRow {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}
