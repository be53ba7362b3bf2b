use crate::formula::FormulaError;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AbacError {
    #[error("Access to action `{action_id}` is denied")]
    #[diagnostic(
        code(rowguard::abac::action_denied),
        help("Grant the action with an allow policy of kind `action`, or an allow entity policy for the entity it touches")
    )]
    ActionDenied { action_id: String },

    #[error("{verb} of the record {record_id} by action {action_id} is forbidden in current context.")]
    #[diagnostic(code(rowguard::abac::write_denied))]
    WriteDenied {
        verb: &'static str,
        action_id: String,
        entity_id: String,
        record_id: String,
    },

    #[error("Record `{record_id}` of `{entity_id}` not found")]
    #[diagnostic(code(rowguard::abac::not_found))]
    NotFound { entity_id: String, record_id: String },

    #[error("Invalid policy `{policy}`: {reason}")]
    #[diagnostic(
        code(rowguard::abac::policy_configuration),
        help("Entity policies need `targetEntity` and `actionEffect`; universal and action policies must not name a target entity")
    )]
    PolicyConfiguration { policy: String, reason: String },

    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(rowguard::abac::policy_load),
        help("Check that the file exists and is readable")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy document `{path}`")]
    #[diagnostic(
        code(rowguard::abac::policy_document),
        help("A JSON policy file holds one policy object or an array of them")
    )]
    PolicyDocument {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(rowguard::abac::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev for the specification")
    )]
    KdlParse(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Formula(#[from] FormulaError),

    #[error("I/O error: {0}")]
    #[diagnostic(code(rowguard::abac::io))]
    Io(#[from] std::io::Error),
}

impl AbacError {
    /// Denials are outcomes of evaluation, not faults.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            AbacError::ActionDenied { .. } | AbacError::WriteDenied { .. }
        )
    }

    pub(crate) fn configuration(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        AbacError::PolicyConfiguration {
            policy: policy.into(),
            reason: reason.into(),
        }
    }
}
