pub mod cache;
pub mod compiler;
pub mod entity;
pub mod errors;
pub mod loader;
pub mod permission;
pub mod policy;
pub mod source;
pub mod types;
pub mod visibility;

pub use cache::{PolicyCache, PolicyKey, PolicySet};
pub use compiler::{compile, CompiledCondition};
pub use entity::FilterableEntity;
pub use errors::AbacError;
pub use loader::{load_policies, DirectoryPolicySource, LoadReport, SkippedPolicy};
pub use permission::{AccessRequest, Grant, PermissionEvaluator, RowWrite};
pub use policy::parse_kdl_document;
pub use source::{AttributeSource, MemoryPolicySource, PolicySource, Subject};
pub use types::{
    ActionEffect, Effect, Policy, PolicyDocument, PolicyKind, PolicyScope, TableEntityId,
};
pub use visibility::{allowed_fields, project, project_entity, VisibleFieldsMode};
