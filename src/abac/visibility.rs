//! Field masking driven by the read policies a row matched.

use crate::abac::entity::FilterableEntity;
use crate::abac::types::Policy;
use crate::formula::AttributeBag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How the `visibleFields` of several matched policies combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibleFieldsMode {
    /// A field is visible if any declaring policy lists it.
    #[default]
    Union,
    /// A field is visible only if every declaring policy lists it.
    Intersection,
}

/// Fields allowed by `matched`, or `None` when no policy restricts them.
pub fn allowed_fields<'p>(
    matched: impl IntoIterator<Item = &'p Policy>,
    mode: VisibleFieldsMode,
) -> Option<BTreeSet<String>> {
    let mut allowed: Option<BTreeSet<String>> = None;
    for declared in matched.into_iter().filter_map(|p| p.visible_fields.as_ref()) {
        allowed = Some(match (allowed, mode) {
            (None, _) => declared.clone(),
            (Some(acc), VisibleFieldsMode::Union) => acc.union(declared).cloned().collect(),
            (Some(acc), VisibleFieldsMode::Intersection) => {
                acc.intersection(declared).cloned().collect()
            }
        });
    }
    allowed
}

/// Copy of `row` without the fields the matched policies hide.
pub fn project(row: &AttributeBag, matched: &[&Policy], mode: VisibleFieldsMode) -> AttributeBag {
    match allowed_fields(matched.iter().copied(), mode) {
        None => row.clone(),
        Some(allowed) => row
            .iter()
            .filter(|(name, _)| allowed.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    }
}

/// Clear the hidden fields of a typed entity in place.
pub fn project_entity<E: FilterableEntity>(entity: &mut E, matched: &[&Policy], mode: VisibleFieldsMode) {
    let Some(allowed) = allowed_fields(matched.iter().copied(), mode) else {
        return;
    };
    for field in E::fields() {
        if !allowed.contains(field.name) {
            entity.clear_field(field.name);
        }
    }
}
