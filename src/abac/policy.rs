//! KDL form of policy definitions.
//!
//! ```kdl
//! policy "editor_read" scope="entity" effect="ALLOW" action-effect="READ" target="abac-demo.abac_demo.publication" {
//!     condition "\"editor\" in user.roles"
//!     visible-fields {
//!         - "id"
//!         - "theme"
//!     }
//! }
//! ```

use crate::abac::errors::AbacError;
use crate::abac::types::*;
use crate::formula::FormulaSource;
use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeSet;

/// One parsed policy, or the reason it was rejected.
pub type PolicyEntry = Result<Policy, AbacError>;

/// Parse a KDL document into policies.
///
/// Syntax errors fail the whole document; an invalid `policy` node only
/// rejects that policy.
pub fn parse_kdl_document(source: &str) -> Result<Vec<PolicyEntry>, AbacError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AbacError::KdlParse(e.to_string()))?;

    let mut entries = Vec::new();
    for node in doc.nodes() {
        match node.name().value() {
            "policy" => entries.push(parse_policy_node(node).and_then(Policy::try_from)),
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }
    Ok(entries)
}

fn parse_policy_node(node: &KdlNode) -> Result<PolicyDocument, AbacError> {
    let id = first_string_arg(node).ok_or_else(|| {
        AbacError::configuration(
            "<unnamed>",
            "policy node requires a string argument (e.g. policy \"editor_read\" scope=\"entity\")",
        )
    })?;

    let scope = match string_prop(node, "scope") {
        Some(raw) => PolicyScope::parse(&id, raw)?,
        None => return Err(AbacError::configuration(&id, "missing `scope` property")),
    };
    let effect = match string_prop(node, "effect") {
        Some(raw) => Effect::parse(&id, raw)?,
        None => return Err(AbacError::configuration(&id, "missing `effect` property")),
    };
    let kind = string_prop(node, "kind")
        .map(|raw| PolicyKind::parse(&id, raw))
        .transpose()?;
    let action_effect = string_prop(node, "action-effect")
        .map(|raw| ActionEffect::parse(&id, raw))
        .transpose()?;
    let target_entity = string_prop(node, "target")
        .map(|raw| {
            raw.parse::<TableEntityId>()
                .map_err(|_| AbacError::configuration(&id, format!("invalid target `{raw}`")))
        })
        .transpose()?;

    let mut condition = None;
    let mut actions = Vec::new();
    let mut visible_fields = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "condition" => {
                    let text = first_string_arg(child).ok_or_else(|| {
                        AbacError::configuration(&id, "condition node requires a string argument")
                    })?;
                    condition = Some(FormulaSource::Expression(text));
                }
                "actions" => actions = dash_list(child),
                "visible-fields" => {
                    visible_fields = Some(dash_list(child).into_iter().collect::<BTreeSet<_>>());
                }
                other => {
                    return Err(AbacError::configuration(
                        &id,
                        format!("unexpected child `{other}` (expected `condition`, `actions` or `visible-fields`)"),
                    ));
                }
            }
        }
    }

    Ok(PolicyDocument {
        id,
        scope,
        effect,
        kind,
        actions,
        action_effect,
        target_entity,
        condition,
        visible_fields,
    })
}

fn string_prop<'n>(node: &'n KdlNode, name: &str) -> Option<&'n str> {
    node.get(name).and_then(|v| v.as_string())
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
fn dash_list(node: &KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{parse_formula, Formula};

    #[test]
    fn test_parse_entity_policy() {
        let kdl = r#"
policy "editor_read" scope="entity" effect="ALLOW" action-effect="READ" target="abac-demo.abac_demo.publication" {
    condition "\"editor\" in user.roles"
    visible-fields {
        - "id"
        - "theme"
    }
}
"#;
        let entries = parse_kdl_document(kdl).unwrap();
        assert_eq!(entries.len(), 1);
        let policy = entries.into_iter().next().unwrap().unwrap();
        assert_eq!(policy.id, "editor_read");
        assert_eq!(policy.scope, PolicyScope::Entity);
        assert_eq!(policy.action_effect, Some(ActionEffect::Read));
        assert_eq!(
            policy.target_entity,
            Some(TableEntityId::new("abac-demo", "abac_demo", "publication"))
        );
        assert_eq!(policy.condition, parse_formula("\"editor\" in user.roles").unwrap());
        assert_eq!(policy.visible_fields.unwrap().len(), 2);
    }

    #[test]
    fn test_parse_action_policy_with_actions() {
        let kdl = r#"
policy "can_list" scope="action" effect="allow" kind="action" {
    actions {
        - "employees.list"
        - "employees.fetch"
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap().remove(0).unwrap();
        assert_eq!(policy.kind, PolicyKind::Action);
        assert_eq!(policy.actions, vec!["employees.list", "employees.fetch"]);
        assert_eq!(policy.condition, Formula::bool(true));
    }

    #[test]
    fn test_invalid_policy_does_not_reject_siblings() {
        let kdl = r#"
policy "missing_target" scope="entity" effect="ALLOW" action-effect="READ"
policy "bad_effect" scope="universal" effect="maybe"
policy "ok" scope="universal" effect="DENY" {
    condition "user.blocked == true"
}
"#;
        let entries = parse_kdl_document(kdl).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], Err(AbacError::PolicyConfiguration { .. })));
        assert!(matches!(entries[1], Err(AbacError::PolicyConfiguration { .. })));
        assert_eq!(entries[2].as_ref().unwrap().id, "ok");
    }

    #[test]
    fn test_unknown_child_is_rejected() {
        let kdl = r#"
policy "p" scope="universal" effect="ALLOW" {
    principals {
        - "user/alice"
    }
}
"#;
        let entries = parse_kdl_document(kdl).unwrap();
        let err = entries[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("unexpected child `principals`"));
    }

    #[test]
    fn test_syntax_error_fails_document() {
        assert!(matches!(
            parse_kdl_document("policy \"p\" {"),
            Err(AbacError::KdlParse(_))
        ));
    }

    #[test]
    fn test_unknown_top_level_nodes_are_ignored() {
        let entries = parse_kdl_document("resource \"vm\"\n").unwrap();
        assert!(entries.is_empty());
    }
}
