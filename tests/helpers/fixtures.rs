use rowguard::abac::{
    parse_kdl_document, ActionEffect, MemoryPolicySource, PermissionEvaluator, Policy, Subject,
    TableEntityId,
};
use rowguard::formula::{parse_computable_fields, parse_formula_document, AttributeBag, ComputableFields, Formula};
use std::path::PathBuf;
use std::sync::Arc;

pub const ADMIN: &str = "users/admin.json";
pub const CHIEF_EDITOR: &str = "users/chiefeditor.json";
pub const ACCOUNTANT: &str = "users/accountant.json";
pub const JOURNALIST: &str = "users/journalist.json";

fn fixture_path(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(path)
}

fn read_fixture(path: &str) -> String {
    let full = fixture_path(path);
    std::fs::read_to_string(&full)
        .unwrap_or_else(|e| panic!("Failed to read fixture {}: {e}", full.display()))
}

fn read_json(path: &str) -> serde_json::Value {
    serde_json::from_str(&read_fixture(path))
        .unwrap_or_else(|e| panic!("Fixture {path} is not valid JSON: {e}"))
}

fn read_rows(path: &str) -> Vec<AttributeBag> {
    let serde_json::Value::Array(items) = read_json(path) else {
        panic!("Fixture {path} must hold an array");
    };
    items
        .iter()
        .map(|item| AttributeBag::from_json(item).expect("Fixture rows must be objects"))
        .collect()
}

/// Subject built from a user fixture.
pub fn user(path: &str) -> Subject {
    let bag = AttributeBag::from_json(&read_json(path)).expect("User fixture must be an object");
    Subject::new(bag)
}

pub fn employee_rows() -> Vec<AttributeBag> {
    read_rows("data/employees.json")
}

pub fn publication_rows() -> Vec<AttributeBag> {
    read_rows("data/publications.json")
}

/// A single formula document under `formulas/`.
pub fn formula(name: &str) -> Formula {
    parse_formula_document(&read_fixture(&format!("formulas/{name}")))
        .unwrap_or_else(|e| panic!("Invalid formula fixture {name}: {e}"))
}

/// A computed-field map under `formulas/`.
pub fn formulas(name: &str) -> ComputableFields {
    parse_computable_fields(&read_fixture(&format!("formulas/{name}")))
        .unwrap_or_else(|e| panic!("Invalid computed-field fixture {name}: {e}"))
}

/// Policies read from fixture files, JSON or KDL.
pub fn policies(paths: &[&str]) -> Vec<Policy> {
    let mut loaded = Vec::new();
    for path in paths {
        let path = format!("policies/{path}");
        let raw = read_fixture(&path);
        if path.ends_with(".kdl") {
            for entry in parse_kdl_document(&raw).expect("Invalid KDL fixture") {
                loaded.push(entry.unwrap_or_else(|e| panic!("Invalid policy in {path}: {e}")));
            }
        } else {
            loaded.push(
                serde_json::from_str(&raw).unwrap_or_else(|e| panic!("Invalid policy {path}: {e}")),
            );
        }
    }
    loaded
}

/// Policy source swapped per test, with an evaluator over it.
///
/// Starts empty, so every action is denied until a test grants it.
pub struct PolicyHarness {
    source: Arc<MemoryPolicySource>,
    evaluator: PermissionEvaluator,
}

impl PolicyHarness {
    pub fn new() -> Self {
        let source = Arc::new(MemoryPolicySource::new());
        let evaluator = PermissionEvaluator::new(source.clone());
        Self { source, evaluator }
    }

    pub fn evaluator(&self) -> &PermissionEvaluator {
        &self.evaluator
    }

    pub fn set_universal_policies(&self, paths: &[&str]) {
        self.source.set_universal_policies(policies(paths));
        self.evaluator.evict();
    }

    pub fn set_action_policies(&self, action_id: &str, paths: &[&str]) {
        self.source.set_action_policies(action_id, policies(paths));
        self.evaluator.evict();
    }

    pub fn set_entity_policies(&self, effect: ActionEffect, entity: TableEntityId, paths: &[&str]) {
        self.source.set_entity_policies(effect, entity, policies(paths));
        self.evaluator.evict();
    }

    pub fn reset(&self) {
        self.source.clear();
        self.evaluator.evict();
    }
}

impl Default for PolicyHarness {
    fn default() -> Self {
        Self::new()
    }
}
