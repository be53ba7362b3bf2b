use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::abac::errors::AbacError;
use crate::abac::policy::{parse_kdl_document, PolicyEntry};
use crate::abac::source::{MemoryPolicySource, PolicySource};
use crate::abac::types::{ActionEffect, Policy, TableEntityId};

/// A policy or file that was left out of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPolicy {
    pub path: String,
    pub policy: Option<String>,
    pub reason: String,
}

/// Outcome of loading a policy directory.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub files: usize,
    pub policies: Vec<Policy>,
    pub skipped: Vec<SkippedPolicy>,
}

/// Load all `.json` and `.kdl` policy files from `dir`, in file name order.
///
/// Invalid policies are skipped and reported; they never fail the load.
/// A JSON file holds one policy object or an array of them.
pub fn load_policies(dir: &Path) -> Result<LoadReport, AbacError> {
    if !dir.is_dir() {
        return Err(AbacError::PolicyLoadError {
            path: dir.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "policies directory does not exist or is not a directory",
            ),
        });
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext == "json" || ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort();

    let mut report = LoadReport::default();
    let mut seen = HashSet::new();

    for path in entries {
        let shown = path.display().to_string();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AbacError::PolicyLoadError {
                path: shown.clone(),
                source,
            })?;
        report.files += 1;

        let parsed = if path.extension().is_some_and(|ext| ext == "kdl") {
            parse_kdl_document(&contents)
        } else {
            parse_json_document(&shown, &contents)
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(path = %shown, error = %e, "skipping unreadable policy file");
                report.skipped.push(SkippedPolicy {
                    path: shown,
                    policy: None,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        for entry in parsed {
            match entry {
                Ok(policy) if !seen.insert(policy.id.clone()) => {
                    tracing::warn!(path = %shown, policy = %policy.id, "skipping duplicate policy id");
                    report.skipped.push(SkippedPolicy {
                        path: shown.clone(),
                        policy: Some(policy.id),
                        reason: "duplicate policy id".to_string(),
                    });
                }
                Ok(policy) => report.policies.push(policy),
                Err(e) => {
                    tracing::warn!(path = %shown, error = %e, "skipping invalid policy");
                    report.skipped.push(SkippedPolicy {
                        path: shown.clone(),
                        policy: policy_name(&e),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    tracing::info!(
        files = report.files,
        policies = report.policies.len(),
        skipped = report.skipped.len(),
        "Loaded access policies"
    );

    Ok(report)
}

fn parse_json_document(path: &str, contents: &str) -> Result<Vec<PolicyEntry>, AbacError> {
    let json: serde_json::Value =
        serde_json::from_str(contents).map_err(|source| AbacError::PolicyDocument {
            path: path.to_string(),
            source,
        })?;
    let items = match json {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    Ok(items
        .into_iter()
        .map(|item| {
            let id = item
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("<unnamed>")
                .to_string();
            serde_json::from_value::<Policy>(item)
                .map_err(|e| AbacError::configuration(id, e.to_string()))
        })
        .collect())
}

fn policy_name(error: &AbacError) -> Option<String> {
    match error {
        AbacError::PolicyConfiguration { policy, .. } => Some(policy.clone()),
        _ => None,
    }
}

/// Policies read from a directory, reloadable at runtime.
///
/// After `reload`, evict the evaluator's cache so new sets are resolved.
#[derive(Debug)]
pub struct DirectoryPolicySource {
    dir: PathBuf,
    policies: MemoryPolicySource,
}

impl DirectoryPolicySource {
    pub fn open(dir: impl Into<PathBuf>) -> Result<(Self, LoadReport), AbacError> {
        let source = Self {
            dir: dir.into(),
            policies: MemoryPolicySource::new(),
        };
        let report = source.reload()?;
        Ok((source, report))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read the directory. On error the previous policies stay in place.
    pub fn reload(&self) -> Result<LoadReport, AbacError> {
        let report = load_policies(&self.dir)?;
        self.policies.replace_all(report.policies.iter().cloned());
        Ok(report)
    }
}

impl PolicySource for DirectoryPolicySource {
    fn universal_policies(&self) -> Result<Vec<Policy>, AbacError> {
        self.policies.universal_policies()
    }

    fn action_policies(&self, action_id: &str) -> Result<Vec<Policy>, AbacError> {
        self.policies.action_policies(action_id)
    }

    fn entity_policies(
        &self,
        effect: ActionEffect,
        entity: &TableEntityId,
    ) -> Result<Vec<Policy>, AbacError> {
        self.policies.entity_policies(effect, entity)
    }
}
