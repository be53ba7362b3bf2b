//! Demo tables governed by the access policies.

pub mod employee;
pub mod publication;

pub use employee::Entity as Employee;
pub use publication::Entity as Publication;

use crate::errors::RowguardError;
use crate::formula::{AttributeBag, Value};

pub const SERVICE: &str = "abac-demo";
pub const SCHEMA: &str = "abac_demo";

fn required_text(bag: &AttributeBag, entity: &str, field: &str) -> Result<String, RowguardError> {
    optional_text(bag, entity, field)?
        .ok_or_else(|| RowguardError::invalid_row(entity, format!("`{field}` is required")))
}

fn optional_text(bag: &AttributeBag, entity: &str, field: &str) -> Result<Option<String>, RowguardError> {
    match bag.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.clone())),
        Some(other) => Err(RowguardError::invalid_row(
            entity,
            format!("`{field}` must be a string, got {}", other.kind()),
        )),
    }
}

/// List attributes are stored as JSON-encoded string arrays.
fn encoded_list(bag: &AttributeBag, entity: &str, field: &str) -> Result<String, RowguardError> {
    let items = match bag.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::List(items)) => items
            .iter()
            .map(|item| match item {
                Value::Str(s) => Ok(s.clone()),
                other => Err(RowguardError::invalid_row(
                    entity,
                    format!("`{field}` must hold strings, got {}", other.kind()),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(RowguardError::invalid_row(
                entity,
                format!("`{field}` must be a list, got {}", other.kind()),
            ))
        }
    };
    Ok(serde_json::to_string(&items)?)
}

fn decoded_list(raw: &str) -> Value {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(items) => Value::from(items),
        Err(e) => {
            tracing::warn!(error = %e, "stored list column is not a JSON string array");
            Value::Null
        }
    }
}
