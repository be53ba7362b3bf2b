use crate::abac::{
    AbacError, AccessRequest, ActionEffect, FilterableEntity, PermissionEvaluator, RowWrite,
    Subject, TableEntityId,
};
use crate::errors::RowguardError;
use crate::formula::{AttributeBag, FieldDef, Value};
use std::sync::{Mutex, PoisonError};

/// Rows held in memory. Every write authorizes and mutates under one lock.
#[derive(Debug)]
pub struct MemoryTable {
    entity: TableEntityId,
    fields: Option<&'static [FieldDef]>,
    rows: Mutex<Vec<AttributeBag>>,
}

impl MemoryTable {
    pub fn new(entity: TableEntityId) -> Self {
        Self {
            entity,
            fields: None,
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Table typed after `E`, so conditions are checked against its fields.
    pub fn for_entity<E: FilterableEntity>() -> Self {
        Self {
            fields: Some(E::fields()),
            ..Self::new(E::table_entity())
        }
    }

    pub fn with_rows(self, rows: impl IntoIterator<Item = AttributeBag>) -> Self {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(rows);
        self
    }

    pub fn entity(&self) -> &TableEntityId {
        &self.entity
    }

    pub fn request<'a>(&self, action_id: &'a str, subject: &'a Subject) -> AccessRequest<'a> {
        AccessRequest {
            fields: self.fields,
            ..AccessRequest::new(action_id, self.entity.clone(), subject)
        }
    }

    /// Copy of every stored row, unfiltered.
    pub fn snapshot(&self) -> Vec<AttributeBag> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows visible under `request`, masked.
    pub fn fetch_visible(
        &self,
        evaluator: &PermissionEvaluator,
        request: &AccessRequest<'_>,
    ) -> Result<Vec<AttributeBag>, RowguardError> {
        let rows = self.snapshot();
        evaluator.with_authorization(request, ActionEffect::Read, |grant| {
            Ok(grant.filter_rows(&rows)?)
        })
    }

    /// Insert `row`, assigning a fresh id when it has none.
    pub fn create(
        &self,
        evaluator: &PermissionEvaluator,
        request: &AccessRequest<'_>,
        mut row: AttributeBag,
    ) -> Result<AttributeBag, RowguardError> {
        if row.get("id").map_or(true, Value::is_null) {
            row.insert("id", uuid::Uuid::new_v4().to_string());
        }
        let grant = evaluator.authorize(request, ActionEffect::Write)?;
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if position(&rows, &row_id(&row)).is_some() {
            return Err(RowguardError::BadRequest(format!(
                "record `{}` already exists",
                row_id(&row)
            )));
        }
        grant.authorize_write(&RowWrite::Create { after: row.clone() }, &rows)?;
        rows.push(row.clone());
        Ok(row)
    }

    /// Merge `patch` into the row `id`.
    pub fn update(
        &self,
        evaluator: &PermissionEvaluator,
        request: &AccessRequest<'_>,
        id: &str,
        patch: &AttributeBag,
    ) -> Result<AttributeBag, RowguardError> {
        if patch.get("id").is_some_and(|v| v.as_str() != Some(id)) {
            return Err(RowguardError::BadRequest("the id of a record cannot change".into()));
        }
        let grant = evaluator.authorize(request, ActionEffect::Write)?;
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let index = self.locate(&rows, id)?;
        let before = rows[index].clone();
        let merged = before.merged(patch);
        let write = RowWrite::Update {
            before,
            after: patch.clone(),
        };
        grant.authorize_write(&write, &rows)?;
        rows[index] = merged.clone();
        Ok(merged)
    }

    pub fn delete(
        &self,
        evaluator: &PermissionEvaluator,
        request: &AccessRequest<'_>,
        id: &str,
    ) -> Result<AttributeBag, RowguardError> {
        let grant = evaluator.authorize(request, ActionEffect::Write)?;
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let index = self.locate(&rows, id)?;
        let write = RowWrite::Delete {
            before: rows[index].clone(),
        };
        grant.authorize_write(&write, &rows)?;
        Ok(rows.remove(index))
    }

    fn locate(&self, rows: &[AttributeBag], id: &str) -> Result<usize, AbacError> {
        position(rows, id).ok_or_else(|| AbacError::NotFound {
            entity_id: self.entity.to_string(),
            record_id: id.to_string(),
        })
    }
}

fn row_id(row: &AttributeBag) -> String {
    match row.get("id") {
        Some(Value::Str(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn position(rows: &[AttributeBag], id: &str) -> Option<usize> {
    rows.iter().position(|row| row_id(row) == id)
}
