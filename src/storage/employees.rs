use crate::abac::{AccessRequest, PermissionEvaluator, Subject};
use crate::entities::employee::{self, Model as Employee};
use crate::errors::RowguardError;
use crate::formula::{AttributeBag, Formula};
use crate::storage::{fetch_visible, find_visible, guarded_delete, guarded_insert, guarded_update};
use sea_orm::DatabaseConnection;

/// Employees visible to `subject` under `action_id`, optionally narrowed by `filter`.
pub async fn list_employees(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    filter: Option<&Formula>,
) -> Result<Vec<Employee>, RowguardError> {
    let request = AccessRequest::for_entity::<Employee>(action_id, subject).with_filter(filter);
    let grant = evaluator.authorize_read(&request)?;
    fetch_visible::<employee::Entity, _>(db, &grant).await
}

pub async fn get_employee(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
) -> Result<Employee, RowguardError> {
    let request = AccessRequest::for_entity::<Employee>(action_id, subject);
    let grant = evaluator.authorize_read(&request)?;
    find_visible::<employee::Entity, _>(db, grant, id).await
}

/// Create an employee. An empty id is replaced with a fresh one.
pub async fn create_employee(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    mut employee: Employee,
) -> Result<Employee, RowguardError> {
    if employee.id.is_empty() {
        employee.id = uuid::Uuid::new_v4().to_string();
    }
    let request = AccessRequest::for_entity::<Employee>(action_id, subject);
    guarded_insert::<employee::Entity>(db, evaluator, &request, employee).await
}

pub async fn update_employee(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
    patch: &AttributeBag,
) -> Result<Employee, RowguardError> {
    let request = AccessRequest::for_entity::<Employee>(action_id, subject);
    guarded_update::<employee::Entity>(db, evaluator, &request, id, patch, Employee::from_attributes).await
}

pub async fn set_salary(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
    salary: i64,
) -> Result<Employee, RowguardError> {
    let patch = AttributeBag::new().with("salary", salary);
    update_employee(db, evaluator, subject, action_id, id, &patch).await
}

pub async fn delete_employee(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
) -> Result<(), RowguardError> {
    let request = AccessRequest::for_entity::<Employee>(action_id, subject);
    guarded_delete::<employee::Entity>(db, evaluator, &request, id, Employee::from_attributes).await
}
