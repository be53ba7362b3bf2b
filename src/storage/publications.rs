use crate::abac::{AccessRequest, PermissionEvaluator, Subject};
use crate::entities::publication::{self, Model as Publication};
use crate::errors::RowguardError;
use crate::formula::{AttributeBag, Formula};
use crate::storage::{fetch_visible, find_visible, guarded_delete, guarded_insert, guarded_update};
use chrono::NaiveDate;
use sea_orm::DatabaseConnection;

pub async fn list_publications(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    filter: Option<&Formula>,
) -> Result<Vec<Publication>, RowguardError> {
    let request = AccessRequest::for_entity::<Publication>(action_id, subject).with_filter(filter);
    let grant = evaluator.authorize_read(&request)?;
    fetch_visible::<publication::Entity, _>(db, &grant).await
}

pub async fn get_publication(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
) -> Result<Publication, RowguardError> {
    let request = AccessRequest::for_entity::<Publication>(action_id, subject);
    let grant = evaluator.authorize_read(&request)?;
    find_visible::<publication::Entity, _>(db, grant, id).await
}

/// Create a publication. An empty id is replaced with a fresh one.
pub async fn create_publication(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    mut publication: Publication,
) -> Result<Publication, RowguardError> {
    if publication.id.is_empty() {
        publication.id = uuid::Uuid::new_v4().to_string();
    }
    let request = AccessRequest::for_entity::<Publication>(action_id, subject);
    guarded_insert::<publication::Entity>(db, evaluator, &request, publication).await
}

pub async fn update_publication(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
    patch: &AttributeBag,
) -> Result<Publication, RowguardError> {
    let request = AccessRequest::for_entity::<Publication>(action_id, subject);
    guarded_update::<publication::Entity>(db, evaluator, &request, id, patch, Publication::from_attributes)
        .await
}

/// Move a publication to `date`. Cross-row policies, such as one
/// publication per theme and day, are checked against the stored rows.
pub async fn set_publication_date(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
    date: NaiveDate,
) -> Result<Publication, RowguardError> {
    let patch = AttributeBag::new().with("publication_date", date);
    update_publication(db, evaluator, subject, action_id, id, &patch).await
}

pub async fn delete_publication(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    subject: &Subject,
    action_id: &str,
    id: &str,
) -> Result<(), RowguardError> {
    let request = AccessRequest::for_entity::<Publication>(action_id, subject);
    guarded_delete::<publication::Entity>(db, evaluator, &request, id, Publication::from_attributes)
        .await
}
