//! Row stores that enforce grants.
//!
//! SQL reads push the compiled condition into the `WHERE` clause and fall
//! back to in-memory filtering when it has no SQL form. Writes take the
//! stored rows, authorize and mutate inside one transaction.

pub mod employees;
pub mod memory;
pub mod publications;

pub use memory::MemoryTable;

use crate::abac::{AbacError, AccessRequest, ActionEffect, FilterableEntity, Grant, PermissionEvaluator, RowWrite};
use crate::errors::RowguardError;
use crate::formula::{AttributeBag, BinaryOp, Formula, FormulaError, Scope};
use crate::settings::Database as DbCfg;
use migration::MigratorTrait;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ConnectionTrait, Database, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, EntityTrait, IntoActiveModel, IsolationLevel,
    QueryFilter, TransactionTrait,
};

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, RowguardError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Apply all pending migrations.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), RowguardError> {
    migration::Migrator::up(db, None).await?;
    Ok(())
}

/// Rows of `E` the grant makes visible, masked.
pub async fn fetch_visible<E, C>(db: &C, grant: &Grant) -> Result<Vec<E::Model>, RowguardError>
where
    E: EntityTrait,
    E::Model: FilterableEntity,
    C: ConnectionTrait,
{
    let condition = grant.condition();
    if condition.is_always_false() {
        return Ok(Vec::new());
    }
    let table = E::default().table_name().to_string();

    let (mut rows, siblings) = match condition.to_condition(&table) {
        Ok(pushed) => {
            let rows = E::find().filter(pushed).all(db).await?;
            let siblings = if grant.needs_siblings() {
                load_attributes::<E, C>(db).await?
            } else {
                Vec::new()
            };
            (rows, siblings)
        }
        Err(FormulaError::NotTranslatable { node, reason }) => {
            tracing::debug!(%table, %node, %reason, "Filtering rows in memory");
            let all = E::find().all(db).await?;
            let siblings: Vec<AttributeBag> = all.iter().map(FilterableEntity::attributes).collect();
            let mut rows = Vec::new();
            for (model, attrs) in all.into_iter().zip(&siblings) {
                if condition.matches(attrs, &siblings)? {
                    rows.push(model);
                }
            }
            (rows, siblings)
        }
        Err(e) => return Err(e.into()),
    };

    for row in &mut rows {
        grant.project_entity(row, &siblings);
    }
    Ok(rows)
}

/// One visible row by id. Missing and hidden rows are both `NotFound`.
pub async fn find_visible<E, C>(db: &C, grant: Grant, id: &str) -> Result<E::Model, RowguardError>
where
    E: EntityTrait,
    E::Model: FilterableEntity,
    C: ConnectionTrait,
{
    let entity_id = grant.entity().to_string();
    let by_id = Formula::binary(
        BinaryOp::Eq,
        Formula::attr(Scope::Entity, "id"),
        Formula::literal(id),
    );
    let grant = grant.narrowed(&by_id)?;
    fetch_visible::<E, C>(db, &grant)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            AbacError::NotFound {
                entity_id,
                record_id: id.to_string(),
            }
            .into()
        })
}

/// Insert `model` if the WRITE policies allow creating it.
pub async fn guarded_insert<E>(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    request: &AccessRequest<'_>,
    model: E::Model,
) -> Result<E::Model, RowguardError>
where
    E: EntityTrait,
    E::Model: FilterableEntity + IntoActiveModel<E::ActiveModel>,
    E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
{
    let grant = evaluator.authorize(request, ActionEffect::Write)?;
    let txn = begin(db).await?;
    let stored = E::find().all(&txn).await?;
    if stored.iter().any(|m| m.record_id() == model.record_id()) {
        return Err(RowguardError::BadRequest(format!(
            "record `{}` already exists",
            model.record_id()
        )));
    }
    let siblings: Vec<AttributeBag> = stored.iter().map(FilterableEntity::attributes).collect();
    grant.authorize_write(
        &RowWrite::Create {
            after: model.attributes(),
        },
        &siblings,
    )?;
    let inserted = model.into_active_model().reset_all().insert(&txn).await?;
    txn.commit().await?;
    tracing::debug!(action = %request.action_id, record = %inserted.record_id(), "Created record");
    Ok(inserted)
}

/// Apply `patch` to the stored row `id` if the WRITE policies allow it for
/// both the stored and the patched row.
pub async fn guarded_update<E>(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    request: &AccessRequest<'_>,
    id: &str,
    patch: &AttributeBag,
    rebuild: fn(&AttributeBag) -> Result<E::Model, RowguardError>,
) -> Result<E::Model, RowguardError>
where
    E: EntityTrait,
    E::Model: FilterableEntity + IntoActiveModel<E::ActiveModel>,
    E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
{
    if patch.get("id").is_some_and(|v| v.as_str() != Some(id)) {
        return Err(RowguardError::BadRequest("the id of a record cannot change".into()));
    }
    let grant = evaluator.authorize(request, ActionEffect::Write)?;
    let txn = begin(db).await?;
    let (before, siblings) = stored_row::<E>(&txn, request, id).await?;
    let after = rebuild(&before.merged(patch))?;
    grant.authorize_write(
        &RowWrite::Update {
            before,
            after: after.attributes(),
        },
        &siblings,
    )?;
    let updated = after.into_active_model().reset_all().update(&txn).await?;
    txn.commit().await?;
    tracing::debug!(action = %request.action_id, record = %id, "Updated record");
    Ok(updated)
}

/// Delete the stored row `id` if the WRITE policies allow it.
pub async fn guarded_delete<E>(
    db: &DatabaseConnection,
    evaluator: &PermissionEvaluator,
    request: &AccessRequest<'_>,
    id: &str,
    rebuild: fn(&AttributeBag) -> Result<E::Model, RowguardError>,
) -> Result<(), RowguardError>
where
    E: EntityTrait,
    E::Model: FilterableEntity + IntoActiveModel<E::ActiveModel>,
    E::ActiveModel: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send,
{
    let grant = evaluator.authorize(request, ActionEffect::Write)?;
    let txn = begin(db).await?;
    let (before, siblings) = stored_row::<E>(&txn, request, id).await?;
    let model = rebuild(&before)?;
    grant.authorize_write(&RowWrite::Delete { before }, &siblings)?;
    model.into_active_model().delete(&txn).await?;
    txn.commit().await?;
    tracing::debug!(action = %request.action_id, record = %id, "Deleted record");
    Ok(())
}

async fn begin(db: &DatabaseConnection) -> Result<DatabaseTransaction, DbErr> {
    match db.get_database_backend() {
        DbBackend::Sqlite => db.begin().await,
        _ => {
            db.begin_with_config(Some(IsolationLevel::Serializable), None)
                .await
        }
    }
}

async fn load_attributes<E, C>(db: &C) -> Result<Vec<AttributeBag>, DbErr>
where
    E: EntityTrait,
    E::Model: FilterableEntity,
    C: ConnectionTrait,
{
    Ok(E::find()
        .all(db)
        .await?
        .iter()
        .map(FilterableEntity::attributes)
        .collect())
}

async fn stored_row<E>(
    txn: &DatabaseTransaction,
    request: &AccessRequest<'_>,
    id: &str,
) -> Result<(AttributeBag, Vec<AttributeBag>), RowguardError>
where
    E: EntityTrait,
    E::Model: FilterableEntity,
{
    let siblings = load_attributes::<E, _>(txn).await?;
    let before = siblings
        .iter()
        .find(|row| row.get("id").and_then(|v| v.as_str()) == Some(id))
        .cloned()
        .ok_or_else(|| AbacError::NotFound {
            entity_id: request.entity.to_string(),
            record_id: id.to_string(),
        })?;
    Ok((before, siblings))
}
