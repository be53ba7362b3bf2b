//! SQL push-down and in-memory filtering must select the same rows.

mod helpers;

use helpers::{publication_rows, user, TestDb, CHIEF_EDITOR, JOURNALIST};
use rowguard::abac::{
    ActionEffect, Effect, FilterableEntity, MemoryPolicySource, PermissionEvaluator, Policy,
    Subject,
};
use rowguard::entities::publication::Model as Publication;
use rowguard::formula::{parse_formula, AttributeBag, Value};
use rowguard::storage::publications::list_publications;
use rowguard::storage::MemoryTable;
use std::sync::Arc;

const LIST: &str = "abac-demo.PublicationService.fetchAll";

const CONDITIONS: &[&str] = &[
    "entity.branch == user.branch",
    r#"entity.theme in ["Education", "Politics"] || entity.status == "Published""#,
    r#"entity.publication_date < date("2023-06-01")"#,
    "entity.publication_date == null",
    r#"!(entity.publication_date > date("2023-06-01"))"#,
    r#"entity.publication_date != date("2023-05-25")"#,
    "entity.theme in user.skills && entity.author_id != user.id",
    "exists(entity.theme == outer.theme && entity.id != outer.id)",
    "count(by entity.branch) >= 3",
    "count(entity.publication_date by entity.branch) == 1",
    "size(user.skills) > 1 && entity.branch == \"NY\"",
    // no SQL form, filtered in memory
    "size(entity.title) > 20",
];

fn evaluator(condition: &str) -> PermissionEvaluator {
    let policy = Policy::entity(
        "under_test",
        Effect::Allow,
        ActionEffect::Read,
        Publication::table_entity(),
        parse_formula(condition).unwrap(),
    );
    PermissionEvaluator::new(Arc::new(MemoryPolicySource::from_policies([policy])))
}

/// Fixture rows with the column types the database hands back.
fn typed_rows() -> Vec<AttributeBag> {
    publication_rows()
        .iter()
        .map(|row| Publication::from_attributes(row).unwrap().attributes())
        .collect()
}

fn ids(rows: impl IntoIterator<Item = AttributeBag>) -> Vec<String> {
    let mut ids: Vec<String> = rows
        .into_iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
        .collect();
    ids.sort();
    ids
}

async fn check(db: &TestDb, subject: &Subject, condition: &str) {
    let eval = evaluator(condition);

    let pushed = list_publications(db.connection(), &eval, subject, LIST, None)
        .await
        .unwrap_or_else(|e| panic!("`{condition}` failed against the database: {e}"));
    let pushed = ids(pushed.iter().map(FilterableEntity::attributes));

    let table = MemoryTable::for_entity::<Publication>().with_rows(typed_rows());
    let in_memory = table
        .fetch_visible(&eval, &table.request(LIST, subject))
        .unwrap_or_else(|e| panic!("`{condition}` failed in memory: {e}"));

    assert_eq!(pushed, ids(in_memory), "`{condition}` selects different rows");
}

#[tokio::test]
async fn test_pushdown_matches_in_memory_filtering() {
    let db = TestDb::with_publications().await;
    for subject in [user(CHIEF_EDITOR), user(JOURNALIST)] {
        for condition in CONDITIONS {
            check(&db, &subject, condition).await;
        }
    }
}

#[tokio::test]
async fn test_null_dates_never_match_comparisons() {
    let db = TestDb::with_publications().await;
    let subject = user(CHIEF_EDITOR);
    let eval = evaluator(r#"!(entity.publication_date > date("2023-06-01"))"#);

    let rows = list_publications(db.connection(), &eval, &subject, LIST, None)
        .await
        .unwrap();
    assert!(rows.iter().all(|p| p.publication_date.is_some()));
    assert_eq!(rows.len(), 2);
}
