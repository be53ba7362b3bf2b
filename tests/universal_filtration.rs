mod helpers;

use chrono::NaiveDate;
use helpers::{formula, user, PolicyHarness, TestDb, ADMIN, CHIEF_EDITOR};
use rowguard::abac::{ActionEffect, FilterableEntity};
use rowguard::entities::publication::Model as Publication;
use rowguard::formula::parse_formula;
use rowguard::storage::publications::list_publications;

const LIST: &str = "abac-demo.PublicationService.fetchAllByFilter";

fn admin_policies() -> PolicyHarness {
    let policies = PolicyHarness::new();
    policies.set_universal_policies(&[
        "universal/adminActionPolicy.json",
        "universal/adminDataPolicy.json",
    ]);
    policies
}

#[tokio::test]
async fn test_filter_by_theme_and_status() {
    let db = TestDb::with_publications().await;
    let policies = admin_policies();
    let admin = user(ADMIN);
    let filter = formula("themeAndStatusFilter.json");

    let publications = list_publications(db.connection(), policies.evaluator(), &admin, LIST, Some(&filter))
        .await
        .unwrap();
    assert_eq!(publications.len(), 3);
}

#[tokio::test]
async fn test_filter_by_user_branch_and_past_date() {
    let db = TestDb::with_publications().await;
    let policies = admin_policies();
    let admin = user(ADMIN);
    let filter = formula("userBranchAndPublicationDateFilter.json");

    let publications = list_publications(db.connection(), policies.evaluator(), &admin, LIST, Some(&filter))
        .await
        .unwrap();
    assert_eq!(publications.len(), 2);
    assert!(publications.iter().all(|p| p.branch == "NY"));
    assert!(publications
        .iter()
        .all(|p| p.publication_date == NaiveDate::from_ymd_opt(2023, 5, 25)));
}

#[tokio::test]
async fn test_filter_cannot_widen_access() {
    let db = TestDb::with_publications().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Read,
        Publication::table_entity(),
        &["publication/editorPublicationReadPolicy.json"],
    );
    let editor = user(CHIEF_EDITOR);

    let filter = parse_formula(r#"entity.branch == "NY" || true"#).unwrap();
    let publications = list_publications(db.connection(), policies.evaluator(), &editor, LIST, Some(&filter))
        .await
        .unwrap();
    assert_eq!(publications.len(), 3);
    assert!(publications.iter().all(|p| p.branch == "LA"));
}

#[tokio::test]
async fn test_ill_typed_filter_is_rejected() {
    let db = TestDb::with_publications().await;
    let policies = admin_policies();
    let admin = user(ADMIN);

    let filter = parse_formula("entity.theme > 5").unwrap();
    let err = list_publications(db.connection(), policies.evaluator(), &admin, LIST, Some(&filter))
        .await
        .unwrap_err();
    assert!(!err.is_access_denied());
}
