mod helpers;

use helpers::{user, PolicyHarness, TestDb, ACCOUNTANT, ADMIN, CHIEF_EDITOR, JOURNALIST};
use rowguard::abac::{AbacError, ActionEffect, FilterableEntity};
use rowguard::entities::employee::Model as Employee;
use rowguard::errors::RowguardError;
use rowguard::formula::AttributeBag;
use rowguard::storage::employees::{
    create_employee, delete_employee, list_employees, set_salary, update_employee,
};

const LIST: &str = "abac-demo.EmployeeService.fetchAll";
const CREATE: &str = "abac-demo.EmployeeService.create";
const UPDATE: &str = "abac-demo.EmployeeService.update";
const DELETE: &str = "abac-demo.EmployeeService.delete";

const NY_EMPLOYEE: &str = "00000000-0000-0000-0000-000000000003";
const LA_EMPLOYEE: &str = "00000000-0000-0000-0000-000000000005";

fn new_employee(branch: &str, salary: i64) -> Employee {
    Employee {
        id: String::new(),
        name: "Helen".to_string(),
        branch: branch.to_string(),
        roles: r#"["journalist"]"#.to_string(),
        skills: r#"["Sports"]"#.to_string(),
        passport: None,
        salary: Some(salary),
    }
}

fn assert_write_denied(err: RowguardError, verb: &str, action: &str) {
    let message = err.to_string();
    assert!(
        matches!(err, RowguardError::Access(AbacError::WriteDenied { .. })),
        "expected a write denial, got {message}"
    );
    assert!(message.starts_with(&format!("{verb} of the record ")), "{message}");
    assert!(
        message.ends_with(&format!("by action {action} is forbidden in current context.")),
        "{message}"
    );
}

#[tokio::test]
async fn test_action_access_denied_by_default() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    let journalist = user(JOURNALIST);

    let err = list_employees(db.connection(), policies.evaluator(), &journalist, LIST, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RowguardError::Access(AbacError::ActionDenied { .. })));
}

#[tokio::test]
async fn test_data_access_denied_by_default() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_universal_policies(&["universal/adminActionPolicy.json"]);
    let admin = user(ADMIN);

    let employees = list_employees(db.connection(), policies.evaluator(), &admin, LIST, None)
        .await
        .unwrap();
    assert!(employees.is_empty());
}

#[tokio::test]
async fn test_admin_can_read_all_entries() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_universal_policies(&[
        "universal/adminActionPolicy.json",
        "universal/adminDataPolicy.json",
    ]);
    let admin = user(ADMIN);

    let employees = list_employees(db.connection(), policies.evaluator(), &admin, LIST, None)
        .await
        .unwrap();
    assert_eq!(employees.len(), 5);
    assert!(employees.iter().all(|e| e.passport.is_some()));
}

#[tokio::test]
async fn test_editor_reads_own_branch_without_passports() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Read,
        Employee::table_entity(),
        &["employee/editorEmployeeReadPolicy.json"],
    );
    let editor = user(CHIEF_EDITOR);

    let employees = list_employees(db.connection(), policies.evaluator(), &editor, LIST, None)
        .await
        .unwrap();
    assert_eq!(employees.len(), 2);
    assert!(employees.iter().all(|e| e.branch == "LA"));

    // hidden
    assert!(employees.iter().all(|e| e.passport.is_none()));

    // visible
    for employee in &employees {
        assert!(!employee.id.is_empty());
        assert!(!employee.name.is_empty());
        assert!(!employee.attributes().get("roles").unwrap().as_list().unwrap().is_empty());
        assert!(!employee.attributes().get("skills").unwrap().as_list().unwrap().is_empty());
        assert!(employee.salary.is_some());
    }
}

#[tokio::test]
async fn test_editor_cannot_add_employee_to_other_branch() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Write,
        Employee::table_entity(),
        &["employee/editorEmployeeWritePolicy.json"],
    );
    let editor = user(CHIEF_EDITOR);

    let err = create_employee(
        db.connection(),
        policies.evaluator(),
        &editor,
        CREATE,
        new_employee("NY", 120000),
    )
    .await
    .unwrap_err();
    assert_write_denied(err, "Creation", CREATE);
}

#[tokio::test]
async fn test_editor_cannot_add_employee_with_too_high_salary() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Write,
        Employee::table_entity(),
        &["employee/editorEmployeeWritePolicy.json"],
    );
    let editor = user(CHIEF_EDITOR);

    let err = create_employee(
        db.connection(),
        policies.evaluator(),
        &editor,
        CREATE,
        new_employee("LA", 140000),
    )
    .await
    .unwrap_err();
    assert_write_denied(err, "Creation", CREATE);
}

#[tokio::test]
async fn test_editor_can_add_and_raise_within_limit() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Write,
        Employee::table_entity(),
        &["employee/editorEmployeeWritePolicy.json"],
    );
    let editor = user(CHIEF_EDITOR);

    let created = create_employee(
        db.connection(),
        policies.evaluator(),
        &editor,
        CREATE,
        new_employee("LA", 120000),
    )
    .await
    .unwrap();
    assert!(!created.id.is_empty());
    assert_eq!(created.branch, "LA");
    assert_eq!(created.name, "Helen");
    assert_eq!(created.salary, Some(120000));

    let err = set_salary(db.connection(), policies.evaluator(), &editor, UPDATE, &created.id, 140000)
        .await
        .unwrap_err();
    assert_write_denied(err, "Update", UPDATE);

    let updated = set_salary(db.connection(), policies.evaluator(), &editor, UPDATE, &created.id, 130000)
        .await
        .unwrap();
    assert_eq!(updated.branch, "LA");
    assert_eq!(updated.name, "Helen");
    assert_eq!(updated.salary, Some(130000));
}

#[tokio::test]
async fn test_editor_can_delete_only_in_own_branch() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Read,
        Employee::table_entity(),
        &["employee/editorEmployeeReadPolicy.json"],
    );
    policies.set_entity_policies(
        ActionEffect::Write,
        Employee::table_entity(),
        &["employee/editorEmployeeWritePolicy.json"],
    );
    let editor = user(CHIEF_EDITOR);

    let employees = list_employees(db.connection(), policies.evaluator(), &editor, LIST, None)
        .await
        .unwrap();
    assert_eq!(employees.len(), 2);
    assert!(employees.iter().any(|e| e.id == LA_EMPLOYEE));

    let err = delete_employee(db.connection(), policies.evaluator(), &editor, DELETE, NY_EMPLOYEE)
        .await
        .unwrap_err();
    assert_write_denied(err, "Deletion", DELETE);

    delete_employee(db.connection(), policies.evaluator(), &editor, DELETE, LA_EMPLOYEE)
        .await
        .unwrap();

    let remaining = list_employees(db.connection(), policies.evaluator(), &editor, LIST, None)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.iter().all(|e| e.id != LA_EMPLOYEE));
}

#[tokio::test]
async fn test_accountant_reads_all_without_roles_and_skills() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Read,
        Employee::table_entity(),
        &["employee/accountantEmployeeReadPolicy.json"],
    );
    let accountant = user(ACCOUNTANT);

    let employees = list_employees(db.connection(), policies.evaluator(), &accountant, LIST, None)
        .await
        .unwrap();
    assert_eq!(employees.len(), 5);

    for employee in &employees {
        let attrs = employee.attributes();
        assert!(attrs.get("roles").unwrap().as_list().unwrap().is_empty());
        assert!(attrs.get("skills").unwrap().as_list().unwrap().is_empty());
        assert!(!employee.id.is_empty());
        assert!(!employee.name.is_empty());
        assert!(!employee.branch.is_empty());
        assert!(employee.passport.is_some());
        assert!(employee.salary.is_some());
    }
}

#[tokio::test]
async fn test_accountant_cannot_update_or_delete() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    policies.set_entity_policies(
        ActionEffect::Read,
        Employee::table_entity(),
        &["employee/accountantEmployeeReadPolicy.json"],
    );
    let accountant = user(ACCOUNTANT);

    let employees = list_employees(db.connection(), policies.evaluator(), &accountant, LIST, None)
        .await
        .unwrap();
    let patch = AttributeBag::new()
        .with("branch", "LA")
        .with("name", "Helen")
        .with("salary", 120000);

    for employee in &employees {
        let err = update_employee(
            db.connection(),
            policies.evaluator(),
            &accountant,
            UPDATE,
            &employee.id,
            &patch,
        )
        .await
        .unwrap_err();
        assert!(err.is_access_denied(), "{err}");

        let err = delete_employee(db.connection(), policies.evaluator(), &accountant, DELETE, &employee.id)
            .await
            .unwrap_err();
        assert!(err.is_access_denied(), "{err}");
    }
}

#[tokio::test]
async fn test_policy_cache_is_evicted_on_change() {
    let db = TestDb::with_employees().await;
    let policies = PolicyHarness::new();
    let admin = user(ADMIN);

    assert!(list_employees(db.connection(), policies.evaluator(), &admin, LIST, None)
        .await
        .is_err());

    policies.set_universal_policies(&[
        "universal/adminActionPolicy.json",
        "universal/adminDataPolicy.json",
    ]);
    let employees = list_employees(db.connection(), policies.evaluator(), &admin, LIST, None)
        .await
        .unwrap();
    assert_eq!(employees.len(), 5);

    policies.reset();
    assert!(list_employees(db.connection(), policies.evaluator(), &admin, LIST, None)
        .await
        .is_err());
}
