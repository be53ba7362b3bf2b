use migration::{Migrator, MigratorTrait};
use rowguard::entities::{employee, publication};
use rowguard::formula::AttributeBag;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, IntoActiveModel};
use tempfile::NamedTempFile;

use super::fixtures::{employee_rows, publication_rows};

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
        Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Database holding the five demo employees
    pub async fn with_employees() -> Self {
        let db = Self::new().await;
        seed_employees(db.connection()).await;
        db
    }

    /// Database holding the demo employees and publications
    pub async fn with_publications() -> Self {
        let db = Self::with_employees().await;
        seed_publications(db.connection()).await;
        db
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Insert the employee fixture rows, bypassing access control
pub async fn seed_employees(db: &DatabaseConnection) {
    for row in employee_rows() {
        insert_employee(db, &row).await;
    }
}

/// Insert the publication fixture rows, bypassing access control
pub async fn seed_publications(db: &DatabaseConnection) {
    for row in publication_rows() {
        let model = publication::Model::from_attributes(&row).expect("Invalid publication fixture");
        model
            .into_active_model()
            .reset_all()
            .insert(db)
            .await
            .expect("Failed to seed publication");
    }
}

async fn insert_employee(db: &DatabaseConnection, row: &AttributeBag) {
    let model = employee::Model::from_attributes(row).expect("Invalid employee fixture");
    model
        .into_active_model()
        .reset_all()
        .insert(db)
        .await
        .expect("Failed to seed employee");
}
