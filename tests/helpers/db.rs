use sea_orm::DatabaseConnection;
use tempfile::NamedTempFile;
use trackgate::settings::Database as DbCfg;
use trackgate::storage;

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
        let cfg = DbCfg {
            url: format!("sqlite://{}?mode=rwc", db_path),
        };

        // Connect and run migrations
        let connection = storage::init(&cfg)
            .await
            .expect("Failed to initialize test database");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Password every seeded user gets
pub const TEST_PASSWORD: &str = "password123";

/// Create a test user for testing
pub async fn seed_user(db: &DatabaseConnection, username: &str, is_admin: bool) -> storage::User {
    storage::create_user(db, username, TEST_PASSWORD, is_admin)
        .await
        .expect("Failed to create test user")
}
