use std::{str::FromStr, time::Duration};

use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;

pub mod context;
pub mod schema;

pub use context::{CommitError, DataContext, EmployeeSet, EntityState};
pub use schema::{EmployeeQueryError, EmployeeRow};

/// Pool size used when the caller does not pick one.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Same as [`Database::connect`] with an explicit pool size.
    pub async fn connect_with(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`, creating the
    /// `employees` table.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Checks that the `employees` table carries every declared column and
    /// that the required ones are `NOT NULL`.
    pub async fn verify_employee_schema(&self) -> Result<(), StorageError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", schema::EMPLOYEES_TABLE))
            .fetch_all(&self.pool)
            .await?;

        let columns: Vec<(String, bool, bool)> = rows
            .iter()
            .map(|row| {
                let name: String = row.get("name");
                let not_null: i64 = row.get("notnull");
                let primary_key: i64 = row.get("pk");
                (name, not_null != 0, primary_key != 0)
            })
            .collect();

        for expected in schema::EMPLOYEE_COLUMNS {
            let Some((_, not_null, primary_key)) =
                columns.iter().find(|(name, _, _)| name == expected)
            else {
                return Err(StorageError::Schema(format!(
                    "column {}.{expected} is missing",
                    schema::EMPLOYEES_TABLE
                )));
            };

            if expected == schema::EMPLOYEE_KEY_COLUMN && !primary_key {
                return Err(StorageError::Schema(format!(
                    "column {}.{expected} is not the primary key",
                    schema::EMPLOYEES_TABLE
                )));
            }

            if schema::REQUIRED_EMPLOYEE_COLUMNS.contains(&expected) && !not_null {
                return Err(StorageError::Schema(format!(
                    "column {}.{expected} must be NOT NULL",
                    schema::EMPLOYEES_TABLE
                )));
            }
        }

        Ok(())
    }

    /// Opens a fresh persistence context with an empty change tracker.
    pub fn context(&self) -> DataContext {
        DataContext::new(self.pool.clone())
    }

    /// Round-trips a trivial query to confirm the pool can reach the database.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("unexpected database schema: {0}")]
    Schema(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn connect_temp() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("taskdesk.db").display());
        let db = Database::connect(&url).await.expect("connect");
        (dir, db)
    }

    #[tokio::test]
    async fn migrations_apply() {
        let (_dir, db) = connect_temp().await;
        db.run_migrations().await.expect("migrations");

        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'employees'",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables, 1, "expected employees table to be created");
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_dir, db) = connect_temp().await;
        db.run_migrations().await.expect("first run");
        db.run_migrations().await.expect("second run");
    }

    #[tokio::test]
    async fn migrated_schema_matches_declaration() {
        let (_dir, db) = connect_temp().await;
        db.run_migrations().await.expect("migrations");
        db.verify_employee_schema().await.expect("schema verified");
    }

    #[tokio::test]
    async fn schema_check_reports_nullable_column() {
        let (_dir, db) = connect_temp().await;
        sqlx::query(
            "CREATE TABLE employees (id TEXT PRIMARY KEY NOT NULL, first_name TEXT NOT NULL, \
             last_name TEXT NOT NULL, email TEXT, phone TEXT NOT NULL)",
        )
        .execute(db.pool())
        .await
        .expect("create table");

        let err = db.verify_employee_schema().await.unwrap_err();
        assert!(matches!(err, StorageError::Schema(detail) if detail.contains("email")));
    }

    #[tokio::test]
    async fn schema_check_reports_missing_table() {
        let (_dir, db) = connect_temp().await;
        let err = db.verify_employee_schema().await.unwrap_err();
        assert!(matches!(err, StorageError::Schema(detail) if detail.contains("employees.id")));
    }

    #[tokio::test]
    async fn null_required_column_is_a_not_null_violation() {
        let (_dir, db) = connect_temp().await;
        db.run_migrations().await.expect("migrations");

        let err = sqlx::query(
            "INSERT INTO employees (id, first_name, last_name, email, phone) \
             VALUES ('e-1', 'Ada', 'Lovelace', NULL, '555-0100')",
        )
        .execute(db.pool())
        .await
        .unwrap_err();

        let sqlx::Error::Database(db_err) = err else {
            panic!("expected database error, got {err}");
        };
        assert!(matches!(
            db_err.kind(),
            sqlx::error::ErrorKind::NotNullViolation
        ));
    }

    #[tokio::test]
    async fn ping_fails_once_pool_is_closed() {
        let (_dir, db) = connect_temp().await;
        db.ping().await.expect("ping open pool");

        db.pool().close().await;
        assert!(db.ping().await.is_err());
    }
}
