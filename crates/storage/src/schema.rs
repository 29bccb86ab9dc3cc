use thiserror::Error;

use taskdesk_core::employee::{Employee, EmployeeId, EmployeeIdError};

/// Table holding employee records, created by the bundled migrations.
pub const EMPLOYEES_TABLE: &str = "employees";

/// Column that stores the primary key.
pub const EMPLOYEE_KEY_COLUMN: &str = "id";

/// Every column of the `employees` table in declaration order.
pub const EMPLOYEE_COLUMNS: [&str; 5] = ["id", "first_name", "last_name", "email", "phone"];

/// Columns that must be non-null and non-blank.
pub const REQUIRED_EMPLOYEE_COLUMNS: [&str; 4] = ["first_name", "last_name", "email", "phone"];

/// Raw row read back from the `employees` table.
#[derive(Debug, sqlx::FromRow)]
pub struct EmployeeRow {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

impl EmployeeRow {
    /// Converts the database row into the domain entity.
    pub fn into_domain(self) -> Result<Employee, EmployeeQueryError> {
        let id: EmployeeId = self.id.parse()?;
        Ok(Employee::with_id(
            id,
            self.first_name,
            self.last_name,
            self.email,
            self.phone,
        ))
    }
}

/// Errors that can occur while reading employees back from storage.
#[derive(Debug, Error)]
pub enum EmployeeQueryError {
    #[error("stored employee has a malformed id: {0}")]
    InvalidId(#[from] EmployeeIdError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
