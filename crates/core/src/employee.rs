use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Primary key of an employee record.
///
/// Identifiers are assigned once at construction and never change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(Uuid);

impl EmployeeId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EmployeeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EmployeeId {
    type Err = EmployeeIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| EmployeeIdError::Invalid(value.to_string()))
    }
}

/// Errors raised while parsing an [`EmployeeId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmployeeIdError {
    #[error("invalid employee id: {0}")]
    Invalid(String),
}

/// The employee entity.
///
/// All four contact fields are required. Blank values are rejected by the
/// `employees` table when the record is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    id: EmployeeId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

impl Employee {
    /// Builds a new employee with a freshly generated identifier.
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self::with_id(EmployeeId::new(), first_name, last_name, email, phone)
    }

    /// Builds an employee for an identifier that was assigned elsewhere.
    pub fn with_id(
        id: EmployeeId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
            phone: phone.into(),
        }
    }

    pub fn id(&self) -> EmployeeId {
        self.id
    }
}
