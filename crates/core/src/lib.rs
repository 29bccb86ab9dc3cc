//! Domain types shared by the storage adapter and the application binary.

pub mod employee;
pub mod unit_of_work;

pub use employee::{Employee, EmployeeId, EmployeeIdError};
pub use unit_of_work::{cancel_pair, CancelHandle, CancelSignal, UnitOfWork};
