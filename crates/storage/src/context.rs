use std::{collections::HashMap, time::Instant};

use metrics::{counter, histogram};
use sqlx::{error::ErrorKind, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;

use taskdesk_core::employee::{Employee, EmployeeId};
use taskdesk_core::unit_of_work::{CancelSignal, UnitOfWork};

use crate::schema::{EmployeeQueryError, EmployeeRow};

/// Tracking state of an entity attached to a [`DataContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
enum PendingChange {
    Insert(Employee),
    Update(Employee),
    Delete(EmployeeId),
}

impl PendingChange {
    fn id(&self) -> EmployeeId {
        match self {
            Self::Insert(employee) | Self::Update(employee) => employee.id(),
            Self::Delete(id) => *id,
        }
    }

    fn state(&self) -> EntityState {
        match self {
            Self::Insert(_) => EntityState::Added,
            Self::Update(_) => EntityState::Modified,
            Self::Delete(_) => EntityState::Deleted,
        }
    }
}

/// Ordered record of pending changes, at most one per entity.
///
/// `index` maps each tracked id to its slot in `changes`.
#[derive(Debug, Default)]
struct ChangeTracker {
    changes: Vec<PendingChange>,
    index: HashMap<EmployeeId, usize>,
}

impl ChangeTracker {
    fn position(&self, id: EmployeeId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    fn state_of(&self, id: EmployeeId) -> Option<EntityState> {
        self.position(id).map(|index| self.changes[index].state())
    }

    fn add(&mut self, employee: Employee) {
        self.track(employee, PendingChange::Insert);
    }

    fn update(&mut self, employee: Employee) {
        self.track(employee, PendingChange::Update);
    }

    /// Records new values for an entity. Entities not yet in the store stay
    /// inserts; anything else becomes an update.
    fn track(&mut self, employee: Employee, untracked: fn(Employee) -> PendingChange) {
        match self.position(employee.id()) {
            None => self.push(untracked(employee)),
            Some(index) => {
                self.changes[index] = match self.changes[index].state() {
                    EntityState::Added => PendingChange::Insert(employee),
                    EntityState::Modified | EntityState::Deleted => {
                        PendingChange::Update(employee)
                    }
                };
            }
        }
    }

    fn remove(&mut self, id: EmployeeId) {
        let Some(index) = self.position(id) else {
            self.push(PendingChange::Delete(id));
            return;
        };
        match self.changes[index].state() {
            // never reached the store
            EntityState::Added => self.forget(index, id),
            EntityState::Modified => self.changes[index] = PendingChange::Delete(id),
            EntityState::Deleted => {}
        }
    }

    fn push(&mut self, change: PendingChange) {
        self.index.insert(change.id(), self.changes.len());
        self.changes.push(change);
    }

    fn forget(&mut self, index: usize, id: EmployeeId) {
        self.changes.remove(index);
        self.index.remove(&id);
        for slot in self.index.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
    }

    fn len(&self) -> usize {
        self.changes.len()
    }

    fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn clear(&mut self) {
        self.changes.clear();
        self.index.clear();
    }
}

/// Persistence context: a tracked set of employees plus the pool used to
/// flush it.
///
/// A context is meant for a single logical operation. Mutating methods and
/// [`UnitOfWork::commit`] take `&mut self`, so a context cannot be shared
/// between tasks without external synchronisation.
#[derive(Debug)]
pub struct DataContext {
    pool: SqlitePool,
    tracker: ChangeTracker,
}

impl DataContext {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tracker: ChangeTracker::default(),
        }
    }

    /// Returns the tracked set of employees.
    pub fn employees(&mut self) -> EmployeeSet<'_> {
        EmployeeSet {
            pool: &self.pool,
            tracker: &mut self.tracker,
        }
    }

    /// Number of entities with uncommitted changes.
    pub fn pending_changes(&self) -> usize {
        self.tracker.len()
    }

    pub fn has_changes(&self) -> bool {
        !self.tracker.is_empty()
    }

    /// Discards every tracked change without touching the store.
    pub fn discard_changes(&mut self) {
        self.tracker.clear();
    }

    async fn save_changes(&mut self) -> Result<u64, CommitError> {
        if self.tracker.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for change in &self.tracker.changes {
            affected += apply_change(&mut tx, change).await?;
        }
        tx.commit().await?;

        debug!(
            stage = "storage",
            changes = self.tracker.len(),
            affected,
            "unit of work committed"
        );
        self.tracker.clear();
        Ok(affected)
    }
}

impl UnitOfWork for DataContext {
    type Error = CommitError;

    /// Writes all tracked changes inside one transaction.
    ///
    /// On failure the transaction is rolled back and the tracked changes are
    /// kept. If the signal fires while the write is in flight the pending
    /// transaction is dropped; a commit that SQLite already finished stays
    /// durable even though `Cancelled` is reported.
    async fn commit(&mut self, cancel: Option<&CancelSignal>) -> Result<u64, CommitError> {
        let started = Instant::now();
        let outcome = match cancel {
            Some(signal) if signal.is_cancelled() => Err(CommitError::Cancelled),
            Some(signal) => {
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => Err(CommitError::Cancelled),
                    result = self.save_changes() => result,
                }
            }
            None => self.save_changes().await,
        };

        record_commit(&outcome, started);
        outcome
    }
}

async fn apply_change(
    tx: &mut Transaction<'_, Sqlite>,
    change: &PendingChange,
) -> Result<u64, sqlx::Error> {
    let result = match change {
        PendingChange::Insert(employee) => {
            sqlx::query(
                "INSERT INTO employees (id, first_name, last_name, email, phone) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(employee.id().to_string())
            .bind(&employee.first_name)
            .bind(&employee.last_name)
            .bind(&employee.email)
            .bind(&employee.phone)
            .execute(&mut **tx)
            .await?
        }
        PendingChange::Update(employee) => {
            sqlx::query(
                "UPDATE employees \
                 SET first_name = ?, last_name = ?, email = ?, phone = ? \
                 WHERE id = ?",
            )
            .bind(&employee.first_name)
            .bind(&employee.last_name)
            .bind(&employee.email)
            .bind(&employee.phone)
            .bind(employee.id().to_string())
            .execute(&mut **tx)
            .await?
        }
        PendingChange::Delete(id) => {
            sqlx::query("DELETE FROM employees WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut **tx)
                .await?
        }
    };

    Ok(result.rows_affected())
}

fn record_commit(outcome: &Result<u64, CommitError>, started: Instant) {
    let result = match outcome {
        Ok(affected) => {
            counter!("uow_commit_rows_total").increment(*affected);
            "ok"
        }
        Err(CommitError::Cancelled) => "cancelled",
        Err(CommitError::Database(_)) => "error",
    };
    counter!("uow_commits_total", "result" => result).increment(1);
    histogram!("uow_commit_seconds").record(started.elapsed().as_secs_f64());
}

/// Errors surfaced by [`DataContext::commit`](UnitOfWork::commit).
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit cancelled before completion")]
    Cancelled,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CommitError {
    /// Returns `true` when the store rejected a row for violating a schema
    /// constraint (missing required field, duplicate key, ...).
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => matches!(
                db_err.kind(),
                ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
                    | ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
            ),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Tracked set of employees borrowed from a [`DataContext`].
///
/// Mutations are recorded in memory; reads go straight to the store and do
/// not observe uncommitted changes.
pub struct EmployeeSet<'a> {
    pool: &'a SqlitePool,
    tracker: &'a mut ChangeTracker,
}

impl EmployeeSet<'_> {
    /// Marks a new employee for insertion.
    pub fn add(&mut self, employee: Employee) {
        self.tracker.add(employee);
    }

    /// Marks an existing employee as modified.
    pub fn update(&mut self, employee: Employee) {
        self.tracker.update(employee);
    }

    /// Marks the employee with the given id for deletion.
    pub fn remove(&mut self, id: EmployeeId) {
        self.tracker.remove(id);
    }

    /// Returns the tracking state of the employee, if it has pending changes.
    pub fn state_of(&self, id: EmployeeId) -> Option<EntityState> {
        self.tracker.state_of(id)
    }

    /// Loads a committed employee by id.
    pub async fn find(&self, id: EmployeeId) -> Result<Option<Employee>, EmployeeQueryError> {
        let row = sqlx::query_as::<_, EmployeeRow>(
            "SELECT id, first_name, last_name, email, phone FROM employees WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool)
        .await?;

        row.map(EmployeeRow::into_domain).transpose()
    }

    /// Lists committed employees ordered by last and first name.
    pub async fn list(&self) -> Result<Vec<Employee>, EmployeeQueryError> {
        let rows = sqlx::query_as::<_, EmployeeRow>(
            "SELECT id, first_name, last_name, email, phone FROM employees \
             ORDER BY last_name, first_name, id",
        )
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(EmployeeRow::into_domain).collect()
    }
}
