//! Units of work
//!
//! A unit of work is the execution vehicle behind a connection: a one-shot
//! autocommit statement, a read-only snapshot, a read/write transaction, or
//! a DDL/DML batch. The connection only ever talks to the current unit
//! through the [`UnitOfWork`] trait; which concrete unit gets built is
//! decided by the connection's mode flags.

mod ddl_batch;
mod dml_batch;
mod read_only;
mod read_write;
mod single_use;

pub use ddl_batch::DdlBatch;
pub use dml_batch::DmlBatch;
pub use read_only::ReadOnlyTransaction;
pub use read_write::ReadWriteTransaction;
pub use single_use::SingleUseTransaction;

use meridian_common::{AnalyzeMode, Error, ErrorCode, Mutation, Result, Timestamp};
use meridian_engine::ResultSet;
use meridian_sql::ParsedStatement;

use crate::executor::StatementHandle;

/// Lifecycle state of a unit of work. Transitions are irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    New,
    Started,
    Committing,
    Committed,
    RolledBack,
    Aborted,
}

impl UnitOfWorkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitOfWorkState::Committed | UnitOfWorkState::RolledBack | UnitOfWorkState::Aborted
        )
    }
}

/// The terminal state a unit of work lands in when an operation fails.
pub(crate) fn failure_state(code: ErrorCode) -> UnitOfWorkState {
    match code {
        ErrorCode::Aborted => UnitOfWorkState::Aborted,
        _ => UnitOfWorkState::RolledBack,
    }
}

/// Contract satisfied by every execution vehicle.
///
/// Operations that a concrete unit does not support fail with
/// `FailedPrecondition`. All statement operations return handles that
/// complete in submission order on the connection's executor.
pub trait UnitOfWork: Send + Sync {
    fn state(&self) -> UnitOfWorkState;

    fn is_active(&self) -> bool {
        !self.state().is_terminal()
    }

    fn execute_query(
        &self,
        statement: ParsedStatement,
        analyze: AnalyzeMode,
    ) -> StatementHandle<ResultSet>;

    fn execute_update(&self, statement: ParsedStatement) -> StatementHandle<i64>;

    fn execute_batch_update(&self, statements: Vec<ParsedStatement>) -> StatementHandle<Vec<i64>>;

    fn execute_ddl(&self, statement: ParsedStatement) -> StatementHandle<()>;

    fn write(&self, mutations: Vec<Mutation>) -> StatementHandle<()>;

    fn commit(&self) -> StatementHandle<()>;

    fn rollback(&self) -> StatementHandle<()>;

    fn run_batch(&self) -> StatementHandle<Vec<i64>>;

    fn abort_batch(&self) -> Result<()>;

    /// Interrupt whatever the unit is currently executing. A no-op on a
    /// terminal unit. May be called from any thread.
    fn cancel(&self);

    fn read_timestamp(&self) -> Option<Timestamp>;

    fn commit_timestamp(&self) -> Option<Timestamp>;
}

/// An immediately-failed handle for an operation the unit does not support.
pub(crate) fn unsupported<T: Send + 'static>(message: &str) -> StatementHandle<T> {
    StatementHandle::ready(Err(Error::failed_precondition(message)))
}
