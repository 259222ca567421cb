//! DML batch unit of work

use meridian_common::{AnalyzeMode, Error, Mutation, Result, Timestamp};
use meridian_engine::ResultSet;
use meridian_sql::ParsedStatement;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{UnitOfWork, UnitOfWorkState, failure_state, unsupported};
use crate::executor::StatementHandle;

/// Accumulates DML statements and submits them through the host unit of
/// work's batch-update path. The batch temporarily shadows the host; commit
/// and rollback apply only to the host transaction after the batch ends.
pub struct DmlBatch {
    host: Arc<dyn UnitOfWork>,
    state: Arc<Mutex<UnitOfWorkState>>,
    statements: Mutex<Vec<ParsedStatement>>,
}

impl DmlBatch {
    pub fn new(host: Arc<dyn UnitOfWork>) -> Self {
        Self {
            host,
            state: Arc::new(Mutex::new(UnitOfWorkState::New)),
            statements: Mutex::new(Vec::new()),
        }
    }

    fn check_accepting(&self) -> Result<()> {
        let state = self.state();
        if state != UnitOfWorkState::New && state != UnitOfWorkState::Started {
            return Err(Error::failed_precondition("this batch has ended"));
        }
        Ok(())
    }
}

impl UnitOfWork for DmlBatch {
    fn state(&self) -> UnitOfWorkState {
        *self.state.lock()
    }

    fn execute_query(
        &self,
        _statement: ParsedStatement,
        _analyze: AnalyzeMode,
    ) -> StatementHandle<ResultSet> {
        unsupported("only DML statements are allowed in a DML batch")
    }

    /// Queue the statement. The returned count is `-1`: row counts are not
    /// known until the batch runs.
    fn execute_update(&self, statement: ParsedStatement) -> StatementHandle<i64> {
        if let Err(err) = self.check_accepting() {
            return StatementHandle::ready(Err(err));
        }
        *self.state.lock() = UnitOfWorkState::Started;
        self.statements.lock().push(statement);
        StatementHandle::ready(Ok(-1))
    }

    fn execute_batch_update(&self, _statements: Vec<ParsedStatement>) -> StatementHandle<Vec<i64>> {
        unsupported("batch updates cannot be nested in a DML batch")
    }

    fn execute_ddl(&self, _statement: ParsedStatement) -> StatementHandle<()> {
        unsupported("only DML statements are allowed in a DML batch")
    }

    fn write(&self, _mutations: Vec<Mutation>) -> StatementHandle<()> {
        unsupported("mutations are not allowed in a DML batch")
    }

    fn commit(&self) -> StatementHandle<()> {
        unsupported("commit is not allowed for a DML batch; use RUN BATCH or ABORT BATCH")
    }

    fn rollback(&self) -> StatementHandle<()> {
        unsupported("rollback is not allowed for a DML batch; use RUN BATCH or ABORT BATCH")
    }

    fn run_batch(&self) -> StatementHandle<Vec<i64>> {
        if let Err(err) = self.check_accepting() {
            return StatementHandle::ready(Err(err));
        }
        let statements = std::mem::take(&mut *self.statements.lock());
        if statements.is_empty() {
            *self.state.lock() = UnitOfWorkState::Committed;
            return StatementHandle::ready(Ok(Vec::new()));
        }
        *self.state.lock() = UnitOfWorkState::Committing;
        let state = self.state.clone();
        self.host
            .execute_batch_update(statements)
            .inspect(move |result| {
                *state.lock() = match result {
                    Ok(_) => UnitOfWorkState::Committed,
                    Err(err) => failure_state(err.code()),
                };
            })
    }

    fn abort_batch(&self) -> Result<()> {
        self.check_accepting()?;
        self.statements.lock().clear();
        *self.state.lock() = UnitOfWorkState::RolledBack;
        Ok(())
    }

    /// Cancelling a DML batch interrupts the host, since a running batch
    /// executes inside the host transaction.
    fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        *self.state.lock() = UnitOfWorkState::RolledBack;
        self.host.cancel();
    }

    fn read_timestamp(&self) -> Option<Timestamp> {
        None
    }

    fn commit_timestamp(&self) -> Option<Timestamp> {
        None
    }
}
