//! DDL batch unit of work

use meridian_common::{AnalyzeMode, Error, Mutation, Result, Statement, Timestamp};
use meridian_engine::{DdlClient, ResultSet};
use meridian_sql::ParsedStatement;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{UnitOfWork, UnitOfWorkState, failure_state, unsupported};
use crate::executor::{CancelToken, StatementExecutor, StatementHandle};

/// Accumulates DDL statements and submits them as one admin operation.
pub struct DdlBatch {
    ddl: Arc<dyn DdlClient>,
    executor: Arc<StatementExecutor>,
    timeout: Option<Duration>,
    cancel: CancelToken,
    state: Arc<Mutex<UnitOfWorkState>>,
    statements: Arc<Mutex<Vec<Statement>>>,
}

impl DdlBatch {
    pub fn new(
        ddl: Arc<dyn DdlClient>,
        executor: Arc<StatementExecutor>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            ddl,
            executor,
            timeout,
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(UnitOfWorkState::New)),
            statements: Arc::new(Mutex::new(Vec::new())),
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

impl UnitOfWork for DdlBatch {
    fn state(&self) -> UnitOfWorkState {
        *self.state.lock()
    }

    fn execute_query(
        &self,
        _statement: ParsedStatement,
        _analyze: AnalyzeMode,
    ) -> StatementHandle<ResultSet> {
        unsupported("only DDL statements are allowed in a DDL batch")
    }

    fn execute_update(&self, _statement: ParsedStatement) -> StatementHandle<i64> {
        unsupported("only DDL statements are allowed in a DDL batch")
    }

    fn execute_batch_update(&self, _statements: Vec<ParsedStatement>) -> StatementHandle<Vec<i64>> {
        unsupported("only DDL statements are allowed in a DDL batch")
    }

    fn execute_ddl(&self, statement: ParsedStatement) -> StatementHandle<()> {
        if let Err(err) = self.check_accepting() {
            return StatementHandle::ready(Err(err));
        }
        let mut state = self.state.lock();
        *state = UnitOfWorkState::Started;
        self.statements.lock().push(statement.statement().clone());
        StatementHandle::ready(Ok(()))
    }

    fn write(&self, _mutations: Vec<Mutation>) -> StatementHandle<()> {
        unsupported("mutations are not allowed in a DDL batch")
    }

    fn commit(&self) -> StatementHandle<()> {
        unsupported("commit is not allowed for a DDL batch; use RUN BATCH or ABORT BATCH")
    }

    fn rollback(&self) -> StatementHandle<()> {
        unsupported("rollback is not allowed for a DDL batch; use RUN BATCH or ABORT BATCH")
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
        let ddl = self.ddl.clone();
        let state = self.state.clone();
        self.executor.submit(
            None,
            self.timeout,
            self.cancel.clone(),
            None,
            async move {
                match ddl.update_database_ddl(&statements).await {
                    Ok(()) => {
                        *state.lock() = UnitOfWorkState::Committed;
                        Ok(Vec::new())
                    }
                    Err(err) => {
                        *state.lock() = failure_state(err.code());
                        Err(err)
                    }
                }
            },
        )
    }

    fn abort_batch(&self) -> Result<()> {
        self.check_accepting()?;
        self.statements.lock().clear();
        *self.state.lock() = UnitOfWorkState::RolledBack;
        Ok(())
    }

    fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel.cancel();
        *self.state.lock() = UnitOfWorkState::RolledBack;
    }

    fn read_timestamp(&self) -> Option<Timestamp> {
        None
    }

    fn commit_timestamp(&self) -> Option<Timestamp> {
        None
    }
}
