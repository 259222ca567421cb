//! Multi-statement snapshot unit of work

use meridian_common::{AnalyzeMode, Error, Mutation, Result, Timestamp, TimestampBound, TransactionMode};
use meridian_engine::{DatabaseClient, ResultSet, TxHandle};
use meridian_sql::ParsedStatement;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{UnitOfWork, UnitOfWorkState, failure_state, unsupported};
use crate::executor::{CancelToken, StatementExecutor, StatementHandle};

/// A read-only transaction: a snapshot opened at the connection's staleness
/// bound on the first statement. Commit and rollback are equivalent; both
/// just release the snapshot.
pub struct ReadOnlyTransaction {
    db: Arc<dyn DatabaseClient>,
    staleness: TimestampBound,
    executor: Arc<StatementExecutor>,
    timeout: Option<Duration>,
    cancel: CancelToken,
    state: Arc<Mutex<UnitOfWorkState>>,
    server_tx: Arc<Mutex<Option<TxHandle>>>,
}

impl ReadOnlyTransaction {
    pub fn new(
        db: Arc<dyn DatabaseClient>,
        staleness: TimestampBound,
        executor: Arc<StatementExecutor>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            db,
            staleness,
            executor,
            timeout,
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(UnitOfWorkState::Started)),
            server_tx: Arc::new(Mutex::new(None)),
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::failed_precondition("this transaction has ended"));
        }
        Ok(())
    }

    /// Begin the server-side snapshot if this is the first statement.
    async fn ensure_begun(
        db: &Arc<dyn DatabaseClient>,
        server_tx: &Arc<Mutex<Option<TxHandle>>>,
        staleness: TimestampBound,
    ) -> Result<TxHandle> {
        if let Some(tx) = *server_tx.lock() {
            return Ok(tx);
        }
        let tx = db
            .begin_transaction(TransactionMode::ReadOnly, staleness)
            .await?;
        *server_tx.lock() = Some(tx);
        Ok(tx)
    }

    /// Release the snapshot; used by both commit and rollback.
    fn end(&self, end_state: UnitOfWorkState) -> StatementHandle<()> {
        if let Err(err) = self.check_active() {
            return StatementHandle::ready(Err(err));
        }
        let db = self.db.clone();
        let state = self.state.clone();
        let server_tx = self.server_tx.clone();
        self.executor.submit(
            None,
            self.timeout,
            self.cancel.clone(),
            None,
            async move {
                let tx = server_tx.lock().take();
                if let Some(tx) = tx {
                    // Releasing the snapshot is best-effort.
                    let _ = db.rollback(&tx).await;
                }
                *state.lock() = end_state;
                Ok(())
            },
        )
    }
}

impl UnitOfWork for ReadOnlyTransaction {
    fn state(&self) -> UnitOfWorkState {
        *self.state.lock()
    }

    fn execute_query(
        &self,
        statement: ParsedStatement,
        analyze: AnalyzeMode,
    ) -> StatementHandle<ResultSet> {
        if let Err(err) = self.check_active() {
            return StatementHandle::ready(Err(err));
        }
        let db = self.db.clone();
        let staleness = self.staleness;
        let state = self.state.clone();
        let server_tx = self.server_tx.clone();
        self.executor.submit(
            Some(statement.clone()),
            self.timeout,
            self.cancel.clone(),
            None,
            async move {
                let tx = Self::ensure_begun(&db, &server_tx, staleness).await?;
                let result = db
                    .execute_query(&tx, statement.statement(), statement.query_options(), analyze)
                    .await;
                if let Err(err) = &result
                    && err.code() == meridian_common::ErrorCode::Aborted
                {
                    *state.lock() = failure_state(err.code());
                }
                result
            },
        )
    }

    fn execute_update(&self, _statement: ParsedStatement) -> StatementHandle<i64> {
        unsupported("update statements are not allowed for read-only transactions")
    }

    fn execute_batch_update(&self, _statements: Vec<ParsedStatement>) -> StatementHandle<Vec<i64>> {
        unsupported("batch updates are not allowed for read-only transactions")
    }

    fn execute_ddl(&self, _statement: ParsedStatement) -> StatementHandle<()> {
        unsupported("DDL statements are not allowed for read-only transactions")
    }

    fn write(&self, _mutations: Vec<Mutation>) -> StatementHandle<()> {
        unsupported("mutations are not allowed for read-only transactions")
    }

    fn commit(&self) -> StatementHandle<()> {
        self.end(UnitOfWorkState::Committed)
    }

    fn rollback(&self) -> StatementHandle<()> {
        self.end(UnitOfWorkState::RolledBack)
    }

    fn run_batch(&self) -> StatementHandle<Vec<i64>> {
        unsupported("run batch is not supported for read-only transactions")
    }

    fn abort_batch(&self) -> Result<()> {
        Err(Error::failed_precondition(
            "abort batch is not supported for read-only transactions",
        ))
    }

    fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel.cancel();
        *self.state.lock() = UnitOfWorkState::RolledBack;
        if let Some(tx) = self.server_tx.lock().take() {
            let db = self.db.clone();
            self.executor.fire_and_forget(async move {
                let _ = db.rollback(&tx).await;
            });
        }
    }

    fn read_timestamp(&self) -> Option<Timestamp> {
        self.server_tx.lock().and_then(|tx| tx.read_timestamp)
    }

    fn commit_timestamp(&self) -> Option<Timestamp> {
        None
    }
}
