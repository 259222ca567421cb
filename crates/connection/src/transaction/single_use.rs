//! One-shot unit of work for autocommit mode

use meridian_common::{
    AnalyzeMode, AutocommitDmlMode, Error, Mutation, Result, Timestamp, TimestampBound,
    TransactionMode,
};
use meridian_engine::{DatabaseClient, DdlClient, ResultSet, TxHandle};
use meridian_sql::ParsedStatement;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{UnitOfWork, UnitOfWorkState, failure_state, unsupported};
use crate::executor::{CancelToken, StatementExecutor, StatementHandle};

/// Run one transactional attempt: begin, run the body, commit.
macro_rules! run_in_transaction {
    ($db:expr, $server_tx:expr, $tx:ident, $body:expr) => {
        match $db
            .begin_transaction(TransactionMode::ReadWrite, TimestampBound::Strong)
            .await
        {
            Err(err) => Err(err),
            Ok(tx) => {
                *$server_tx.lock() = Some(tx);
                let value_result = {
                    let $tx = &tx;
                    $body.await
                };
                match value_result {
                    Ok(value) => {
                        let commit_result = $db.commit(&tx).await;
                        $server_tx.lock().take();
                        commit_result.map(|timestamp| (value, timestamp))
                    }
                    Err(err) => {
                        let _ = $db.rollback(&tx).await;
                        $server_tx.lock().take();
                        Err(err)
                    }
                }
            }
        }
    };
}

/// Executes exactly one statement and then becomes terminal.
///
/// Reads run at the connection's staleness bound; writes follow the
/// autocommit DML mode.
pub struct SingleUseTransaction {
    db: Arc<dyn DatabaseClient>,
    ddl: Arc<dyn DdlClient>,
    read_only: bool,
    staleness: TimestampBound,
    dml_mode: AutocommitDmlMode,
    executor: Arc<StatementExecutor>,
    timeout: Option<Duration>,
    cancel: CancelToken,
    state: Arc<Mutex<UnitOfWorkState>>,
    read_ts: Arc<Mutex<Option<Timestamp>>>,
    commit_ts: Arc<Mutex<Option<Timestamp>>>,
    /// The server transaction backing a transactional write, kept so that
    /// cancellation can attempt a rollback.
    server_tx: Arc<Mutex<Option<TxHandle>>>,
}

impl SingleUseTransaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn DatabaseClient>,
        ddl: Arc<dyn DdlClient>,
        read_only: bool,
        staleness: TimestampBound,
        dml_mode: AutocommitDmlMode,
        executor: Arc<StatementExecutor>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            db,
            ddl,
            read_only,
            staleness,
            dml_mode,
            executor,
            timeout,
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(UnitOfWorkState::New)),
            read_ts: Arc::new(Mutex::new(None)),
            commit_ts: Arc::new(Mutex::new(None)),
            server_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Claim the single statement slot, moving New -> Started.
    fn take_statement_slot(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != UnitOfWorkState::New {
            return Err(Error::failed_precondition(
                "a single-use transaction may only execute one statement",
            ));
        }
        *state = UnitOfWorkState::Started;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::failed_precondition(
                "update statements are not allowed on a read-only connection",
            ));
        }
        Ok(())
    }

    /// Preempt hook shared by all jobs: mark the transaction terminal and
    /// roll back any open server transaction without blocking.
    fn preempt_hook(&self) -> Box<dyn FnOnce(meridian_common::ErrorCode) + Send> {
        let state = self.state.clone();
        let server_tx = self.server_tx.clone();
        let db = self.db.clone();
        Box::new(move |code| {
            *state.lock() = failure_state(code);
            if let Some(tx) = server_tx.lock().take() {
                tokio::spawn(async move {
                    let _ = db.rollback(&tx).await;
                });
            }
        })
    }

    /// The number of transactional attempts the DML mode allows.
    fn attempts(dml_mode: AutocommitDmlMode) -> u32 {
        match dml_mode {
            AutocommitDmlMode::TransactionalWithRetry => 2,
            _ => 1,
        }
    }
}

impl UnitOfWork for SingleUseTransaction {
    fn state(&self) -> UnitOfWorkState {
        *self.state.lock()
    }

    fn execute_query(
        &self,
        statement: ParsedStatement,
        analyze: AnalyzeMode,
    ) -> StatementHandle<ResultSet> {
        if let Err(err) = self.take_statement_slot() {
            return StatementHandle::ready(Err(err));
        }
        let db = self.db.clone();
        let staleness = self.staleness;
        let state = self.state.clone();
        let read_ts = self.read_ts.clone();
        self.executor.submit(
            Some(statement.clone()),
            self.timeout,
            self.cancel.clone(),
            Some(self.preempt_hook()),
            async move {
                let result = db
                    .single_use_query(
                        staleness,
                        statement.statement(),
                        statement.query_options(),
                        analyze,
                    )
                    .await;
                match result {
                    Ok((rows, timestamp)) => {
                        *read_ts.lock() = Some(timestamp);
                        *state.lock() = UnitOfWorkState::Committed;
                        Ok(rows)
                    }
                    Err(err) => {
                        *state.lock() = failure_state(err.code());
                        Err(err)
                    }
                }
            },
        )
    }

    fn execute_update(&self, statement: ParsedStatement) -> StatementHandle<i64> {
        if let Err(err) = self.check_writable().and_then(|()| self.take_statement_slot()) {
            return StatementHandle::ready(Err(err));
        }
        let db = self.db.clone();
        let dml_mode = self.dml_mode;
        let state = self.state.clone();
        let commit_ts = self.commit_ts.clone();
        let server_tx = self.server_tx.clone();
        self.executor.submit(
            Some(statement.clone()),
            self.timeout,
            self.cancel.clone(),
            Some(self.preempt_hook()),
            async move {
                if dml_mode == AutocommitDmlMode::PartitionedNonAtomic {
                    return match db.partitioned_update(statement.statement()).await {
                        Ok(count) => {
                            *state.lock() = UnitOfWorkState::Committed;
                            Ok(count)
                        }
                        Err(err) => {
                            *state.lock() = failure_state(err.code());
                            Err(err)
                        }
                    };
                }
                let mut attempts = Self::attempts(dml_mode);
                loop {
                    attempts -= 1;
                    let result = run_in_transaction!(
                        db,
                        server_tx,
                        tx,
                        db.execute_update(tx, statement.statement())
                    );
                    match result {
                        Ok((count, timestamp)) => {
                            *commit_ts.lock() = Some(timestamp);
                            *state.lock() = UnitOfWorkState::Committed;
                            return Ok(count);
                        }
                        Err(err)
                            if err.code() == meridian_common::ErrorCode::Aborted
                                && attempts > 0 =>
                        {
                            tracing::debug!("autocommit update aborted, replaying once");
                        }
                        Err(err) => {
                            *state.lock() = failure_state(err.code());
                            return Err(err);
                        }
                    }
                }
            },
        )
    }

    fn execute_batch_update(&self, statements: Vec<ParsedStatement>) -> StatementHandle<Vec<i64>> {
        if let Err(err) = self.check_writable() {
            return StatementHandle::ready(Err(err));
        }
        if self.dml_mode == AutocommitDmlMode::PartitionedNonAtomic {
            return unsupported(
                "batch updates are not allowed when the autocommit DML mode is PARTITIONED_NON_ATOMIC",
            );
        }
        if let Err(err) = self.take_statement_slot() {
            return StatementHandle::ready(Err(err));
        }
        let db = self.db.clone();
        let dml_mode = self.dml_mode;
        let state = self.state.clone();
        let commit_ts = self.commit_ts.clone();
        let server_tx = self.server_tx.clone();
        self.executor.submit(
            None,
            self.timeout,
            self.cancel.clone(),
            Some(self.preempt_hook()),
            async move {
                let statements: Vec<_> = statements
                    .iter()
                    .map(|s| s.statement().clone())
                    .collect();
                let mut attempts = Self::attempts(dml_mode);
                loop {
                    attempts -= 1;
                    let result = run_in_transaction!(
                        db,
                        server_tx,
                        tx,
                        db.execute_batch_update(tx, &statements)
                    );
                    match result {
                        Ok((counts, timestamp)) => {
                            *commit_ts.lock() = Some(timestamp);
                            *state.lock() = UnitOfWorkState::Committed;
                            return Ok(counts);
                        }
                        Err(err)
                            if err.code() == meridian_common::ErrorCode::Aborted
                                && attempts > 0 =>
                        {
                            tracing::debug!("autocommit batch update aborted, replaying once");
                        }
                        Err(err) => {
                            *state.lock() = failure_state(err.code());
                            return Err(err);
                        }
                    }
                }
            },
        )
    }

    fn execute_ddl(&self, statement: ParsedStatement) -> StatementHandle<()> {
        if let Err(err) = self.check_writable().and_then(|()| self.take_statement_slot()) {
            return StatementHandle::ready(Err(err));
        }
        let ddl = self.ddl.clone();
        let state = self.state.clone();
        self.executor.submit(
            Some(statement.clone()),
            self.timeout,
            self.cancel.clone(),
            Some(self.preempt_hook()),
            async move {
                let result = ddl
                    .update_database_ddl(std::slice::from_ref(statement.statement()))
                    .await;
                match result {
                    Ok(()) => {
                        *state.lock() = UnitOfWorkState::Committed;
                        Ok(())
                    }
                    Err(err) => {
                        *state.lock() = failure_state(err.code());
                        Err(err)
                    }
                }
            },
        )
    }

    fn write(&self, mutations: Vec<Mutation>) -> StatementHandle<()> {
        if let Err(err) = self.check_writable().and_then(|()| self.take_statement_slot()) {
            return StatementHandle::ready(Err(err));
        }
        let db = self.db.clone();
        let state = self.state.clone();
        let commit_ts = self.commit_ts.clone();
        let server_tx = self.server_tx.clone();
        self.executor.submit(
            None,
            self.timeout,
            self.cancel.clone(),
            Some(self.preempt_hook()),
            async move {
                let result = run_in_transaction!(db, server_tx, tx, db.write(tx, &mutations));
                match result {
                    Ok(((), timestamp)) => {
                        *commit_ts.lock() = Some(timestamp);
                        *state.lock() = UnitOfWorkState::Committed;
                        Ok(())
                    }
                    Err(err) => {
                        *state.lock() = failure_state(err.code());
                        Err(err)
                    }
                }
            },
        )
    }

    fn commit(&self) -> StatementHandle<()> {
        unsupported("commit is not supported for single-use transactions")
    }

    fn rollback(&self) -> StatementHandle<()> {
        unsupported("rollback is not supported for single-use transactions")
    }

    fn run_batch(&self) -> StatementHandle<Vec<i64>> {
        unsupported("run batch is not supported for single-use transactions")
    }

    fn abort_batch(&self) -> Result<()> {
        Err(Error::failed_precondition(
            "abort batch is not supported for single-use transactions",
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
        *self.read_ts.lock()
    }

    fn commit_timestamp(&self) -> Option<Timestamp> {
        *self.commit_ts.lock()
    }
}
