//! Read/write transaction with internal replay of server aborts

use meridian_common::{
    AnalyzeMode, Error, ErrorCode, Mutation, Result, Timestamp, TimestampBound, TransactionMode,
};
use meridian_engine::{DatabaseClient, ResultSet, TxHandle};
use meridian_sql::ParsedStatement;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::{UnitOfWork, UnitOfWorkState, failure_state, unsupported};
use crate::executor::{CancelToken, StatementExecutor, StatementHandle};
use crate::retry::{RetryEvent, TransactionRetryListener};

/// Upper bound on internal replay rounds before `Aborted` is surfaced.
const MAX_INTERNAL_RETRIES: u64 = 16;
/// Base delay of the exponential backoff between replay rounds.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(10);
/// Ceiling for a single backoff delay.
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Order-sensitive digest over the logical values of a result set, so that
/// equal results compare equal regardless of transport encoding.
fn result_digest(result: &ResultSet) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for column in result.columns() {
        hasher.update(column.as_bytes());
        hasher.update([0x1f]);
    }
    for row in result.rows() {
        for value in row {
            // Serde output of Value is deterministic.
            hasher.update(serde_json::to_vec(value).unwrap_or_default());
            hasher.update([0x1e]);
        }
        hasher.update([0x1d]);
    }
    hasher.finalize().into()
}

#[derive(Debug, Clone)]
enum RecordedOp {
    Query {
        statement: ParsedStatement,
        analyze: AnalyzeMode,
    },
    Update(ParsedStatement),
    BatchUpdate(Vec<ParsedStatement>),
}

#[derive(Debug, Clone, PartialEq)]
enum RecordedOutcome {
    Rows([u8; 32]),
    UpdateCount(i64),
    BatchCounts(Vec<i64>),
    Failed(ErrorCode),
}

/// A statement and the result it was observed to produce, kept until the
/// transaction commits so that an aborted transaction can be replayed and
/// checked for concurrent modifications.
#[derive(Debug, Clone)]
struct RecordedStatement {
    op: RecordedOp,
    outcome: RecordedOutcome,
}

struct Inner {
    db: Arc<dyn DatabaseClient>,
    retry_aborts: bool,
    listeners: Vec<Arc<dyn TransactionRetryListener>>,
    state: Mutex<UnitOfWorkState>,
    server_tx: Mutex<Option<TxHandle>>,
    history: Mutex<Vec<RecordedStatement>>,
    mutations: Mutex<Vec<Mutation>>,
    commit_ts: Mutex<Option<Timestamp>>,
}

enum ExecuteOutcome {
    /// The replay produced the same results and execution can continue.
    Replayed,
    /// The replay observed a different result.
    Diverged,
}

impl Inner {
    async fn ensure_begun(&self) -> Result<TxHandle> {
        if let Some(tx) = *self.server_tx.lock() {
            return Ok(tx);
        }
        let tx = self
            .db
            .begin_transaction(TransactionMode::ReadWrite, TimestampBound::Strong)
            .await?;
        *self.server_tx.lock() = Some(tx);
        Ok(tx)
    }

    fn notify(&self, event: RetryEvent) {
        for listener in &self.listeners {
            listener.on_retry(event);
        }
    }

    /// Execute one recorded operation against the current server
    /// transaction and produce its comparable outcome.
    async fn run_op(&self, op: &RecordedOp) -> Result<RecordedOutcome> {
        let tx = self.ensure_begun().await?;
        match op {
            RecordedOp::Query { statement, analyze } => {
                let rows = self
                    .db
                    .execute_query(&tx, statement.statement(), statement.query_options(), *analyze)
                    .await?;
                Ok(RecordedOutcome::Rows(result_digest(&rows)))
            }
            RecordedOp::Update(statement) => {
                let count = self.db.execute_update(&tx, statement.statement()).await?;
                Ok(RecordedOutcome::UpdateCount(count))
            }
            RecordedOp::BatchUpdate(statements) => {
                let statements: Vec<_> =
                    statements.iter().map(|s| s.statement().clone()).collect();
                let counts = self.db.execute_batch_update(&tx, &statements).await?;
                Ok(RecordedOutcome::BatchCounts(counts))
            }
        }
    }

    /// Replay the recorded history on a fresh server transaction.
    ///
    /// `Ok(Replayed)` means every statement reproduced its recorded result;
    /// `Ok(Diverged)` means a concurrent modification was detected. Aborts
    /// during the replay are returned as errors so the caller can restart.
    async fn replay_history(&self) -> Result<ExecuteOutcome> {
        let history = self.history.lock().clone();
        for recorded in &history {
            match self.run_op(&recorded.op).await {
                Ok(outcome) => {
                    if outcome != recorded.outcome {
                        return Ok(ExecuteOutcome::Diverged);
                    }
                }
                Err(err) if err.code() == ErrorCode::Aborted => return Err(err),
                Err(err) => {
                    if RecordedOutcome::Failed(err.code()) != recorded.outcome {
                        return Ok(ExecuteOutcome::Diverged);
                    }
                }
            }
        }
        Ok(ExecuteOutcome::Replayed)
    }

    /// Handle a server abort: begin a new transaction and replay the
    /// history, backing off and restarting when the replay is aborted too.
    async fn retry(&self) -> Result<()> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            if attempt > MAX_INTERNAL_RETRIES {
                *self.state.lock() = UnitOfWorkState::Aborted;
                return Err(Error::aborted(format!(
                    "transaction was aborted and did not succeed after {} internal retries",
                    MAX_INTERNAL_RETRIES
                )));
            }
            self.notify(RetryEvent::Started { attempt });
            self.server_tx.lock().take();
            match self.replay_history().await {
                Ok(ExecuteOutcome::Replayed) => {
                    self.notify(RetryEvent::Succeeded { attempt });
                    return Ok(());
                }
                Ok(ExecuteOutcome::Diverged) => {
                    self.notify(RetryEvent::DifferentResult { attempt });
                    *self.state.lock() = UnitOfWorkState::Aborted;
                    return Err(Error::aborted(
                        "concurrent modification detected: a replayed statement returned a different result",
                    ));
                }
                Err(err) if err.code() == ErrorCode::Aborted => {
                    self.notify(RetryEvent::AbortedAndRestarting { attempt });
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => {
                    *self.state.lock() = failure_state(err.code());
                    return Err(err);
                }
            }
        }
    }

    /// Execute a new operation, transparently retrying the transaction when
    /// the server aborts it, and record the observed outcome.
    async fn execute_and_record<T>(
        &self,
        op: RecordedOp,
        extract: impl Fn(&RecordedOutcome) -> Option<T>,
    ) -> Result<T> {
        loop {
            match self.run_op(&op).await {
                Ok(outcome) => {
                    let value = extract(&outcome).ok_or_else(|| {
                        Error::internal("statement produced a result of an unexpected kind")
                    })?;
                    self.history.lock().push(RecordedStatement {
                        op,
                        outcome,
                    });
                    return Ok(value);
                }
                Err(err) if err.code() == ErrorCode::Aborted && self.retry_aborts => {
                    self.retry().await?;
                }
                Err(err) if err.code() == ErrorCode::Aborted => {
                    *self.state.lock() = UnitOfWorkState::Aborted;
                    return Err(err);
                }
                Err(err) => {
                    // Non-fatal statement errors leave the transaction
                    // usable; the error is part of the replayable history.
                    self.history.lock().push(RecordedStatement {
                        op,
                        outcome: RecordedOutcome::Failed(err.code()),
                    });
                    return Err(err);
                }
            }
        }
    }

    /// Flush buffered mutations and commit, retrying the whole transaction
    /// on aborts when enabled.
    async fn commit_with_retry(&self) -> Result<()> {
        loop {
            let attempt: Result<Timestamp> = async {
                let tx = self.ensure_begun().await?;
                let mutations = self.mutations.lock().clone();
                if !mutations.is_empty() {
                    self.db.write(&tx, &mutations).await?;
                }
                self.db.commit(&tx).await
            }
            .await;
            match attempt {
                Ok(timestamp) => {
                    *self.commit_ts.lock() = Some(timestamp);
                    *self.state.lock() = UnitOfWorkState::Committed;
                    return Ok(());
                }
                Err(err) if err.code() == ErrorCode::Aborted && self.retry_aborts => {
                    self.retry().await?;
                }
                Err(err) => {
                    *self.state.lock() = failure_state(err.code());
                    return Err(err);
                }
            }
        }
    }
}

fn backoff_delay(attempt: u64) -> Duration {
    let factor = 1u32 << attempt.min(8) as u32;
    RETRY_BACKOFF_BASE
        .saturating_mul(factor)
        .min(RETRY_BACKOFF_CAP)
}

/// A multi-statement mutating transaction.
///
/// Every statement and its observed result are recorded until the commit
/// succeeds; when the server aborts the transaction the history is replayed
/// on a fresh transaction and compared against the recorded results.
pub struct ReadWriteTransaction {
    inner: Arc<Inner>,
    executor: Arc<StatementExecutor>,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl ReadWriteTransaction {
    pub fn new(
        db: Arc<dyn DatabaseClient>,
        retry_aborts: bool,
        listeners: Vec<Arc<dyn TransactionRetryListener>>,
        executor: Arc<StatementExecutor>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                retry_aborts,
                listeners,
                state: Mutex::new(UnitOfWorkState::Started),
                server_tx: Mutex::new(None),
                history: Mutex::new(Vec::new()),
                mutations: Mutex::new(Vec::new()),
                commit_ts: Mutex::new(None),
            }),
            executor,
            timeout,
            cancel: CancelToken::new(),
        }
    }

    fn check_usable(&self) -> Result<()> {
        match self.state() {
            UnitOfWorkState::Started => Ok(()),
            UnitOfWorkState::Committing => Err(Error::failed_precondition(
                "this transaction is committing",
            )),
            _ => Err(Error::failed_precondition("this transaction has ended")),
        }
    }
}

impl UnitOfWork for ReadWriteTransaction {
    fn state(&self) -> UnitOfWorkState {
        *self.inner.state.lock()
    }

    fn execute_query(
        &self,
        statement: ParsedStatement,
        analyze: AnalyzeMode,
    ) -> StatementHandle<ResultSet> {
        if let Err(err) = self.check_usable() {
            return StatementHandle::ready(Err(err));
        }
        let inner = self.inner.clone();
        self.executor.submit(
            Some(statement.clone()),
            self.timeout,
            self.cancel.clone(),
            None,
            async move {
                // The caller needs the actual rows; only the digest is
                // recorded for replay comparison.
                loop {
                    let tx = inner.ensure_begun().await?;
                    let result = inner
                        .db
                        .execute_query(
                            &tx,
                            statement.statement(),
                            statement.query_options(),
                            analyze,
                        )
                        .await;
                    let op = RecordedOp::Query {
                        statement: statement.clone(),
                        analyze,
                    };
                    match result {
                        Ok(rows) => {
                            inner.history.lock().push(RecordedStatement {
                                op,
                                outcome: RecordedOutcome::Rows(result_digest(&rows)),
                            });
                            return Ok(rows);
                        }
                        Err(err) if err.code() == ErrorCode::Aborted && inner.retry_aborts => {
                            inner.retry().await?;
                        }
                        Err(err) if err.code() == ErrorCode::Aborted => {
                            *inner.state.lock() = UnitOfWorkState::Aborted;
                            return Err(err);
                        }
                        Err(err) => {
                            inner.history.lock().push(RecordedStatement {
                                op,
                                outcome: RecordedOutcome::Failed(err.code()),
                            });
                            return Err(err);
                        }
                    }
                }
            },
        )
    }

    fn execute_update(&self, statement: ParsedStatement) -> StatementHandle<i64> {
        if let Err(err) = self.check_usable() {
            return StatementHandle::ready(Err(err));
        }
        let inner = self.inner.clone();
        self.executor.submit(
            Some(statement.clone()),
            self.timeout,
            self.cancel.clone(),
            None,
            async move {
                inner
                    .execute_and_record(RecordedOp::Update(statement), |outcome| match outcome {
                        RecordedOutcome::UpdateCount(count) => Some(*count),
                        _ => None,
                    })
                    .await
            },
        )
    }

    fn execute_batch_update(&self, statements: Vec<ParsedStatement>) -> StatementHandle<Vec<i64>> {
        if let Err(err) = self.check_usable() {
            return StatementHandle::ready(Err(err));
        }
        let inner = self.inner.clone();
        self.executor.submit(
            None,
            self.timeout,
            self.cancel.clone(),
            None,
            async move {
                inner
                    .execute_and_record(RecordedOp::BatchUpdate(statements), |outcome| {
                        match outcome {
                            RecordedOutcome::BatchCounts(counts) => Some(counts.clone()),
                            _ => None,
                        }
                    })
                    .await
            },
        )
    }

    fn execute_ddl(&self, _statement: ParsedStatement) -> StatementHandle<()> {
        unsupported("DDL statements are not allowed in read/write transactions")
    }

    fn write(&self, mutations: Vec<Mutation>) -> StatementHandle<()> {
        if let Err(err) = self.check_usable() {
            return StatementHandle::ready(Err(err));
        }
        self.inner.mutations.lock().extend(mutations);
        StatementHandle::ready(Ok(()))
    }

    fn commit(&self) -> StatementHandle<()> {
        if let Err(err) = self.check_usable() {
            return StatementHandle::ready(Err(err));
        }
        *self.inner.state.lock() = UnitOfWorkState::Committing;
        let inner = self.inner.clone();
        self.executor.submit(
            None,
            self.timeout,
            self.cancel.clone(),
            None,
            async move { inner.commit_with_retry().await },
        )
    }

    fn rollback(&self) -> StatementHandle<()> {
        if let Err(err) = self.check_usable() {
            return StatementHandle::ready(Err(err));
        }
        let inner = self.inner.clone();
        self.executor.submit(
            None,
            self.timeout,
            self.cancel.clone(),
            None,
            async move {
                let tx = inner.server_tx.lock().take();
                let result = match tx {
                    Some(tx) => inner.db.rollback(&tx).await,
                    None => Ok(()),
                };
                *inner.state.lock() = UnitOfWorkState::RolledBack;
                result
            },
        )
    }

    fn run_batch(&self) -> StatementHandle<Vec<i64>> {
        unsupported("run batch is not supported for read/write transactions")
    }

    fn abort_batch(&self) -> Result<()> {
        Err(Error::failed_precondition(
            "abort batch is not supported for read/write transactions",
        ))
    }

    fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.cancel.cancel();
        *self.inner.state.lock() = UnitOfWorkState::RolledBack;
        if let Some(tx) = self.inner.server_tx.lock().take() {
            let db = self.inner.db.clone();
            self.executor.fire_and_forget(async move {
                let _ = db.rollback(&tx).await;
            });
        }
    }

    fn read_timestamp(&self) -> Option<Timestamp> {
        None
    }

    fn commit_timestamp(&self) -> Option<Timestamp> {
        *self.inner.commit_ts.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::Value;

    #[test]
    fn test_digest_is_order_sensitive() {
        let a = ResultSet::new(
            vec!["c".to_string()],
            vec![vec![Value::I64(1)], vec![Value::I64(2)]],
        );
        let b = ResultSet::new(
            vec!["c".to_string()],
            vec![vec![Value::I64(2)], vec![Value::I64(1)]],
        );
        assert_ne!(result_digest(&a), result_digest(&b));
        assert_eq!(result_digest(&a), result_digest(&a.clone()));
    }

    #[test]
    fn test_digest_distinguishes_row_boundaries() {
        let a = ResultSet::new(
            vec!["x".to_string(), "y".to_string()],
            vec![vec![Value::I64(1), Value::I64(2)]],
        );
        let b = ResultSet::new(
            vec!["x".to_string(), "y".to_string()],
            vec![vec![Value::I64(1)], vec![Value::I64(2)]],
        );
        assert_ne!(result_digest(&a), result_digest(&b));
    }

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff_delay(1), Duration::from_millis(20));
        assert!(backoff_delay(60) <= RETRY_BACKOFF_CAP);
    }
}
