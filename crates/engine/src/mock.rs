//! Scriptable in-process backend used by the connection tests

use async_trait::async_trait;
use meridian_common::{
    AnalyzeMode, Error, ErrorCode, Mutation, QueryOptions, Result, Statement, Timestamp,
    TimestampBound, TransactionId, TransactionMode,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::client::{DatabaseClient, DdlClient, TxHandle};
use crate::result::ResultSet;

#[derive(Debug, Clone)]
struct TxRecord {
    id: TransactionId,
    mode: TransactionMode,
    mutations: Vec<Mutation>,
    committed: bool,
    rolled_back: bool,
}

#[derive(Default)]
struct MockState {
    query_results: HashMap<String, ResultSet>,
    update_counts: HashMap<String, i64>,
    partitioned_counts: HashMap<String, i64>,
    /// Statement failures keyed by SQL: (code, remaining trigger count).
    statement_failures: HashMap<String, (ErrorCode, u32)>,
    /// Number of upcoming commits that abort.
    commit_aborts: u32,
    ddl_failure: Option<ErrorCode>,
    latency: Option<Duration>,
    transactions: Vec<TxRecord>,
    committed_mutations: Vec<Mutation>,
    ddl_batches: Vec<Vec<String>>,
    statement_log: Vec<String>,
}

/// In-memory implementation of [`DatabaseClient`] and [`DdlClient`] with
/// scripted results, fault injection and call recording.
#[derive(Default)]
pub struct MockDatabase {
    state: Mutex<MockState>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the rows returned for a query.
    pub fn put_result(&self, sql: impl Into<String>, result: ResultSet) {
        self.state.lock().query_results.insert(sql.into(), result);
    }

    /// Script the affected-row count returned for an update.
    pub fn put_update_count(&self, sql: impl Into<String>, count: i64) {
        self.state.lock().update_counts.insert(sql.into(), count);
    }

    /// Script the lower-bound row count returned for a partitioned update.
    pub fn put_partitioned_count(&self, sql: impl Into<String>, count: i64) {
        self.state
            .lock()
            .partitioned_counts
            .insert(sql.into(), count);
    }

    /// Fail the next `times` executions of `sql` with `code`.
    pub fn fail_statement(&self, sql: impl Into<String>, code: ErrorCode, times: u32) {
        self.state
            .lock()
            .statement_failures
            .insert(sql.into(), (code, times));
    }

    /// Abort the next `times` commits.
    pub fn abort_next_commits(&self, times: u32) {
        self.state.lock().commit_aborts = times;
    }

    /// Fail the next DDL submission with `code`.
    pub fn fail_next_ddl(&self, code: ErrorCode) {
        self.state.lock().ddl_failure = Some(code);
    }

    /// Delay every statement and commit by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    pub fn begun_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    pub fn committed_transactions(&self) -> usize {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.committed)
            .count()
    }

    pub fn rolled_back_transactions(&self) -> usize {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.rolled_back)
            .count()
    }

    /// Mutations applied by committed transactions, in commit order.
    pub fn committed_mutations(&self) -> Vec<Mutation> {
        self.state.lock().committed_mutations.clone()
    }

    /// The DDL batches submitted through the admin interface.
    pub fn ddl_batches(&self) -> Vec<Vec<String>> {
        self.state.lock().ddl_batches.clone()
    }

    /// Every executed statement, in execution order.
    pub fn statement_log(&self) -> Vec<String> {
        self.state.lock().statement_log.clone()
    }

    /// How many times `sql` has been executed.
    pub fn execution_count(&self, sql: &str) -> usize {
        self.state
            .lock()
            .statement_log
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    async fn apply_latency(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Take a scripted failure for `sql`, if one is armed.
    fn take_failure(state: &mut MockState, sql: &str) -> Option<Error> {
        if let Some((code, remaining)) = state.statement_failures.get_mut(sql) {
            if *remaining > 0 {
                *remaining -= 1;
                let code = *code;
                return Some(Error::new(code, format!("injected failure for: {}", sql)));
            }
        }
        None
    }

    fn resolve_read_timestamp(staleness: TimestampBound) -> Timestamp {
        match staleness {
            TimestampBound::Strong => Timestamp::now(),
            TimestampBound::ExactStaleness(d) => Timestamp::now().saturating_sub(d),
            TimestampBound::ReadTimestamp(ts) => ts,
            // The server may pick any timestamp within the bound; the mock
            // picks the freshest one.
            TimestampBound::MaxStaleness(_) | TimestampBound::MinReadTimestamp(_) => {
                Timestamp::now()
            }
        }
    }

    fn run_statement(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.statement_log.push(sql.to_string());
        match Self::take_failure(&mut state, sql) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn tx_position(state: &MockState, tx: &TxHandle) -> Result<usize> {
        state
            .transactions
            .iter()
            .position(|t| t.id == tx.id)
            .ok_or_else(|| Error::not_found(format!("unknown transaction: {}", tx.id)))
    }
}

#[async_trait]
impl DatabaseClient for MockDatabase {
    async fn begin_transaction(
        &self,
        mode: TransactionMode,
        staleness: TimestampBound,
    ) -> Result<TxHandle> {
        let id = TransactionId::new();
        let read_timestamp = match mode {
            TransactionMode::ReadOnly => Some(Self::resolve_read_timestamp(staleness)),
            TransactionMode::ReadWrite => None,
        };
        self.state.lock().transactions.push(TxRecord {
            id,
            mode,
            mutations: Vec::new(),
            committed: false,
            rolled_back: false,
        });
        Ok(TxHandle { id, read_timestamp })
    }

    async fn execute_query(
        &self,
        tx: &TxHandle,
        statement: &Statement,
        _options: &QueryOptions,
        _analyze: AnalyzeMode,
    ) -> Result<ResultSet> {
        self.apply_latency().await;
        self.run_statement(statement.sql())?;
        let state = self.state.lock();
        Self::tx_position(&state, tx)?;
        Ok(state
            .query_results
            .get(statement.sql())
            .cloned()
            .unwrap_or_default())
    }

    async fn single_use_query(
        &self,
        staleness: TimestampBound,
        statement: &Statement,
        _options: &QueryOptions,
        _analyze: AnalyzeMode,
    ) -> Result<(ResultSet, Timestamp)> {
        self.apply_latency().await;
        self.run_statement(statement.sql())?;
        let state = self.state.lock();
        let result = state
            .query_results
            .get(statement.sql())
            .cloned()
            .unwrap_or_default();
        Ok((result, Self::resolve_read_timestamp(staleness)))
    }

    async fn execute_update(&self, tx: &TxHandle, statement: &Statement) -> Result<i64> {
        self.apply_latency().await;
        self.run_statement(statement.sql())?;
        let state = self.state.lock();
        Self::tx_position(&state, tx)?;
        Ok(state
            .update_counts
            .get(statement.sql())
            .copied()
            .unwrap_or(0))
    }

    async fn execute_batch_update(
        &self,
        tx: &TxHandle,
        statements: &[Statement],
    ) -> Result<Vec<i64>> {
        self.apply_latency().await;
        let mut counts = Vec::with_capacity(statements.len());
        for statement in statements {
            self.run_statement(statement.sql())?;
            let state = self.state.lock();
            Self::tx_position(&state, tx)?;
            counts.push(
                state
                    .update_counts
                    .get(statement.sql())
                    .copied()
                    .unwrap_or(0),
            );
        }
        Ok(counts)
    }

    async fn write(&self, tx: &TxHandle, mutations: &[Mutation]) -> Result<()> {
        let mut state = self.state.lock();
        let position = Self::tx_position(&state, tx)?;
        state.transactions[position]
            .mutations
            .extend_from_slice(mutations);
        Ok(())
    }

    async fn commit(&self, tx: &TxHandle) -> Result<Timestamp> {
        self.apply_latency().await;
        let mut state = self.state.lock();
        let position = Self::tx_position(&state, tx)?;
        if state.commit_aborts > 0 {
            state.commit_aborts -= 1;
            state.transactions[position].rolled_back = true;
            return Err(Error::aborted("transaction aborted by server"));
        }
        let record = &mut state.transactions[position];
        record.committed = true;
        let mutations = std::mem::take(&mut record.mutations);
        state.committed_mutations.extend(mutations);
        Ok(Timestamp::now())
    }

    async fn rollback(&self, tx: &TxHandle) -> Result<()> {
        let mut state = self.state.lock();
        let position = Self::tx_position(&state, tx)?;
        state.transactions[position].rolled_back = true;
        Ok(())
    }

    async fn partitioned_update(&self, statement: &Statement) -> Result<i64> {
        self.apply_latency().await;
        self.run_statement(statement.sql())?;
        let state = self.state.lock();
        Ok(state
            .partitioned_counts
            .get(statement.sql())
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl DdlClient for MockDatabase {
    async fn update_database_ddl(&self, statements: &[Statement]) -> Result<()> {
        self.apply_latency().await;
        let mut state = self.state.lock();
        if let Some(code) = state.ddl_failure.take() {
            return Err(Error::new(code, "injected DDL failure"));
        }
        state
            .ddl_batches
            .push(statements.iter().map(|s| s.sql().to_string()).collect());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::Value;

    #[tokio::test]
    async fn test_scripted_query() {
        let db = MockDatabase::new();
        db.put_result("SELECT 1", ResultSet::single_column("1", Value::I64(1)));
        let (result, _) = db
            .single_use_query(
                TimestampBound::Strong,
                &Statement::new("SELECT 1"),
                &QueryOptions::default(),
                AnalyzeMode::None,
            )
            .await
            .unwrap();
        assert_eq!(result.single_value(), Some(&Value::I64(1)));
    }

    #[tokio::test]
    async fn test_commit_abort_injection() {
        let db = MockDatabase::new();
        db.abort_next_commits(1);
        let tx = db
            .begin_transaction(TransactionMode::ReadWrite, TimestampBound::Strong)
            .await
            .unwrap();
        let err = db.commit(&tx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Aborted);

        let tx = db
            .begin_transaction(TransactionMode::ReadWrite, TimestampBound::Strong)
            .await
            .unwrap();
        db.commit(&tx).await.unwrap();
        assert_eq!(db.committed_transactions(), 1);
    }

    #[tokio::test]
    async fn test_statement_failure_decrements() {
        let db = MockDatabase::new();
        db.fail_statement("UPDATE t SET x = 1", ErrorCode::Aborted, 1);
        let tx = db
            .begin_transaction(TransactionMode::ReadWrite, TimestampBound::Strong)
            .await
            .unwrap();
        let statement = Statement::new("UPDATE t SET x = 1");
        assert!(db.execute_update(&tx, &statement).await.is_err());
        assert!(db.execute_update(&tx, &statement).await.is_ok());
        assert_eq!(db.execution_count("UPDATE t SET x = 1"), 2);
    }

    #[tokio::test]
    async fn test_mutations_applied_at_commit() {
        let db = MockDatabase::new();
        let tx = db
            .begin_transaction(TransactionMode::ReadWrite, TimestampBound::Strong)
            .await
            .unwrap();
        let mutation = Mutation::Insert {
            table: "t".to_string(),
            columns: vec!["id".to_string()],
            values: vec![Value::I64(1)],
        };
        db.write(&tx, std::slice::from_ref(&mutation)).await.unwrap();
        assert!(db.committed_mutations().is_empty());
        db.commit(&tx).await.unwrap();
        assert_eq!(db.committed_mutations(), vec![mutation]);
    }
}
