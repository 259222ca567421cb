//! Database and admin client traits

use async_trait::async_trait;
use meridian_common::{
    AnalyzeMode, Mutation, QueryOptions, Result, Statement, Timestamp, TimestampBound,
    TransactionId, TransactionMode,
};

use crate::result::ResultSet;

/// Handle to a server-side transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub id: TransactionId,
    /// The read timestamp assigned by the server; only present for
    /// read-only transactions.
    pub read_timestamp: Option<Timestamp>,
}

/// The database RPC client the connection executes statements through.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn begin_transaction(
        &self,
        mode: TransactionMode,
        staleness: TimestampBound,
    ) -> Result<TxHandle>;

    async fn execute_query(
        &self,
        tx: &TxHandle,
        statement: &Statement,
        options: &QueryOptions,
        analyze: AnalyzeMode,
    ) -> Result<ResultSet>;

    /// One-shot read at the given staleness; returns the rows and the read
    /// timestamp the server chose.
    async fn single_use_query(
        &self,
        staleness: TimestampBound,
        statement: &Statement,
        options: &QueryOptions,
        analyze: AnalyzeMode,
    ) -> Result<(ResultSet, Timestamp)>;

    async fn execute_update(&self, tx: &TxHandle, statement: &Statement) -> Result<i64>;

    async fn execute_batch_update(
        &self,
        tx: &TxHandle,
        statements: &[Statement],
    ) -> Result<Vec<i64>>;

    /// Buffer mutations in the transaction; they are applied at commit.
    async fn write(&self, tx: &TxHandle, mutations: &[Mutation]) -> Result<()>;

    async fn commit(&self, tx: &TxHandle) -> Result<Timestamp>;

    async fn rollback(&self, tx: &TxHandle) -> Result<()>;

    /// Execute a partitioned DML statement; the result is a lower bound on
    /// the number of affected rows.
    async fn partitioned_update(&self, statement: &Statement) -> Result<i64>;
}

/// The admin client DDL statements are submitted through.
#[async_trait]
pub trait DdlClient: Send + Sync {
    /// Apply all statements as a single schema-change operation.
    async fn update_database_ddl(&self, statements: &[Statement]) -> Result<()>;
}
