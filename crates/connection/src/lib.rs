//! Connection controller for a managed distributed SQL database
//!
//! A [`Connection`] is the single stateful handle through which a client
//! submits SQL statements, mutations and control directives. Each statement
//! is transparently routed to the right execution vehicle: a one-shot
//! autocommit statement, a read-only snapshot, a read/write transaction with
//! internal replay of server aborts, or a DDL/DML batch.

mod client_executor;
mod connection;
mod executor;
mod retry;
mod statement_result;
mod transaction;

pub use connection::Connection;
pub use executor::{
    CancelToken, StatementExecutionInterceptor, StatementExecutor, StatementHandle,
    StatementTimeout,
};
pub use retry::{RetryEvent, TransactionRetryListener};
pub use statement_result::StatementResult;
pub use transaction::{UnitOfWork, UnitOfWorkState};
