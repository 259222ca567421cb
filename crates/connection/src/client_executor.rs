//! Maps client-side control directives onto connection calls
//!
//! `SET AUTOCOMMIT = TRUE` becomes `connection.set_autocommit(true)`, and so
//! on. SHOW directives produce a single-row result set; everything else
//! produces no result.

use meridian_common::{Result, Value};
use meridian_engine::ResultSet;
use meridian_sql::ClientSideStatement;

use crate::connection::Connection;
use crate::executor::StatementHandle;
use crate::statement_result::StatementResult;

/// Whether a directive produces a row set when executed.
pub(crate) fn returns_result_set(statement: &ClientSideStatement) -> bool {
    matches!(
        statement,
        ClientSideStatement::ShowAutocommit
            | ClientSideStatement::ShowReadOnly
            | ClientSideStatement::ShowAutocommitDmlMode
            | ClientSideStatement::ShowStatementTimeout
            | ClientSideStatement::ShowReadOnlyStaleness
            | ClientSideStatement::ShowOptimizerVersion
            | ClientSideStatement::ShowRetryAbortsInternally
            | ClientSideStatement::ShowReadTimestamp
            | ClientSideStatement::ShowCommitTimestamp
    )
}

pub(crate) fn execute(
    connection: &Connection,
    statement: &ClientSideStatement,
) -> StatementHandle<StatementResult> {
    use ClientSideStatement::*;

    fn show(column: &str, value: Value) -> Result<StatementResult> {
        Ok(StatementResult::ResultSet(ResultSet::single_column(
            column, value,
        )))
    }

    fn done(result: Result<()>) -> Result<StatementResult> {
        result.map(|()| StatementResult::NoResult)
    }

    let immediate = match statement {
        ShowAutocommit => connection
            .is_autocommit()
            .and_then(|v| show("AUTOCOMMIT", Value::Bool(v))),
        SetAutocommit(value) => done(connection.set_autocommit(*value)),
        ShowReadOnly => connection
            .is_read_only()
            .and_then(|v| show("READ_ONLY", Value::Bool(v))),
        SetReadOnly(value) => done(connection.set_read_only(*value)),
        ShowAutocommitDmlMode => connection
            .autocommit_dml_mode()
            .and_then(|v| show("AUTOCOMMIT_DML_MODE", Value::Str(v.to_string()))),
        SetAutocommitDmlMode(mode) => done(connection.set_autocommit_dml_mode(*mode)),
        ShowStatementTimeout => connection.statement_timeout().and_then(|timeout| {
            let value = match timeout.get() {
                Some(_) => Value::Str(timeout.to_string()),
                None => Value::Null,
            };
            show("STATEMENT_TIMEOUT", value)
        }),
        SetStatementTimeout(Some((value, unit))) => {
            done(connection.set_statement_timeout(*value, *unit))
        }
        SetStatementTimeout(None) => done(connection.clear_statement_timeout()),
        ShowReadOnlyStaleness => connection
            .read_only_staleness()
            .and_then(|v| show("READ_ONLY_STALENESS", Value::Str(v.to_string()))),
        SetReadOnlyStaleness(staleness) => done(connection.set_read_only_staleness(*staleness)),
        ShowOptimizerVersion => connection.optimizer_version().and_then(|v| {
            show(
                "OPTIMIZER_VERSION",
                v.map(Value::Str).unwrap_or(Value::Null),
            )
        }),
        SetOptimizerVersion(version) => done(connection.set_optimizer_version(version.clone())),
        ShowRetryAbortsInternally => connection
            .is_retry_aborts_internally()
            .and_then(|v| show("RETRY_ABORTS_INTERNALLY", Value::Bool(v))),
        SetRetryAbortsInternally(value) => done(connection.set_retry_aborts_internally(*value)),
        ShowReadTimestamp => connection.read_timestamp_or_none().and_then(|ts| {
            show(
                "READ_TIMESTAMP",
                ts.map(Value::Timestamp).unwrap_or(Value::Null),
            )
        }),
        ShowCommitTimestamp => connection.commit_timestamp_or_none().and_then(|ts| {
            show(
                "COMMIT_TIMESTAMP",
                ts.map(Value::Timestamp).unwrap_or(Value::Null),
            )
        }),
        Begin(mode) => done((|| {
            connection.begin_transaction()?;
            if let Some(mode) = mode {
                connection.set_transaction_mode(*mode)?;
            }
            Ok(())
        })()),
        SetTransactionMode(mode) => done(connection.set_transaction_mode(*mode)),
        StartBatchDdl => done(connection.start_batch_ddl()),
        StartBatchDml => done(connection.start_batch_dml()),
        AbortBatch => done(connection.abort_batch()),
        // The remaining directives delegate to an asynchronous operation.
        Commit => {
            return connection
                .commit_async()
                .map(|()| StatementResult::NoResult);
        }
        Rollback => {
            return connection
                .rollback_async()
                .map(|()| StatementResult::NoResult);
        }
        RunBatch => {
            return connection
                .run_batch_async()
                .map(|_| StatementResult::NoResult);
        }
    };
    StatementHandle::ready(immediate)
}
