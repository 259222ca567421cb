//! End-to-end tests of the connection controller against the mock backend

use meridian_common::{
    AnalyzeMode, AutocommitDmlMode, ErrorCode, Mutation, Statement, TimeUnit, TimestampBound,
    TransactionMode, Value,
};
use meridian_connection::{Connection, RetryEvent, StatementResult, TransactionRetryListener};
use meridian_engine::{Backend, ConnectionConfig, MockDatabase, ResultSet, SessionPool};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn open_connection(config: ConnectionConfig) -> (Connection, Arc<MockDatabase>, Arc<SessionPool>) {
    let db = Arc::new(MockDatabase::new());
    let pool = {
        let db = db.clone();
        SessionPool::new(move |_| Backend {
            database: db.clone(),
            admin: db.clone(),
        })
    };
    let connection = Connection::open_with(config, pool.clone());
    (connection, db, pool)
}

fn autocommit_connection() -> (Connection, Arc<MockDatabase>) {
    let (connection, db, _) = open_connection(ConnectionConfig::new("test-db"));
    (connection, db)
}

fn transactional_connection() -> (Connection, Arc<MockDatabase>) {
    let (connection, db, _) =
        open_connection(ConnectionConfig::new("test-db").with_autocommit(false));
    (connection, db)
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<RetryEvent>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<RetryEvent> {
        self.events.lock().clone()
    }
}

impl TransactionRetryListener for RecordingListener {
    fn on_retry(&self, event: RetryEvent) {
        self.events.lock().push(event);
    }
}

#[tokio::test]
async fn test_autocommit_select_returns_rows_without_transaction() {
    let (connection, db) = autocommit_connection();
    db.put_result("SELECT 1", ResultSet::single_column("1", Value::I64(1)));

    let result = connection.execute("SELECT 1").await.unwrap();
    let rows = result.result_set().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.single_value(), Some(&Value::I64(1)));
    assert!(!connection.is_transaction_started().unwrap());
    connection.close().await;
}

#[tokio::test]
async fn test_explicit_transaction_commit_reports_stable_commit_timestamp() {
    let (connection, db) = autocommit_connection();
    db.put_update_count("INSERT INTO t (id) VALUES (1)", 3);
    db.put_update_count("INSERT INTO t (id) VALUES (2)", 2);

    connection.begin_transaction().unwrap();
    assert_eq!(
        connection
            .execute_update("INSERT INTO t (id) VALUES (1)")
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        connection
            .execute_update("INSERT INTO t (id) VALUES (2)")
            .await
            .unwrap(),
        2
    );
    connection.commit().await.unwrap();

    let first = connection.commit_timestamp().unwrap();
    let second = connection.commit_timestamp().unwrap();
    assert_eq!(first, second);

    // A new transaction resets the reported commit timestamp.
    connection.begin_transaction().unwrap();
    assert!(connection.commit_timestamp().is_err());
    connection.rollback().await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_ddl_batch_submits_all_statements_as_one_operation() {
    let (connection, db) = autocommit_connection();
    connection.start_batch_ddl().unwrap();
    assert!(connection.is_ddl_batch_active().unwrap());

    connection
        .execute("CREATE TABLE a (id INT64)")
        .await
        .unwrap();
    connection
        .execute("CREATE TABLE b (id INT64)")
        .await
        .unwrap();
    // Nothing reaches the admin service until the batch runs.
    assert!(db.ddl_batches().is_empty());

    connection.run_batch().await.unwrap();
    assert_eq!(
        db.ddl_batches(),
        vec![vec![
            "CREATE TABLE a (id INT64)".to_string(),
            "CREATE TABLE b (id INT64)".to_string(),
        ]]
    );
    assert!(!connection.is_ddl_batch_active().unwrap());
    connection.close().await;
}

#[tokio::test]
async fn test_max_staleness_works_in_autocommit_and_resets_on_leaving_it() {
    let (connection, db) = autocommit_connection();
    connection
        .set_read_only_staleness(TimestampBound::MaxStaleness(Duration::from_secs(5)))
        .unwrap();
    db.put_result("SELECT x FROM t", ResultSet::single_column("x", Value::I64(9)));
    connection.execute_query("SELECT x FROM t").await.unwrap();

    connection.set_autocommit(false).unwrap();
    assert_eq!(
        connection.read_only_staleness().unwrap(),
        TimestampBound::Strong
    );
    connection.close().await;
}

#[tokio::test]
async fn test_aborted_commit_is_replayed_and_succeeds() {
    let (connection, db) = transactional_connection();
    let listener = Arc::new(RecordingListener::default());
    connection
        .add_transaction_retry_listener(listener.clone())
        .unwrap();

    db.put_update_count("UPDATE t SET x = 1", 1);
    db.abort_next_commits(1);

    assert_eq!(
        connection.execute_update("UPDATE t SET x = 1").await.unwrap(),
        1
    );
    connection.commit().await.unwrap();

    assert_eq!(
        listener.events(),
        vec![
            RetryEvent::Started { attempt: 1 },
            RetryEvent::Succeeded { attempt: 1 },
        ]
    );
    // The statement ran once in the original transaction and once in the
    // replay.
    assert_eq!(db.execution_count("UPDATE t SET x = 1"), 2);
    assert_eq!(db.committed_transactions(), 1);
    connection.close().await;
}

#[tokio::test]
async fn test_cancel_from_another_task_leaves_connection_usable() {
    let (connection, db) = autocommit_connection();
    let connection = Arc::new(connection);
    db.set_latency(Duration::from_millis(500));
    db.put_result("SELECT slow", ResultSet::single_column("s", Value::I64(1)));

    let canceller = {
        let connection = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            connection.cancel().unwrap();
        })
    };
    let err = connection.execute_query("SELECT slow").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);
    canceller.await.unwrap();

    db.set_latency(Duration::ZERO);
    let rows = connection.execute_query("SELECT slow").await.unwrap();
    assert_eq!(rows.single_value(), Some(&Value::I64(1)));
    connection.close().await;
}

#[tokio::test]
async fn test_closed_connection_fails_everything_but_is_closed() {
    let (connection, _db) = autocommit_connection();
    connection.close().await;
    assert!(connection.is_closed());

    let err = connection.execute("SELECT 1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    assert_eq!(
        connection.set_autocommit(false).unwrap_err().code(),
        ErrorCode::FailedPrecondition
    );
    assert_eq!(
        connection.begin_transaction().unwrap_err().code(),
        ErrorCode::FailedPrecondition
    );
    assert_eq!(
        connection.commit().await.unwrap_err().code(),
        ErrorCode::FailedPrecondition
    );
    assert_eq!(
        connection.cancel().unwrap_err().code(),
        ErrorCode::FailedPrecondition
    );

    // Repeated close is a no-op.
    connection.close().await;
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_mode_setters_fail_while_batch_is_active() {
    let (connection, _db) = autocommit_connection();
    connection.start_batch_ddl().unwrap();

    for err in [
        connection.set_autocommit(false).unwrap_err(),
        connection.set_read_only(true).unwrap_err(),
        connection
            .set_autocommit_dml_mode(AutocommitDmlMode::PartitionedNonAtomic)
            .unwrap_err(),
        connection
            .set_read_only_staleness(TimestampBound::Strong)
            .unwrap_err(),
        connection.set_retry_aborts_internally(false).unwrap_err(),
    ] {
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }
    connection.abort_batch().unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_read_only_transaction_keeps_one_read_timestamp() {
    let (connection, db, _) = open_connection(
        ConnectionConfig::new("test-db")
            .with_autocommit(false)
            .with_read_only(true),
    );
    db.put_result("SELECT a", ResultSet::single_column("a", Value::I64(1)));
    db.put_result("SELECT b", ResultSet::single_column("b", Value::I64(2)));

    connection.execute_query("SELECT a").await.unwrap();
    let first = connection.read_timestamp().unwrap();
    connection.execute_query("SELECT b").await.unwrap();
    let second = connection.read_timestamp().unwrap();
    assert_eq!(first, second);
    assert_eq!(db.begun_transactions(), 1);

    connection.commit().await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_rollback_restores_pre_begin_mode_state() {
    let (connection, db) = autocommit_connection();
    db.put_result("SELECT 1", ResultSet::single_column("1", Value::I64(1)));

    let autocommit_before = connection.is_autocommit().unwrap();
    let read_only_before = connection.is_read_only().unwrap();
    let staleness_before = connection.read_only_staleness().unwrap();

    connection.begin_transaction().unwrap();
    connection.execute_query("SELECT 1").await.unwrap();
    connection.rollback().await.unwrap();

    assert_eq!(connection.is_autocommit().unwrap(), autocommit_before);
    assert_eq!(connection.is_read_only().unwrap(), read_only_before);
    assert_eq!(connection.read_only_staleness().unwrap(), staleness_before);
    assert!(!connection.is_in_transaction().unwrap());
    assert!(!connection.is_transaction_started().unwrap());
    connection.close().await;
}

#[tokio::test]
async fn test_bounded_staleness_requires_autocommit() {
    let (connection, _db) = transactional_connection();
    let err = connection
        .set_read_only_staleness(TimestampBound::MaxStaleness(Duration::from_secs(5)))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);

    let err = connection
        .set_read_only_staleness(TimestampBound::MinReadTimestamp(
            meridian_common::Timestamp::now(),
        ))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    connection.close().await;
}

#[tokio::test]
async fn test_read_write_mode_rejected_on_read_only_connection() {
    let (connection, _db, _) = open_connection(
        ConnectionConfig::new("test-db")
            .with_autocommit(false)
            .with_read_only(true),
    );
    let err = connection
        .set_transaction_mode(TransactionMode::ReadWrite)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    connection.close().await;
}

#[tokio::test]
async fn test_start_batch_dml_rejected_in_read_only_transaction() {
    let (connection, _db) = autocommit_connection();
    connection.begin_transaction().unwrap();
    connection
        .set_transaction_mode(TransactionMode::ReadOnly)
        .unwrap();
    let err = connection.start_batch_dml().unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    connection.close().await;
}

#[tokio::test]
async fn test_batch_update_with_non_update_statement_rejects_whole_batch() {
    let (connection, db) = autocommit_connection();
    let err = connection
        .execute_batch_update(vec![
            Statement::new("UPDATE t SET x = 1"),
            Statement::new("SELECT 1"),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    // Nothing was executed.
    assert!(db.statement_log().is_empty());
    connection.close().await;
}

#[tokio::test]
async fn test_divergent_replay_surfaces_aborted_and_notifies_listeners() {
    let (connection, db) = transactional_connection();
    let listener = Arc::new(RecordingListener::default());
    connection
        .add_transaction_retry_listener(listener.clone())
        .unwrap();

    db.put_update_count("UPDATE t SET x = 1", 3);
    assert_eq!(
        connection.execute_update("UPDATE t SET x = 1").await.unwrap(),
        3
    );

    // A concurrent writer changes what the statement affects, then the
    // commit aborts: the replay sees a different row count.
    db.put_update_count("UPDATE t SET x = 1", 4);
    db.abort_next_commits(1);

    let err = connection.commit().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert_eq!(
        listener.events(),
        vec![
            RetryEvent::Started { attempt: 1 },
            RetryEvent::DifferentResult { attempt: 1 },
        ]
    );
    connection.close().await;
}

#[tokio::test]
async fn test_abort_without_internal_retry_is_surfaced() {
    let (connection, db, _) = open_connection(
        ConnectionConfig::new("test-db")
            .with_autocommit(false)
            .with_retry_aborts_internally(false),
    );
    let listener = Arc::new(RecordingListener::default());
    connection
        .add_transaction_retry_listener(listener.clone())
        .unwrap();

    db.put_update_count("UPDATE t SET x = 1", 1);
    db.abort_next_commits(1);
    connection.execute_update("UPDATE t SET x = 1").await.unwrap();

    let err = connection.commit().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert!(listener.events().is_empty());
    assert_eq!(db.execution_count("UPDATE t SET x = 1"), 1);
    connection.close().await;
}

#[tokio::test]
async fn test_statement_timeout_fails_statement_but_not_connection() {
    let (connection, db) = autocommit_connection();
    db.put_result("SELECT slow", ResultSet::single_column("s", Value::I64(1)));
    db.set_latency(Duration::from_millis(500));
    connection
        .set_statement_timeout(50, TimeUnit::Milliseconds)
        .unwrap();

    let err = connection.execute_query("SELECT slow").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeadlineExceeded);

    db.set_latency(Duration::ZERO);
    connection.clear_statement_timeout().unwrap();
    let rows = connection.execute_query("SELECT slow").await.unwrap();
    assert_eq!(rows.single_value(), Some(&Value::I64(1)));
    connection.close().await;
}

#[tokio::test]
async fn test_dml_batch_runs_inside_host_transaction() {
    let (connection, db) = transactional_connection();
    db.put_update_count("INSERT INTO t (id) VALUES (1)", 1);
    db.put_update_count("INSERT INTO t (id) VALUES (2)", 1);

    connection.start_batch_dml().unwrap();
    assert!(connection.is_dml_batch_active().unwrap());

    // Queued statements report an unknown row count until the batch runs.
    assert_eq!(
        connection
            .execute_update("INSERT INTO t (id) VALUES (1)")
            .await
            .unwrap(),
        -1
    );
    assert_eq!(
        connection
            .execute_update("INSERT INTO t (id) VALUES (2)")
            .await
            .unwrap(),
        -1
    );
    // Queries are not allowed while the batch shadows the transaction.
    let err = connection.execute_query("SELECT 1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);

    let counts = connection.run_batch().await.unwrap();
    assert_eq!(counts, vec![1, 1]);
    assert!(!connection.is_dml_batch_active().unwrap());

    // The host transaction is restored and can commit the batched work.
    connection.commit().await.unwrap();
    assert_eq!(db.committed_transactions(), 1);
    connection.close().await;
}

#[tokio::test]
async fn test_dml_batch_in_autocommit_commits_when_run() {
    let (connection, db) = autocommit_connection();
    db.put_update_count("INSERT INTO t (id) VALUES (1)", 1);

    connection.start_batch_dml().unwrap();
    assert_eq!(
        connection
            .execute_update("INSERT INTO t (id) VALUES (1)")
            .await
            .unwrap(),
        -1
    );
    let counts = connection.run_batch().await.unwrap();
    assert_eq!(counts, vec![1]);
    // The single-use host committed the batch immediately.
    assert_eq!(db.committed_transactions(), 1);
    assert!(!connection.is_transaction_started().unwrap());
    connection.close().await;
}

#[tokio::test]
async fn test_statement_timeout_directives_round_trip() {
    let (connection, _db) = autocommit_connection();
    connection
        .execute("SET STATEMENT_TIMEOUT = '10ms'")
        .await
        .unwrap();
    let shown = connection.execute("SHOW STATEMENT_TIMEOUT").await.unwrap();
    assert_eq!(
        shown.result_set().unwrap().single_value(),
        Some(&Value::Str("10ms".to_string()))
    );

    connection
        .execute("SET STATEMENT_TIMEOUT = NULL")
        .await
        .unwrap();
    let shown = connection.execute("SHOW STATEMENT_TIMEOUT").await.unwrap();
    assert_eq!(shown.result_set().unwrap().single_value(), Some(&Value::Null));

    let shown = connection
        .execute("SHOW READ_ONLY_STALENESS")
        .await
        .unwrap();
    assert_eq!(
        shown.result_set().unwrap().single_value(),
        Some(&Value::Str("STRONG".to_string()))
    );
    connection.close().await;
}

#[tokio::test]
async fn test_control_directives_drive_the_connection() {
    let (connection, db) = autocommit_connection();
    db.put_update_count("UPDATE t SET x = 1", 5);

    let shown = connection.execute("SHOW AUTOCOMMIT").await.unwrap();
    assert_eq!(
        shown.result_set().unwrap().single_value(),
        Some(&Value::Bool(true))
    );

    connection.execute("SET AUTOCOMMIT = FALSE").await.unwrap();
    assert!(!connection.is_autocommit().unwrap());

    connection.execute("BEGIN").await.unwrap();
    let err = connection.execute("BEGIN").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    // Nothing has executed, so COMMIT completes immediately and clears the
    // begin marker.
    connection.execute("COMMIT").await.unwrap();

    connection.execute("SET AUTOCOMMIT = TRUE").await.unwrap();
    connection.execute("BEGIN").await.unwrap();
    let result = connection.execute("UPDATE t SET x = 1").await.unwrap();
    assert_eq!(result.update_count().unwrap(), 5);
    connection.execute("COMMIT").await.unwrap();
    assert!(connection.commit_timestamp().is_ok());

    let shown = connection.execute("SHOW COMMIT_TIMESTAMP").await.unwrap();
    assert!(matches!(
        shown.result_set().unwrap().single_value(),
        Some(Value::Timestamp(_))
    ));
    connection.close().await;
}

#[tokio::test]
async fn test_write_applies_mutations_in_autocommit() {
    let (connection, db) = autocommit_connection();
    let mutation = Mutation::Insert {
        table: "t".to_string(),
        columns: vec!["id".to_string()],
        values: vec![Value::I64(1)],
    };
    connection.write(vec![mutation.clone()]).await.unwrap();
    assert_eq!(db.committed_mutations(), vec![mutation]);

    // Buffered writes are for transactions only.
    let err = connection
        .buffered_write(vec![Mutation::Delete {
            table: "t".to_string(),
            key: vec![Value::I64(1)],
        }])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    connection.close().await;
}

#[tokio::test]
async fn test_buffered_write_is_applied_at_commit() {
    let (connection, db) = transactional_connection();
    let mutation = Mutation::InsertOrUpdate {
        table: "t".to_string(),
        columns: vec!["id".to_string()],
        values: vec![Value::I64(7)],
    };
    connection.buffered_write(vec![mutation.clone()]).await.unwrap();
    assert!(db.committed_mutations().is_empty());

    connection.commit().await.unwrap();
    assert_eq!(db.committed_mutations(), vec![mutation]);
    connection.close().await;
}

#[tokio::test]
async fn test_partitioned_dml_reports_lower_bound_count() {
    let (connection, db) = autocommit_connection();
    connection
        .set_autocommit_dml_mode(AutocommitDmlMode::PartitionedNonAtomic)
        .unwrap();
    db.put_partitioned_count("UPDATE big SET x = 0", 100_000);

    let count = connection
        .execute_update("UPDATE big SET x = 0")
        .await
        .unwrap();
    assert_eq!(count, 100_000);
    // Partitioned DML has no commit timestamp.
    assert!(connection.commit_timestamp().is_err());
    connection.close().await;
}

#[tokio::test]
async fn test_transactional_with_retry_replays_aborted_autocommit_update() {
    let (connection, db) = autocommit_connection();
    connection
        .set_autocommit_dml_mode(AutocommitDmlMode::TransactionalWithRetry)
        .unwrap();
    db.put_update_count("UPDATE t SET x = 2", 2);
    db.abort_next_commits(1);

    let count = connection.execute_update("UPDATE t SET x = 2").await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(db.execution_count("UPDATE t SET x = 2"), 2);
    connection.close().await;
}

#[tokio::test]
async fn test_unknown_statement_is_rejected() {
    let (connection, _db) = autocommit_connection();
    let err = connection.execute("GRANT ALL ON t TO role").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    connection.close().await;
}

#[tokio::test]
async fn test_cancel_on_idle_connection_is_noop() {
    let (connection, db) = autocommit_connection();
    db.put_result("SELECT 1", ResultSet::single_column("1", Value::I64(1)));
    connection.execute_query("SELECT 1").await.unwrap();
    // The last unit of work is terminal; cancelling it does nothing.
    connection.cancel().unwrap();
    connection.execute_query("SELECT 1").await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_close_releases_the_pooled_backend() {
    let config = ConnectionConfig::new("pooled-db");
    let (connection, _db, pool) = open_connection(config.clone());
    assert_eq!(pool.owner_count(&config), 1);
    connection.close().await;
    assert_eq!(pool.owner_count(&config), 0);
}

#[tokio::test]
async fn test_analyze_query_requires_plan_or_profile() {
    let (connection, db) = autocommit_connection();
    db.put_result("SELECT 1", ResultSet::single_column("1", Value::I64(1)));
    let err = connection
        .analyze_query("SELECT 1", AnalyzeMode::None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    connection
        .analyze_query("SELECT 1", AnalyzeMode::Plan)
        .await
        .unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_execute_query_rejects_updates_and_runs_show() {
    let (connection, _db) = autocommit_connection();
    let err = connection
        .execute_query("UPDATE t SET x = 1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let rows = connection.execute_query("SHOW READ_ONLY").await.unwrap();
    assert_eq!(rows.single_value(), Some(&Value::Bool(false)));
    connection.close().await;
}

#[tokio::test]
async fn test_statement_results_expose_their_kind() {
    let (connection, db) = autocommit_connection();
    db.put_update_count("DELETE FROM t", 4);
    let result = connection.execute("DELETE FROM t").await.unwrap();
    assert_eq!(result, StatementResult::UpdateCount(4));

    let result = connection
        .execute("CREATE TABLE t (id INT64)")
        .await
        .unwrap();
    assert!(result.is_no_result());
    connection.close().await;
}
