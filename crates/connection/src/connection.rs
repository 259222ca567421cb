//! The connection controller
//!
//! A connection is a single stateful handle through which SQL statements,
//! mutations and control directives are submitted. It owns the mode flags
//! (autocommit, read-only, staleness, batch mode, timeouts) and decides
//! which unit of work executes each statement.
//!
//! A connection is not meant for concurrent statement execution: statements
//! are serialized on an internal single-worker executor and their futures
//! complete in submission order. `cancel` may be called from any thread.

use chrono::{DateTime, Utc};
use meridian_common::{
    AnalyzeMode, AutocommitDmlMode, Error, Mutation, QueryOptions, Result, Statement, TimeUnit,
    Timestamp, TimestampBound, TransactionMode,
};
use meridian_engine::{ConnectionConfig, DatabaseClient, DdlClient, ResultSet, SessionPool};
use meridian_sql::{ParsedStatement, StatementKind};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::client_executor;
use crate::executor::{
    StatementExecutionInterceptor, StatementExecutor, StatementHandle, StatementTimeout,
};
use crate::retry::TransactionRetryListener;
use crate::statement_result::StatementResult;
use crate::transaction::{
    DdlBatch, DmlBatch, ReadOnlyTransaction, ReadWriteTransaction, SingleUseTransaction,
    UnitOfWork, UnitOfWorkState,
};

const CLOSED_ERROR: &str = "this connection is closed";

/// How long `close` waits for in-flight work before aborting the worker.
const CLOSE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMode {
    None,
    Ddl,
    Dml,
}

/// The combination of transaction modes and batch modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOfWorkType {
    ReadOnlyTransaction,
    ReadWriteTransaction,
    DmlBatch,
    DdlBatch,
}

impl UnitOfWorkType {
    fn transaction_mode(self) -> Option<TransactionMode> {
        match self {
            UnitOfWorkType::ReadOnlyTransaction => Some(TransactionMode::ReadOnly),
            UnitOfWorkType::ReadWriteTransaction | UnitOfWorkType::DmlBatch => {
                Some(TransactionMode::ReadWrite)
            }
            UnitOfWorkType::DdlBatch => None,
        }
    }
}

/// Call-site marker recorded at construction and logged if the connection
/// is dropped without an explicit close.
struct LeakMarker {
    opened_at: DateTime<Utc>,
    thread: Option<String>,
}

struct ConnState {
    closed: bool,
    autocommit: bool,
    read_only: bool,
    autocommit_dml_mode: AutocommitDmlMode,
    read_only_staleness: TimestampBound,
    query_options: QueryOptions,
    statement_timeout: StatementTimeout,
    retry_aborts_internally: bool,
    batch_mode: BatchMode,
    unit_of_work_type: UnitOfWorkType,
    /// Only used in autocommit mode: an explicit transaction is running.
    in_transaction: bool,
    /// A BEGIN (or a mode setting that implies one) has been issued but no
    /// statement has executed yet.
    transaction_begin_marked: bool,
    current: Option<Arc<dyn UnitOfWork>>,
    /// The host transaction shadowed by an active DML batch. A single slot:
    /// deeper nesting is rejected.
    host: Option<Arc<dyn UnitOfWork>>,
}

impl ConnState {
    fn in_batch(&self) -> bool {
        self.batch_mode != BatchMode::None
    }

    fn is_in_transaction(&self) -> bool {
        self.batch_mode != BatchMode::Ddl && (!self.autocommit || self.in_transaction)
    }

    fn is_transaction_started(&self) -> bool {
        if self.autocommit && !self.in_transaction {
            return false;
        }
        self.is_in_transaction()
            && self
                .current
                .as_ref()
                .is_some_and(|uow| uow.state() == UnitOfWorkState::Started)
    }

    /// Reset to the default transaction options, or restore the host
    /// transaction after a DML batch.
    fn set_default_transaction_options(&mut self) {
        if self.host.is_none() {
            self.unit_of_work_type = if self.read_only {
                UnitOfWorkType::ReadOnlyTransaction
            } else {
                UnitOfWorkType::ReadWriteTransaction
            };
            self.batch_mode = BatchMode::None;
        } else {
            self.current = self.host.take();
        }
    }

    fn clear_transaction_and_set_defaults(&mut self) {
        self.set_default_transaction_options();
        self.current = None;
    }

    /// Preconditions shared by all mode setters.
    fn check_mode_mutable(&self, what: &str) -> Result<()> {
        if self.in_batch() {
            return Err(Error::failed_precondition(format!(
                "cannot set {} while in a batch",
                what
            )));
        }
        if self.is_transaction_started() {
            return Err(Error::failed_precondition(format!(
                "cannot set {} while a transaction is active",
                what
            )));
        }
        if self.autocommit && self.in_transaction {
            return Err(Error::failed_precondition(format!(
                "cannot set {} while in a temporary transaction",
                what
            )));
        }
        if self.transaction_begin_marked {
            return Err(Error::failed_precondition(format!(
                "cannot set {} when a transaction has begun",
                what
            )));
        }
        Ok(())
    }
}

/// A stateful handle to the database: routes every statement to the right
/// unit of work based on the connection's mode flags.
pub struct Connection {
    id: Uuid,
    config: ConnectionConfig,
    pool: Arc<SessionPool>,
    db: Arc<dyn DatabaseClient>,
    ddl: Arc<dyn DdlClient>,
    executor: Arc<StatementExecutor>,
    state: Mutex<ConnState>,
    listeners: Mutex<Vec<Arc<dyn TransactionRetryListener>>>,
    leak: Mutex<Option<LeakMarker>>,
}

impl Connection {
    /// Open a connection through the process-wide session pool.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        let pool = SessionPool::global().ok_or_else(|| {
            Error::failed_precondition("no global session pool has been initialized")
        })?;
        Ok(Self::open_with(config, pool))
    }

    /// Open a connection against an injected pool. This is the test seam;
    /// production code uses [`Connection::open`].
    pub fn open_with(config: ConnectionConfig, pool: Arc<SessionPool>) -> Self {
        Self::open_with_interceptors(config, pool, Vec::new())
    }

    pub fn open_with_interceptors(
        config: ConnectionConfig,
        pool: Arc<SessionPool>,
        interceptors: Vec<Arc<dyn StatementExecutionInterceptor>>,
    ) -> Self {
        let id = Uuid::new_v4();
        let backend = pool.acquire(&config, id);
        let unit_of_work_type = if config.read_only() {
            UnitOfWorkType::ReadOnlyTransaction
        } else {
            UnitOfWorkType::ReadWriteTransaction
        };
        let state = ConnState {
            closed: false,
            autocommit: config.autocommit(),
            read_only: config.read_only(),
            autocommit_dml_mode: AutocommitDmlMode::default(),
            read_only_staleness: TimestampBound::Strong,
            query_options: config.query_options().clone(),
            statement_timeout: StatementTimeout::default(),
            retry_aborts_internally: config.retry_aborts_internally(),
            batch_mode: BatchMode::None,
            unit_of_work_type,
            in_transaction: false,
            transaction_begin_marked: false,
            current: None,
            host: None,
        };
        let leak = LeakMarker {
            opened_at: Utc::now(),
            thread: std::thread::current().name().map(String::from),
        };
        Self {
            id,
            config,
            pool,
            db: backend.database,
            ddl: backend.admin,
            executor: StatementExecutor::new(interceptors),
            state: Mutex::new(state),
            listeners: Mutex::new(Vec::new()),
            leak: Mutex::new(Some(leak)),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ConnState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(Error::failed_precondition(CLOSED_ERROR));
        }
        Ok(state)
    }

    // ---- mode flags ----------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_autocommit(&self) -> Result<bool> {
        Ok(self.guard()?.autocommit)
    }

    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        let mut state = self.guard()?;
        state.check_mode_mutable("autocommit")?;
        state.autocommit = autocommit;
        state.clear_transaction_and_set_defaults();
        // Bounded-staleness modes are only valid in autocommit; reset them
        // silently when leaving autocommit, as a diagnostic courtesy.
        if !autocommit && state.read_only_staleness.is_only_valid_for_single_use() {
            tracing::warn!(
                staleness = %state.read_only_staleness,
                "resetting read-only staleness to STRONG because it is only valid in autocommit mode"
            );
            state.read_only_staleness = TimestampBound::Strong;
        }
        Ok(())
    }

    pub fn is_read_only(&self) -> Result<bool> {
        Ok(self.guard()?.read_only)
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        let mut state = self.guard()?;
        state.check_mode_mutable("read-only")?;
        state.read_only = read_only;
        state.clear_transaction_and_set_defaults();
        Ok(())
    }

    pub fn autocommit_dml_mode(&self) -> Result<AutocommitDmlMode> {
        let state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "cannot get autocommit DML mode while in a batch",
            ));
        }
        Ok(state.autocommit_dml_mode)
    }

    pub fn set_autocommit_dml_mode(&self, mode: AutocommitDmlMode) -> Result<()> {
        let mut state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "cannot set autocommit DML mode while in a batch",
            ));
        }
        if !state.autocommit || state.in_transaction {
            return Err(Error::failed_precondition(
                "autocommit DML mode can only be set while in autocommit mode and outside of a transaction",
            ));
        }
        if state.read_only {
            return Err(Error::failed_precondition(
                "cannot set autocommit DML mode on a read-only connection",
            ));
        }
        state.autocommit_dml_mode = mode;
        Ok(())
    }

    pub fn read_only_staleness(&self) -> Result<TimestampBound> {
        let state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "cannot get read-only staleness while in a batch",
            ));
        }
        Ok(state.read_only_staleness)
    }

    pub fn set_read_only_staleness(&self, staleness: TimestampBound) -> Result<()> {
        let mut state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "cannot set read-only staleness while in a batch",
            ));
        }
        if state.is_transaction_started() {
            return Err(Error::failed_precondition(
                "cannot set read-only staleness when a transaction has been started",
            ));
        }
        if staleness.is_only_valid_for_single_use() && !(state.autocommit && !state.in_transaction)
        {
            return Err(Error::failed_precondition(
                "MAX_STALENESS and MIN_READ_TIMESTAMP are only allowed in autocommit mode",
            ));
        }
        state.read_only_staleness = staleness;
        Ok(())
    }

    pub fn optimizer_version(&self) -> Result<Option<String>> {
        Ok(self
            .guard()?
            .query_options
            .optimizer_version()
            .map(String::from))
    }

    pub fn set_optimizer_version(&self, version: impl Into<String>) -> Result<()> {
        self.guard()?
            .query_options
            .set_optimizer_version(version.into());
        Ok(())
    }

    pub fn statement_timeout(&self) -> Result<StatementTimeout> {
        Ok(self.guard()?.statement_timeout)
    }

    pub fn has_statement_timeout(&self) -> Result<bool> {
        Ok(self.guard()?.statement_timeout.has_timeout())
    }

    pub fn set_statement_timeout(&self, value: u64, unit: TimeUnit) -> Result<()> {
        self.guard()?.statement_timeout.set(value, unit)
    }

    pub fn clear_statement_timeout(&self) -> Result<()> {
        self.guard()?.statement_timeout.clear();
        Ok(())
    }

    pub fn is_retry_aborts_internally(&self) -> Result<bool> {
        Ok(self.guard()?.retry_aborts_internally)
    }

    pub fn set_retry_aborts_internally(&self, retry: bool) -> Result<()> {
        let mut state = self.guard()?;
        state.check_mode_mutable("retry aborts internally")?;
        state.retry_aborts_internally = retry;
        Ok(())
    }

    // ---- retry listeners -----------------------------------------------

    pub fn add_transaction_retry_listener(
        &self,
        listener: Arc<dyn TransactionRetryListener>,
    ) -> Result<()> {
        self.guard()?;
        self.listeners.lock().push(listener);
        Ok(())
    }

    pub fn remove_transaction_retry_listener(
        &self,
        listener: &Arc<dyn TransactionRetryListener>,
    ) -> Result<bool> {
        self.guard()?;
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
        Ok(listeners.len() != before)
    }

    pub fn transaction_retry_listeners(&self) -> Result<Vec<Arc<dyn TransactionRetryListener>>> {
        self.guard()?;
        Ok(self.listeners.lock().clone())
    }

    // ---- transaction lifecycle -----------------------------------------

    pub fn transaction_mode(&self) -> Result<TransactionMode> {
        let state = self.guard()?;
        if state.batch_mode == BatchMode::Ddl {
            return Err(Error::failed_precondition(
                "this connection is in a DDL batch",
            ));
        }
        if !state.is_in_transaction() {
            return Err(Error::failed_precondition(
                "this connection has no transaction",
            ));
        }
        state
            .unit_of_work_type
            .transaction_mode()
            .ok_or_else(|| Error::failed_precondition("this connection has no transaction"))
    }

    pub fn set_transaction_mode(&self, mode: TransactionMode) -> Result<()> {
        let mut state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "cannot set transaction mode while in a batch",
            ));
        }
        if !state.is_in_transaction() {
            return Err(Error::failed_precondition(
                "this connection has no transaction",
            ));
        }
        if state.is_transaction_started() {
            return Err(Error::failed_precondition(
                "the transaction mode cannot be set after the transaction has started",
            ));
        }
        if state.read_only && mode == TransactionMode::ReadWrite {
            return Err(Error::failed_precondition(
                "the transaction mode can only be READ ONLY when the connection is in read-only mode",
            ));
        }
        state.transaction_begin_marked = true;
        state.unit_of_work_type = match mode {
            TransactionMode::ReadOnly => UnitOfWorkType::ReadOnlyTransaction,
            TransactionMode::ReadWrite => UnitOfWorkType::ReadWriteTransaction,
        };
        Ok(())
    }

    /// Mark the start of an explicit transaction. The unit of work itself
    /// is not built until the first statement executes.
    pub fn begin_transaction(&self) -> Result<()> {
        let mut state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "this connection has an active batch and cannot begin a transaction",
            ));
        }
        if state.is_transaction_started() {
            return Err(Error::failed_precondition(
                "beginning a new transaction is not allowed when a transaction is already running",
            ));
        }
        if state.transaction_begin_marked {
            return Err(Error::failed_precondition("a transaction has already begun"));
        }
        state.transaction_begin_marked = true;
        state.clear_transaction_and_set_defaults();
        if state.autocommit {
            state.in_transaction = true;
        }
        Ok(())
    }

    pub fn commit_async(&self) -> StatementHandle<()> {
        self.end_current_transaction(true)
    }

    pub async fn commit(&self) -> Result<()> {
        self.commit_async().await
    }

    pub fn rollback_async(&self) -> StatementHandle<()> {
        self.end_current_transaction(false)
    }

    pub async fn rollback(&self) -> Result<()> {
        self.rollback_async().await
    }

    fn end_current_transaction(&self, commit: bool) -> StatementHandle<()> {
        let mut state = match self.guard() {
            Ok(state) => state,
            Err(err) => return StatementHandle::ready(Err(err)),
        };
        if state.in_batch() {
            return StatementHandle::ready(Err(Error::failed_precondition(
                "this connection has an active batch",
            )));
        }
        if !state.is_in_transaction() {
            return StatementHandle::ready(Err(Error::failed_precondition(
                "this connection has no transaction",
            )));
        }
        let handle = if state.is_transaction_started() {
            match &state.current {
                Some(uow) if commit => uow.commit(),
                Some(uow) => uow.rollback(),
                None => StatementHandle::ready(Ok(())),
            }
        } else {
            state.current = None;
            StatementHandle::ready(Ok(()))
        };
        state.transaction_begin_marked = false;
        if state.autocommit {
            state.in_transaction = false;
        }
        state.set_default_transaction_options();
        handle
    }

    // ---- statement dispatch --------------------------------------------

    fn parse(&self, statement: &Statement) -> Result<ParsedStatement> {
        let options = self.guard()?.query_options.clone();
        meridian_sql::parse(statement, &options)
    }

    /// Execute any statement: control directives run against the connection
    /// itself, everything else is routed to the current unit of work.
    pub fn execute_async(&self, statement: impl Into<Statement>) -> StatementHandle<StatementResult> {
        let statement = statement.into();
        let parsed = match self.parse(&statement) {
            Ok(parsed) => parsed,
            Err(err) => return StatementHandle::ready(Err(err)),
        };
        match parsed.kind() {
            StatementKind::ClientSide => match parsed.client_side() {
                Some(directive) => client_executor::execute(self, directive),
                None => StatementHandle::ready(Err(Error::internal(
                    "client-side statement without a directive",
                ))),
            },
            StatementKind::Query => self
                .submit_query(parsed, AnalyzeMode::None)
                .map(StatementResult::ResultSet),
            StatementKind::Update => self.submit_update(parsed).map(StatementResult::UpdateCount),
            StatementKind::Ddl => self.submit_ddl(parsed).map(|()| StatementResult::NoResult),
            StatementKind::Unknown => StatementHandle::ready(Err(Error::invalid_argument(
                format!("unknown statement: {}", parsed.sql()),
            ))),
        }
    }

    pub async fn execute(&self, statement: impl Into<Statement>) -> Result<StatementResult> {
        self.execute_async(statement).await
    }

    pub fn execute_query_async(&self, statement: impl Into<Statement>) -> StatementHandle<ResultSet> {
        self.query_internal(statement.into(), AnalyzeMode::None)
    }

    pub async fn execute_query(&self, statement: impl Into<Statement>) -> Result<ResultSet> {
        self.execute_query_async(statement).await
    }

    /// Plan or profile a query instead of plainly executing it.
    pub fn analyze_query_async(
        &self,
        statement: impl Into<Statement>,
        analyze: AnalyzeMode,
    ) -> StatementHandle<ResultSet> {
        if analyze == AnalyzeMode::None {
            return StatementHandle::ready(Err(Error::invalid_argument(
                "analyze mode must be PLAN or PROFILE",
            )));
        }
        self.query_internal(statement.into(), analyze)
    }

    pub async fn analyze_query(
        &self,
        statement: impl Into<Statement>,
        analyze: AnalyzeMode,
    ) -> Result<ResultSet> {
        self.analyze_query_async(statement, analyze).await
    }

    fn query_internal(&self, statement: Statement, analyze: AnalyzeMode) -> StatementHandle<ResultSet> {
        let parsed = match self.parse(&statement) {
            Ok(parsed) => parsed,
            Err(err) => return StatementHandle::ready(Err(err)),
        };
        match parsed.kind() {
            StatementKind::Query => self.submit_query(parsed, analyze),
            StatementKind::ClientSide
                if parsed
                    .client_side()
                    .is_some_and(client_executor::returns_result_set) =>
            {
                match parsed.client_side() {
                    Some(directive) => client_executor::execute(self, directive)
                        .and_then(StatementResult::into_result_set),
                    None => StatementHandle::ready(Err(Error::internal(
                        "client-side statement without a directive",
                    ))),
                }
            }
            _ => StatementHandle::ready(Err(Error::invalid_argument(format!(
                "statement is not a query: {}",
                parsed.sql()
            )))),
        }
    }

    pub fn execute_update_async(&self, statement: impl Into<Statement>) -> StatementHandle<i64> {
        let statement = statement.into();
        let parsed = match self.parse(&statement) {
            Ok(parsed) => parsed,
            Err(err) => return StatementHandle::ready(Err(err)),
        };
        match parsed.kind() {
            StatementKind::Update => self.submit_update(parsed),
            _ => StatementHandle::ready(Err(Error::invalid_argument(format!(
                "statement is not an update statement: {}",
                parsed.sql()
            )))),
        }
    }

    pub async fn execute_update(&self, statement: impl Into<Statement>) -> Result<i64> {
        self.execute_update_async(statement).await
    }

    /// Execute a set of DML statements as one server round trip. The whole
    /// batch is rejected if any statement is not DML; nothing executes.
    pub fn execute_batch_update_async(
        &self,
        statements: impl IntoIterator<Item = Statement>,
    ) -> StatementHandle<Vec<i64>> {
        let mut parsed_statements = Vec::new();
        for statement in statements {
            let parsed = match self.parse(&statement) {
                Ok(parsed) => parsed,
                Err(err) => return StatementHandle::ready(Err(err)),
            };
            if parsed.kind() != StatementKind::Update {
                return StatementHandle::ready(Err(Error::invalid_argument(format!(
                    "the batch update list contains a statement that is not an update statement: {}",
                    parsed.sql()
                ))));
            }
            parsed_statements.push(parsed);
        }
        let uow = {
            let mut state = match self.guard() {
                Ok(state) => state,
                Err(err) => return StatementHandle::ready(Err(err)),
            };
            match self.ensure_unit_of_work(&mut state) {
                Ok(uow) => uow,
                Err(err) => return StatementHandle::ready(Err(err)),
            }
        };
        uow.execute_batch_update(parsed_statements)
    }

    pub async fn execute_batch_update(
        &self,
        statements: impl IntoIterator<Item = Statement>,
    ) -> Result<Vec<i64>> {
        self.execute_batch_update_async(statements).await
    }

    fn submit_query(&self, parsed: ParsedStatement, analyze: AnalyzeMode) -> StatementHandle<ResultSet> {
        match self.current_or_new_unit_of_work() {
            Ok(uow) => uow.execute_query(parsed, analyze),
            Err(err) => StatementHandle::ready(Err(err)),
        }
    }

    fn submit_update(&self, parsed: ParsedStatement) -> StatementHandle<i64> {
        match self.current_or_new_unit_of_work() {
            Ok(uow) => uow.execute_update(parsed),
            Err(err) => StatementHandle::ready(Err(err)),
        }
    }

    fn submit_ddl(&self, parsed: ParsedStatement) -> StatementHandle<()> {
        match self.current_or_new_unit_of_work() {
            Ok(uow) => uow.execute_ddl(parsed),
            Err(err) => StatementHandle::ready(Err(err)),
        }
    }

    // ---- mutations -----------------------------------------------------

    /// Apply mutations directly; only allowed in autocommit mode.
    pub fn write_async(
        &self,
        mutations: impl IntoIterator<Item = Mutation>,
    ) -> StatementHandle<()> {
        let uow = {
            let mut state = match self.guard() {
                Ok(state) => state,
                Err(err) => return StatementHandle::ready(Err(err)),
            };
            if !state.autocommit {
                return StatementHandle::ready(Err(Error::failed_precondition(
                    "write is only allowed in autocommit mode; use buffered_write",
                )));
            }
            match self.ensure_unit_of_work(&mut state) {
                Ok(uow) => uow,
                Err(err) => return StatementHandle::ready(Err(err)),
            }
        };
        uow.write(mutations.into_iter().collect())
    }

    pub async fn write(&self, mutations: impl IntoIterator<Item = Mutation>) -> Result<()> {
        self.write_async(mutations).await
    }

    /// Buffer mutations in the current transaction; they are applied at
    /// commit. Only allowed outside autocommit mode.
    pub fn buffered_write_async(
        &self,
        mutations: impl IntoIterator<Item = Mutation>,
    ) -> StatementHandle<()> {
        let uow = {
            let mut state = match self.guard() {
                Ok(state) => state,
                Err(err) => return StatementHandle::ready(Err(err)),
            };
            if state.autocommit {
                return StatementHandle::ready(Err(Error::failed_precondition(
                    "buffered write is not allowed in autocommit mode; use write",
                )));
            }
            match self.ensure_unit_of_work(&mut state) {
                Ok(uow) => uow,
                Err(err) => return StatementHandle::ready(Err(err)),
            }
        };
        uow.write(mutations.into_iter().collect())
    }

    pub async fn buffered_write(
        &self,
        mutations: impl IntoIterator<Item = Mutation>,
    ) -> Result<()> {
        self.buffered_write_async(mutations).await
    }

    // ---- batches -------------------------------------------------------

    pub fn start_batch_ddl(&self) -> Result<()> {
        let mut state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "cannot start a DDL batch when a batch is already active",
            ));
        }
        if state.read_only {
            return Err(Error::failed_precondition(
                "cannot start a DDL batch when the connection is in read-only mode",
            ));
        }
        if state.is_transaction_started() {
            return Err(Error::failed_precondition(
                "cannot start a DDL batch while a transaction is active",
            ));
        }
        if state.autocommit && state.in_transaction {
            return Err(Error::failed_precondition(
                "cannot start a DDL batch while in a temporary transaction",
            ));
        }
        if state.transaction_begin_marked {
            return Err(Error::failed_precondition(
                "cannot start a DDL batch when a transaction has begun",
            ));
        }
        state.batch_mode = BatchMode::Ddl;
        state.unit_of_work_type = UnitOfWorkType::DdlBatch;
        let batch = self.create_unit_of_work(&mut state)?;
        state.current = Some(batch);
        Ok(())
    }

    pub fn start_batch_dml(&self) -> Result<()> {
        let mut state = self.guard()?;
        if state.in_batch() {
            return Err(Error::failed_precondition(
                "cannot start a DML batch when a batch is already active",
            ));
        }
        if state.read_only {
            return Err(Error::failed_precondition(
                "cannot start a DML batch when the connection is in read-only mode",
            ));
        }
        if state.is_in_transaction()
            && state.unit_of_work_type.transaction_mode() == Some(TransactionMode::ReadOnly)
        {
            return Err(Error::failed_precondition(
                "cannot start a DML batch when a read-only transaction is in progress",
            ));
        }
        // Make sure there is a host unit of work for the batch to run in.
        self.ensure_unit_of_work(&mut state)?;
        state.batch_mode = BatchMode::Dml;
        state.unit_of_work_type = UnitOfWorkType::DmlBatch;
        let batch = self.create_unit_of_work(&mut state)?;
        state.current = Some(batch);
        Ok(())
    }

    pub fn run_batch_async(&self) -> StatementHandle<Vec<i64>> {
        let mut state = match self.guard() {
            Ok(state) => state,
            Err(err) => return StatementHandle::ready(Err(err)),
        };
        if !state.in_batch() {
            return StatementHandle::ready(Err(Error::failed_precondition(
                "this connection has no active batch",
            )));
        }
        let handle = match &state.current {
            Some(uow) => uow.run_batch(),
            None => StatementHandle::ready(Ok(Vec::new())),
        };
        state.batch_mode = BatchMode::None;
        state.set_default_transaction_options();
        handle
    }

    pub async fn run_batch(&self) -> Result<Vec<i64>> {
        self.run_batch_async().await
    }

    pub fn abort_batch(&self) -> Result<()> {
        let mut state = self.guard()?;
        if !state.in_batch() {
            return Err(Error::failed_precondition(
                "this connection has no active batch",
            ));
        }
        let result = match &state.current {
            Some(uow) => uow.abort_batch(),
            None => Ok(()),
        };
        state.batch_mode = BatchMode::None;
        state.set_default_transaction_options();
        result
    }

    // ---- unit of work management ---------------------------------------

    fn current_or_new_unit_of_work(&self) -> Result<Arc<dyn UnitOfWork>> {
        let mut state = self.guard()?;
        self.ensure_unit_of_work(&mut state)
    }

    /// Return the current unit of work, or build a fresh one from the
    /// connection state.
    fn ensure_unit_of_work(&self, state: &mut ConnState) -> Result<Arc<dyn UnitOfWork>> {
        if let Some(current) = &state.current
            && current.is_active()
        {
            return Ok(current.clone());
        }
        let created = self.create_unit_of_work(state)?;
        state.current = Some(created.clone());
        Ok(created)
    }

    fn create_unit_of_work(&self, state: &mut ConnState) -> Result<Arc<dyn UnitOfWork>> {
        let timeout = state.statement_timeout.duration();
        if state.autocommit && !state.is_in_transaction() && !state.in_batch() {
            return Ok(Arc::new(SingleUseTransaction::new(
                self.db.clone(),
                self.ddl.clone(),
                state.read_only,
                state.read_only_staleness,
                state.autocommit_dml_mode,
                self.executor.clone(),
                timeout,
            )));
        }
        match state.unit_of_work_type {
            UnitOfWorkType::ReadOnlyTransaction => Ok(Arc::new(ReadOnlyTransaction::new(
                self.db.clone(),
                state.read_only_staleness,
                self.executor.clone(),
                timeout,
            ))),
            UnitOfWorkType::ReadWriteTransaction => Ok(Arc::new(ReadWriteTransaction::new(
                self.db.clone(),
                state.retry_aborts_internally,
                self.listeners.lock().clone(),
                self.executor.clone(),
                timeout,
            ))),
            UnitOfWorkType::DmlBatch => {
                // The batch temporarily shadows the host transaction; a
                // single host slot is supported.
                if state.host.is_some() {
                    return Err(Error::failed_precondition(
                        "nested DML batches are not supported",
                    ));
                }
                let host = state.current.clone().ok_or_else(|| {
                    Error::failed_precondition("there is no current transaction to host the batch")
                })?;
                state.host = Some(host.clone());
                Ok(Arc::new(DmlBatch::new(host)))
            }
            UnitOfWorkType::DdlBatch => Ok(Arc::new(DdlBatch::new(
                self.ddl.clone(),
                self.executor.clone(),
                timeout,
            ))),
        }
    }

    // ---- observers -----------------------------------------------------

    pub fn is_in_transaction(&self) -> Result<bool> {
        Ok(self.guard()?.is_in_transaction())
    }

    pub fn is_transaction_started(&self) -> Result<bool> {
        Ok(self.guard()?.is_transaction_started())
    }

    pub fn is_ddl_batch_active(&self) -> Result<bool> {
        Ok(self.guard()?.batch_mode == BatchMode::Ddl)
    }

    pub fn is_dml_batch_active(&self) -> Result<bool> {
        Ok(self.guard()?.batch_mode == BatchMode::Dml)
    }

    /// The read timestamp of the last read-only snapshot or single-use
    /// read on this connection.
    pub fn read_timestamp(&self) -> Result<Timestamp> {
        self.read_timestamp_or_none()?.ok_or_else(|| {
            Error::failed_precondition("there is no read timestamp available on this connection")
        })
    }

    pub(crate) fn read_timestamp_or_none(&self) -> Result<Option<Timestamp>> {
        let state = self.guard()?;
        Ok(state.current.as_ref().and_then(|uow| uow.read_timestamp()))
    }

    /// The commit timestamp of the last committed mutating unit of work.
    pub fn commit_timestamp(&self) -> Result<Timestamp> {
        self.commit_timestamp_or_none()?.ok_or_else(|| {
            Error::failed_precondition("there is no commit timestamp available on this connection")
        })
    }

    pub(crate) fn commit_timestamp_or_none(&self) -> Result<Option<Timestamp>> {
        let state = self.guard()?;
        Ok(state
            .current
            .as_ref()
            .and_then(|uow| uow.commit_timestamp()))
    }

    // ---- cancellation and shutdown -------------------------------------

    /// Cancel whatever the connection is currently executing. Safe to call
    /// from any thread.
    pub fn cancel(&self) -> Result<()> {
        let current = {
            let state = self.guard()?;
            state.current.clone()
        };
        if let Some(uow) = current {
            uow.cancel();
        }
        Ok(())
    }

    /// Close the connection. Idempotent. A running transaction is rolled
    /// back on a best-effort, fire-and-forget basis; in-flight work gets a
    /// bounded grace period to drain before the worker is aborted.
    pub async fn close(&self) {
        let rollback = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let rollback = if state.is_transaction_started() {
                state.current.clone()
            } else {
                None
            };
            state.closed = true;
            state.current = None;
            state.host = None;
            rollback
        };
        if let Some(uow) = rollback {
            let handle = uow.rollback();
            self.executor.fire_and_forget(async move {
                if let Err(err) = handle.await {
                    tracing::debug!(error = %err, "rollback during close failed");
                }
            });
        }
        *self.leak.lock() = None;
        self.executor.shutdown();
        self.pool.release(&self.config, self.id);
        self.executor.await_termination(CLOSE_GRACE).await;
        self.executor.shutdown_now();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(marker) = self.leak.get_mut().take() {
            tracing::warn!(
                database = self.config.database(),
                opened_at = %marker.opened_at,
                thread = marker.thread.as_deref().unwrap_or("<unnamed>"),
                "connection was dropped without close()"
            );
        }
    }
}
