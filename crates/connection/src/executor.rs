//! Serial statement executor
//!
//! Statements are executed on a dedicated worker task so that they can be
//! pre-empted: a statement timeout arms a deadline around the running
//! operation, and cancellation interrupts it. Results travel back over
//! oneshot channels, so futures handed to callers complete in submission
//! order.

use meridian_common::{Error, ErrorCode, Result, TimeUnit};
use meridian_sql::ParsedStatement;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

/// Timeout applied to every statement executed on a connection.
///
/// The value is kept together with the unit it was set in so that it can be
/// reported back exactly as the user wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatementTimeout(Option<(u64, TimeUnit)>);

impl StatementTimeout {
    pub fn set(&mut self, value: u64, unit: TimeUnit) -> Result<()> {
        if value == 0 {
            return Err(Error::invalid_argument(
                "zero or negative timeout values are not allowed",
            ));
        }
        self.0 = Some((value, unit));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn get(&self) -> Option<(u64, TimeUnit)> {
        self.0
    }

    pub fn has_timeout(&self) -> bool {
        self.0.is_some()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0.map(|(value, unit)| unit.to_duration(value))
    }
}

impl fmt::Display for StatementTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some((value, unit)) => write!(f, "{}{}", value, unit.abbreviation()),
            None => f.write_str("null"),
        }
    }
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellation flag shared between a unit of work and its running jobs.
#[derive(Clone)]
pub struct CancelToken(Arc<CancelInner>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(CancelInner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled. The `notified` future is
    /// created before the flag is checked to avoid a lost wakeup.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

enum HandleInner<T> {
    Ready(Option<Result<T>>),
    Channel(oneshot::Receiver<Result<T>>),
    Boxed(Pin<Box<dyn Future<Output = Result<T>> + Send>>),
}

/// Future for the result of a submitted statement.
///
/// Handles from the same connection complete in submission order. Dropping a
/// handle does not cancel the statement.
pub struct StatementHandle<T> {
    inner: HandleInner<T>,
}

impl<T: Send + 'static> StatementHandle<T> {
    /// A handle that is already complete.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            inner: HandleInner::Ready(Some(result)),
        }
    }

    fn from_channel(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            inner: HandleInner::Channel(rx),
        }
    }

    /// Transform the success value.
    pub fn map<U, F>(self, f: F) -> StatementHandle<U>
    where
        T: Unpin,
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        StatementHandle {
            inner: HandleInner::Boxed(Box::pin(async move { self.await.map(f) })),
        }
    }

    /// Transform the success value with a fallible function.
    pub fn and_then<U, F>(self, f: F) -> StatementHandle<U>
    where
        T: Unpin,
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        StatementHandle {
            inner: HandleInner::Boxed(Box::pin(async move { self.await.and_then(f) })),
        }
    }

    /// Observe the result without consuming it.
    pub(crate) fn inspect<F>(self, f: F) -> StatementHandle<T>
    where
        T: Unpin,
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        StatementHandle {
            inner: HandleInner::Boxed(Box::pin(async move {
                let result = self.await;
                f(&result);
                result
            })),
        }
    }
}

impl<T: Unpin> Future for StatementHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            HandleInner::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(Error::internal("statement handle polled twice"))),
            ),
            HandleInner::Channel(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(Error::cancelled(
                        "connection was closed while the statement was in flight",
                    ))
                })
            }),
            HandleInner::Boxed(fut) => fut.as_mut().poll(cx),
        }
    }
}

/// Observer hooks invoked around every executed statement.
pub trait StatementExecutionInterceptor: Send + Sync {
    fn before_execution(&self, _statement: &ParsedStatement) {}
    fn after_execution(&self, _statement: &ParsedStatement, _error: Option<&Error>) {}
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Single-worker executor owning all statement invocations of a connection.
pub struct StatementExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    abort: AbortHandle,
    interceptors: Vec<Arc<dyn StatementExecutionInterceptor>>,
}

impl StatementExecutor {
    pub fn new(interceptors: Vec<Arc<dyn StatementExecutionInterceptor>>) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
        });
        let abort = worker.abort_handle();
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            abort,
            interceptors,
        })
    }

    /// Queue an operation on the worker.
    ///
    /// The operation is guarded by `cancel` and, when set, by `timeout`.
    /// `on_preempt` is invoked when the operation is torn down by
    /// cancellation or a deadline instead of completing.
    pub fn submit<T, F>(
        &self,
        statement: Option<ParsedStatement>,
        timeout: Option<Duration>,
        cancel: CancelToken,
        on_preempt: Option<Box<dyn FnOnce(ErrorCode) + Send>>,
        operation: F,
    ) -> StatementHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let interceptors = self.interceptors.clone();
        let job: Job = Box::pin(async move {
            if let Some(statement) = &statement {
                for interceptor in &interceptors {
                    interceptor.before_execution(statement);
                }
            }
            let result = run_guarded(operation, timeout, &cancel).await;
            if let Err(err) = &result
                && matches!(err.code(), ErrorCode::Cancelled | ErrorCode::DeadlineExceeded)
                && let Some(on_preempt) = on_preempt
            {
                on_preempt(err.code());
            }
            if let Some(statement) = &statement {
                for interceptor in &interceptors {
                    interceptor.after_execution(statement, result.as_ref().err());
                }
            }
            let _ = result_tx.send(result);
        });
        let sender = self.sender.lock();
        if let Some(sender) = &*sender
            && sender.send(job).is_ok()
        {
            return StatementHandle::from_channel(result_rx);
        }
        StatementHandle::ready(Err(Error::cancelled(
            "the statement executor has been shut down",
        )))
    }

    /// Run an operation detached from the worker. Used for best-effort
    /// rollbacks so that `close` and `cancel` never wait on a remote call.
    pub fn fire_and_forget<F>(&self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(operation);
    }

    /// Stop accepting new work. Queued work still drains.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Wait up to `timeout` for queued work to drain.
    pub async fn await_termination(&self, timeout: Duration) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = tokio::time::timeout(timeout, worker).await;
        }
    }

    /// Abort the worker, dropping whatever is running. Pending handles fail
    /// with `Cancelled`.
    pub fn shutdown_now(&self) {
        self.abort.abort();
    }
}

async fn run_guarded<T, F>(operation: F, timeout: Option<Duration>, cancel: &CancelToken) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    if cancel.is_cancelled() {
        return Err(Error::cancelled("statement execution was cancelled"));
    }
    let guarded = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled("statement execution was cancelled")),
            result = operation => result,
        }
    };
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
            Ok(result) => result,
            Err(_) => Err(Error::deadline_exceeded("statement execution deadline exceeded")),
        },
        None => guarded.await,
    }
}
