//! Observers of internal transaction retries

/// An internal retry attempt of an aborted read/write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry round has started.
    Started { attempt: u64 },
    /// The replay itself was aborted; the transaction backs off and
    /// restarts the replay.
    AbortedAndRestarting { attempt: u64 },
    /// A replayed statement returned a different result than the original;
    /// the retry is given up and `Aborted` is surfaced.
    DifferentResult { attempt: u64 },
    /// The replay succeeded and the transaction resumes.
    Succeeded { attempt: u64 },
}

/// Observer of internal retries. Listeners are notified in registration
/// order.
pub trait TransactionRetryListener: Send + Sync {
    fn on_retry(&self, event: RetryEvent);
}
