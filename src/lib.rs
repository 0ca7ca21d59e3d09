//! An asynchronous reader/writer lock with ambient-context nesting.
//!
//! `ambientlock` provides a lock that grants three grades of access:
//!
//! - **Read**: shared, many holders at once.
//! - **Upgradeable read**: shared with readers, exclusive among upgradeable
//!   readers, and allowed to contain nested write requests.
//! - **Write**: exclusive.
//!
//! Locks nest. A task that holds a lock may request further locks, and those
//! nested requests are admitted ahead of unrelated queued requests. Which
//! locks a task holds is tracked in a [`LockContext`] that is passed
//! explicitly and forked for child tasks, so descendants see a snapshot of
//! their parent's held locks without the locks being passed by hand.
//!
//! # Fairness
//!
//! Admission is FIFO per grade among unrelated requests, with
//! writer-preference: a queued writer blocks new unrelated top-level readers
//! so writers are not starved. Nested requests skip the queue whenever
//! exclusion permits.
//!
//! # Cancel Safety
//!
//! Acquisition futures are cancel-safe:
//! - Cancellation while waiting fails the request without acquiring.
//! - Dropping a pending future removes it from the queue as if it had never
//!   been enqueued.
//! - Once issued, a lock ignores cancellation; only its releaser ends it.
//!
//! # Shutdown
//!
//! [`ReaderWriterLock::complete`] marks the lock as draining: new top-level
//! requests fail, requests already queued are still serviced, and
//! [`ReaderWriterLock::completion`] resolves once every issued lock has been
//! released and every release callback has run.
//!
//! # Example
//!
//! ```ignore
//! use ambientlock::{LockContext, ReaderWriterLock};
//!
//! let lock = ReaderWriterLock::new();
//! let ctx = LockContext::new();
//!
//! // Shared access.
//! let reader = lock.read(&ctx).await?;
//! assert!(lock.is_read_lock_held(&ctx));
//! drop(reader);
//!
//! // Exclusive access, with a pre-release callback.
//! let writer = lock.write(&ctx).await?;
//! lock.on_before_write_lock_released(&ctx, || async { Ok(()) })?;
//! writer.release().await?;
//! ```

pub mod context;
pub mod error;
pub mod event;
pub mod lock;
mod util;

pub use context::{LockContext, Suppression};
pub use error::{Error, ErrorCategory, ErrorKind};
pub use event::{Event, EventWait};
pub use lock::{
    AffinityPolicy, AwaiterId, CompletionFuture, LockFlags, LockFuture, LockKind, ReaderWriterLock,
    Releaser, ReleaseFuture, Unconstrained,
};

/// Phase tracking macro for structured test logging.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Completion marker for structured test logging.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Assertion with logging for better test output.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
