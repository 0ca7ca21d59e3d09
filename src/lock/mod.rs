//! The asynchronous reader/writer lock.
//!
//! [`ReaderWriterLock`] issues three grades of access with nesting,
//! cancellation, pre-release callbacks, and graceful completion:
//!
//! - [`ReaderWriterLock::read`]: shared access.
//! - [`ReaderWriterLock::upgradeable_read`]: shared with readers, exclusive
//!   among upgradeable readers, and allowed to upgrade via a nested write.
//! - [`ReaderWriterLock::write`]: exclusive access.
//!
//! All request methods take the caller's [`LockContext`] and return a
//! [`LockFuture`] resolving to a [`Releaser`]. Which locks are "held" is
//! always a property of a context, not of a thread.

mod core;
mod flags;
mod pipeline;
mod request;

pub use flags::{AwaiterId, LockFlags, LockKind};
pub use pipeline::ReleaseFuture;
pub use request::{LockFuture, Releaser};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::context::{LockContext, Suppression};
use crate::error::Error;
use crate::event::EventWait;

use self::core::LockCore;

/// Hooks for platforms with affinity-constrained threads.
///
/// The default implementation admits every thread and runs marshalled jobs
/// inline; embedders whose runtimes pin work to constrained threads provide
/// their own policy.
pub trait AffinityPolicy: Send + Sync {
    /// Whether the current thread may block on lock state.
    fn can_hold_lock_on_this_thread(&self) -> bool {
        true
    }

    /// Runs `job` on an unconstrained thread.
    fn marshal_to_pool(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

/// The default affinity policy: no thread is constrained.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconstrained;

impl AffinityPolicy for Unconstrained {}

/// An asynchronous reader/writer lock with ambient-context nesting.
pub struct ReaderWriterLock {
    core: Arc<LockCore>,
    policy: Arc<dyn AffinityPolicy>,
}

impl ReaderWriterLock {
    /// Creates a lock with the [`Unconstrained`] affinity policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_affinity_policy(Arc::new(Unconstrained))
    }

    /// Creates a lock with a platform-specific affinity policy.
    #[must_use]
    pub fn with_affinity_policy(policy: Arc<dyn AffinityPolicy>) -> Self {
        Self {
            core: Arc::new(LockCore::new()),
            policy,
        }
    }

    /// Requests a read lock.
    pub fn read<'c>(&self, ctx: &'c LockContext) -> LockFuture<'c> {
        self.request(LockKind::Read, LockFlags::NONE, ctx)
    }

    /// Requests an upgradeable read lock.
    pub fn upgradeable_read<'c>(&self, ctx: &'c LockContext) -> LockFuture<'c> {
        self.request(LockKind::UpgradeableRead, LockFlags::NONE, ctx)
    }

    /// Requests an upgradeable read lock with modifier flags
    /// (notably [`LockFlags::STICKY_WRITE`]).
    pub fn upgradeable_read_with<'c>(
        &self,
        flags: LockFlags,
        ctx: &'c LockContext,
    ) -> LockFuture<'c> {
        self.request(LockKind::UpgradeableRead, flags, ctx)
    }

    /// Requests a write lock.
    pub fn write<'c>(&self, ctx: &'c LockContext) -> LockFuture<'c> {
        self.request(LockKind::Write, LockFlags::NONE, ctx)
    }

    fn request<'c>(&self, kind: LockKind, flags: LockFlags, ctx: &'c LockContext) -> LockFuture<'c> {
        LockFuture::new(
            Arc::clone(&self.core),
            Arc::clone(&self.policy),
            ctx,
            kind,
            flags,
        )
    }

    /// Acquires a read lock, blocking the calling thread.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidOperation` on an affinity-constrained thread, and
    /// with whatever the asynchronous variant would fail with.
    pub fn read_blocking(&self, ctx: &LockContext) -> Result<Releaser, Error> {
        self.blocking(LockKind::Read, LockFlags::NONE, ctx)
    }

    /// Acquires an upgradeable read lock, blocking the calling thread.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ReaderWriterLock::read_blocking`].
    pub fn upgradeable_read_blocking(&self, ctx: &LockContext) -> Result<Releaser, Error> {
        self.blocking(LockKind::UpgradeableRead, LockFlags::NONE, ctx)
    }

    /// Acquires a write lock, blocking the calling thread.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ReaderWriterLock::read_blocking`].
    pub fn write_blocking(&self, ctx: &LockContext) -> Result<Releaser, Error> {
        self.blocking(LockKind::Write, LockFlags::NONE, ctx)
    }

    fn blocking(
        &self,
        kind: LockKind,
        flags: LockFlags,
        ctx: &LockContext,
    ) -> Result<Releaser, Error> {
        if !self.policy.can_hold_lock_on_this_thread() {
            return Err(Error::invalid_operation(
                "blocking acquisition on an affinity-constrained thread",
            ));
        }
        crate::util::block_on(self.request(kind, flags, ctx))
    }

    /// True if the context's visible stack holds a read lock.
    #[must_use]
    pub fn is_read_lock_held(&self, ctx: &LockContext) -> bool {
        self.core.is_read_lock_held(ctx)
    }

    /// True if the context's visible stack holds an upgradeable read lock.
    #[must_use]
    pub fn is_upgradeable_read_lock_held(&self, ctx: &LockContext) -> bool {
        self.core.is_upgradeable_read_lock_held(ctx)
    }

    /// True if the context's visible stack holds a write lock. A sticky
    /// upgradeable read retaining a released write counts.
    #[must_use]
    pub fn is_write_lock_held(&self, ctx: &LockContext) -> bool {
        self.core.is_write_lock_held(ctx)
    }

    /// Hides the context's held locks until the returned frame is dropped.
    ///
    /// While hidden, the held-state inspectors report false for the context
    /// and new requests from it are treated as top-level. The locks remain
    /// held and still exclude other contexts.
    pub fn hide_locks(&self, ctx: &LockContext) -> Suppression {
        ctx.hide_locks()
    }

    /// Registers a callback that runs while the write lock is still held,
    /// just before it is released. Callbacks run in registration order, one
    /// at a time; a callback may register further callbacks into the same
    /// drain.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidOperation` if the context does not hold a write
    /// lock (a sticky upgradeable read retaining a write counts).
    pub fn on_before_write_lock_released<F, Fut>(
        &self,
        ctx: &LockContext,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let boxed: self::core::ReleaseCallback = Box::new(move || {
            let fut: self::core::CallbackFuture = Box::pin(callback());
            fut
        });
        self.core.register_callback(ctx, boxed)
    }

    /// Marks the lock as draining. Idempotent.
    ///
    /// New top-level requests fail with `Completed`; requests nested in a
    /// held lock, and requests that were already queued, are still
    /// serviced.
    pub fn complete(&self) {
        self.core.complete();
    }

    /// Resolves once `complete` has been requested, every issued lock has
    /// been released, and every release callback has finished.
    ///
    /// Yields any aggregate error that no release future observed.
    pub fn completion(&self) -> CompletionFuture<'_> {
        CompletionFuture {
            core: &self.core,
            wait: self.core.completion_event().wait(),
        }
    }

    /// True once `complete` has been requested.
    #[must_use]
    pub fn is_completion_requested(&self) -> bool {
        self.core.is_completion_requested()
    }

    /// True if the context's visible stack holds a lock whose flags contain
    /// all of `flags`. Extension point for wrapper types with their own
    /// flag bits.
    #[must_use]
    pub fn lock_stack_contains(&self, flags: LockFlags, ctx: &LockContext) -> bool {
        self.core.lock_stack_contains(flags, ctx)
    }

    /// True if the ancestor chain of `id` (inclusive) holds a lock whose
    /// flags contain all of `flags`.
    #[must_use]
    pub fn awaiter_chain_contains(&self, flags: LockFlags, id: AwaiterId) -> bool {
        self.core.awaiter_chain_contains(flags, id)
    }

    /// (read, upgradeable-read, write) holder counts.
    #[must_use]
    pub fn held_counts(&self) -> (usize, usize, usize) {
        self.core.held_counts()
    }

    /// (read, upgradeable-read, write) pending queue depths.
    #[must_use]
    pub fn pending_counts(&self) -> (usize, usize, usize) {
        self.core.pending_counts()
    }
}

impl Default for ReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReaderWriterLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (read, upgradeable, write) = self.held_counts();
        let (read_q, upgradeable_q, write_q) = self.pending_counts();
        f.debug_struct("ReaderWriterLock")
            .field("read_holders", &read)
            .field("upgradeable_holders", &upgradeable)
            .field("write_holders", &write)
            .field("pending", &(read_q, upgradeable_q, write_q))
            .field("completion_requested", &self.is_completion_requested())
            .finish()
    }
}

/// Future returned by [`ReaderWriterLock::completion`].
#[must_use = "futures do nothing unless polled"]
pub struct CompletionFuture<'a> {
    core: &'a LockCore,
    wait: EventWait<'a>,
}

impl Future for CompletionFuture<'_> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.wait).poll(cx) {
            Poll::Ready(()) => Poll::Ready(self.core.completion_result()),
            Poll::Pending => Poll::Pending,
        }
    }
}
