//! Acquisition futures and releasers.
//!
//! [`LockFuture`] drives one lock request. Polling validates the request,
//! grants on the fast path, or queues and stashes the task's waker; a later
//! release re-runs admission and wakes the future. Dropping a pending
//! future removes the request from its queue as if it had never been made.
//!
//! [`Releaser`] is the handle to an issued lock. It is movable (it owns its
//! context and core references) but not copyable, releases on drop, and
//! tolerates out-of-nesting-order drops. A write releaser whose lock has
//! registered callbacks should be released through [`Releaser::release`] so
//! the drain can be awaited; dropping it instead drains on the dropping
//! thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::context::LockContext;
use crate::error::Error;

use super::core::LockCore;
use super::flags::{AwaiterId, LockFlags, LockKind};
use super::pipeline::{self, ReleaseFuture};
use super::AffinityPolicy;

/// Future returned by the lock request methods.
#[must_use = "futures do nothing unless polled"]
pub struct LockFuture<'c> {
    core: Arc<LockCore>,
    policy: Arc<dyn AffinityPolicy>,
    ctx: &'c LockContext,
    kind: LockKind,
    flags: LockFlags,
    id: Option<AwaiterId>,
    done: bool,
}

impl<'c> LockFuture<'c> {
    pub(crate) fn new(
        core: Arc<LockCore>,
        policy: Arc<dyn AffinityPolicy>,
        ctx: &'c LockContext,
        kind: LockKind,
        flags: LockFlags,
    ) -> Self {
        Self {
            core,
            policy,
            ctx,
            kind,
            flags,
            id: None,
            done: false,
        }
    }

    /// The grade this request asks for.
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl Future for LockFuture<'_> {
    type Output = Result<Releaser, Error>;

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Pending;
        }
        let this = &mut *self;
        match this
            .core
            .poll_acquire(&mut this.id, this.kind, this.flags, this.ctx, cx.waker())
        {
            Poll::Ready(Ok(id)) => {
                this.done = true;
                this.id = None;
                Poll::Ready(Ok(Releaser {
                    core: Arc::clone(&this.core),
                    policy: Arc::clone(&this.policy),
                    ctx: this.ctx.clone(),
                    id,
                    kind: this.kind,
                    released: false,
                }))
            }
            Poll::Ready(Err(err)) => {
                this.done = true;
                this.id = None;
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LockFuture<'_> {
    fn drop(&mut self) {
        // A request that was queued, or granted without being observed, is
        // withdrawn so it cannot hold up or leak lock state.
        if let Some(id) = self.id.take() {
            LockCore::abandon_request(&self.core, id);
        }
    }
}

/// Handle to one issued lock.
///
/// Dropping the releaser releases the lock. A second release through the
/// same handle is a no-op and never affects sibling releasers.
#[must_use = "the lock is released as soon as the releaser is dropped"]
pub struct Releaser {
    pub(crate) core: Arc<LockCore>,
    pub(crate) policy: Arc<dyn AffinityPolicy>,
    pub(crate) ctx: LockContext,
    pub(crate) id: AwaiterId,
    pub(crate) kind: LockKind,
    pub(crate) released: bool,
}

impl std::fmt::Debug for Releaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Releaser")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("released", &self.released)
            .finish()
    }
}

impl Releaser {
    /// The grade of the issued lock.
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// The stable identity of the issued lock.
    #[must_use]
    pub fn awaiter_id(&self) -> AwaiterId {
        self.id
    }

    /// Releases the lock, awaiting the callback drain when this is the last
    /// write release.
    ///
    /// The returned future yields the aggregate of any callback failures.
    /// For reads, upgradeable reads, and nested writes it completes on the
    /// first poll.
    pub fn release(mut self) -> ReleaseFuture {
        self.released = true;
        ReleaseFuture::new_internal(
            Arc::clone(&self.core),
            self.id,
            Some(self.ctx.clone()),
            true,
        )
    }
}

impl Drop for Releaser {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        pipeline::drop_release(&self.core, &self.policy, &self.ctx, self.id);
    }
}
