//! The write-release pipeline.
//!
//! Releasing the last write lock drains the registered callbacks before the
//! write slot clears: each callback runs to completion, in registration
//! order, while the write lock is still observably held, so a callback that
//! inspects lock state sees the write as held and may itself take nested
//! locks or register further callbacks (which join the same drain pass).
//!
//! Failures do not stop the drain. They are collected and delivered as one
//! aggregate through the release future; a drop-path drain routes the
//! aggregate into the completion signal instead.
//!
//! When the released write sits under a sticky upgradeable read, there is
//! no drain at write release: the callback queue is handed to the ancestor
//! and fires when the upgradeable read itself releases.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::context::LockContext;
use crate::error::Error;

use super::core::{CallbackFuture, LockCore, ReleaseStart};
use super::flags::AwaiterId;
use super::AffinityPolicy;

enum DrainState {
    Start,
    Running(CallbackFuture),
    Done,
}

/// Future returned by [`Releaser::release`](super::Releaser::release).
///
/// Completes once the lock is released and, for the last write release, the
/// callback drain has finished. Yields the aggregate of callback failures.
#[must_use = "futures do nothing unless polled"]
pub struct ReleaseFuture {
    core: Arc<LockCore>,
    ctx: Option<LockContext>,
    id: AwaiterId,
    observed: bool,
    state: DrainState,
    errors: Vec<Error>,
}

impl ReleaseFuture {
    pub(crate) fn new_internal(
        core: Arc<LockCore>,
        id: AwaiterId,
        ctx: Option<LockContext>,
        observed: bool,
    ) -> Self {
        Self {
            core,
            ctx,
            id,
            observed,
            state: DrainState::Start,
            errors: Vec::new(),
        }
    }

    /// The ambient stack entry clears only after the drain, so callbacks
    /// observe the write as held by the releasing flow.
    fn pop_context(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.pop(self.id);
        }
    }

    fn finish(&mut self) -> Result<(), Error> {
        let errors = std::mem::take(&mut self.errors);
        let result = self.core.finish_drain(self.id, errors, self.observed);
        self.pop_context();
        self.state = DrainState::Done;
        result
    }
}

impl Future for ReleaseFuture {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                DrainState::Done => return Poll::Pending,
                DrainState::Start => match this.core.begin_release(this.id) {
                    Err(err) => {
                        this.state = DrainState::Done;
                        return Poll::Ready(Err(err));
                    }
                    Ok(ReleaseStart::Done) => {
                        this.pop_context();
                        this.state = DrainState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    Ok(ReleaseStart::Drain) => match this.core.next_drain_callback(this.id) {
                        Some(callback) => this.state = DrainState::Running(callback()),
                        None => return Poll::Ready(this.finish()),
                    },
                },
                DrainState::Running(callback) => match callback.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(result) => {
                        if let Err(err) = result {
                            this.errors.push(err);
                        }
                        // Callbacks registered during the drain join the
                        // same pass.
                        match this.core.next_drain_callback(this.id) {
                            Some(callback) => this.state = DrainState::Running(callback()),
                            None => return Poll::Ready(this.finish()),
                        }
                    }
                },
            }
        }
    }
}

/// Release driven by a releaser drop. Runs the drain to completion on this
/// thread, or marshals it off an affinity-constrained thread first.
pub(crate) fn drop_release(
    core: &Arc<LockCore>,
    policy: &Arc<dyn AffinityPolicy>,
    ctx: &LockContext,
    id: AwaiterId,
) {
    let fut = ReleaseFuture::new_internal(Arc::clone(core), id, Some(ctx.clone()), false);
    if core.release_requires_drain(id) && !policy.can_hold_lock_on_this_thread() {
        policy.marshal_to_pool(Box::new(move || {
            let _ = crate::util::block_on(fut);
        }));
    } else {
        let _ = crate::util::block_on(fut);
    }
}
