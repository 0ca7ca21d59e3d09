//! The ambient lock context.
//!
//! [`LockContext`] is the token that makes held locks visible to the code
//! that runs "inside" them. Each logical flow of execution (a task) carries
//! one context; lock acquisition pushes the issued lock onto the context's
//! stack and release pops it. A nested request captures the innermost held
//! lock from the context as its parent, which is what allows nested
//! requests to bypass the queues.
//!
//! # Propagation
//!
//! All lock operations flow through an explicit `&LockContext` argument.
//! When a task spawns a child, the parent calls [`LockContext::fork`] and
//! hands the child the result: a **copy** of the stack taken at fork time.
//! Later pushes and pops in either task do not cross, so a child observes
//! exactly the locks that were held when it was spawned.
//!
//! [`LockContext::clone`] is different: clones share state and exist so a
//! releaser can travel between threads while still popping the stack it was
//! pushed onto.
//!
//! # Suppression
//!
//! [`LockContext::hide_locks`] returns a [`Suppression`] frame. While any
//! frame is alive, the context reports no held locks: held-state inspectors
//! return false and new requests capture no parent (they are treated as
//! top-level). Frames are reference-counted, so overlapping frames compose
//! and may be dropped in any order. Suppression never releases anything;
//! the underlying locks still exclude other tasks.
//!
//! # Cancellation
//!
//! The context carries a cancellation flag. A pending acquisition observes
//! it at poll time and fails with `Cancelled`; an issued lock ignores it.
//! Suppression does not mask cancellation.

use smallvec::SmallVec;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};
use crate::lock::AwaiterId;

#[derive(Debug)]
struct ContextInner {
    /// Held awaiters, innermost on top.
    stack: Vec<AwaiterId>,
    /// Active suppression frames.
    suppression_depth: u32,
    /// Whether cancellation has been requested.
    cancel_requested: bool,
}

/// The ambient lock context for one logical flow of execution.
///
/// Cheaply clonable; clones share the same stack. Use [`LockContext::fork`]
/// to create the context for a child task.
#[derive(Debug, Clone)]
pub struct LockContext {
    inner: Arc<Mutex<ContextInner>>,
}

impl LockContext {
    /// Creates a fresh context holding no locks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                stack: Vec::new(),
                suppression_depth: 0,
                cancel_requested: false,
            })),
        }
    }

    /// Creates the context for a child task: a copy of the current stack.
    ///
    /// Suppression frames and the cancellation flag are not inherited.
    /// Mutations after the fork do not cross between parent and child.
    #[must_use]
    pub fn fork(&self) -> Self {
        let inner = self.inner.lock().expect("lock poisoned");
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                stack: inner.stack.clone(),
                suppression_depth: 0,
                cancel_requested: false,
            })),
        }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.lock().expect("lock poisoned").cancel_requested
    }

    /// Sets or clears the cancellation flag.
    ///
    /// Pending acquisitions on this context fail with `Cancelled` the next
    /// time they are polled. Locks that were already issued are unaffected.
    pub fn set_cancel_requested(&self, value: bool) {
        self.inner.lock().expect("lock poisoned").cancel_requested = value;
    }

    /// Checks for cancellation and returns an error if cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`ErrorKind::Cancelled`] if cancellation is
    /// pending.
    pub fn checkpoint(&self) -> Result<(), Error> {
        if self.is_cancel_requested() {
            Err(Error::new(ErrorKind::Cancelled))
        } else {
            Ok(())
        }
    }

    /// Returns true while at least one suppression frame is alive.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.inner.lock().expect("lock poisoned").suppression_depth > 0
    }

    /// Hides the held locks from this context until the returned frame is
    /// dropped.
    #[must_use]
    pub fn hide_locks(&self) -> Suppression {
        {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.suppression_depth += 1;
        }
        Suppression { ctx: self.clone() }
    }

    /// Number of locks on the stack, ignoring suppression. Intended for
    /// diagnostics.
    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").stack.len()
    }

    /// Copies the visible stack (innermost last) into `out`.
    ///
    /// Under suppression the visible stack is empty.
    pub(crate) fn snapshot_into(&self, out: &mut SmallVec<[AwaiterId; 8]>) {
        out.clear();
        let inner = self.inner.lock().expect("lock poisoned");
        if inner.suppression_depth == 0 {
            out.extend(inner.stack.iter().copied());
        }
    }

    pub(crate) fn push(&self, id: AwaiterId) {
        self.inner.lock().expect("lock poisoned").stack.push(id);
    }

    /// Removes `id` from the stack. Releasers may be dropped out of nesting
    /// order, so this removes the topmost occurrence rather than popping.
    pub(crate) fn pop(&self, id: AwaiterId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(pos) = inner.stack.iter().rposition(|&held| held == id) {
            inner.stack.remove(pos);
        }
    }

    fn unsuppress(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.suppression_depth = inner.suppression_depth.saturating_sub(1);
    }
}

impl Default for LockContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame that hides the ambient lock stack while it is alive.
///
/// Produced by [`LockContext::hide_locks`]. Frames are reference-counted
/// and may be dropped in any order relative to one another.
#[derive(Debug)]
#[must_use = "the locks are only hidden while the suppression is alive"]
pub struct Suppression {
    ctx: LockContext,
}

impl Drop for Suppression {
    fn drop(&mut self) {
        self.ctx.unsuppress();
    }
}
