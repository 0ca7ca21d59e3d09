//! The lock state machine.
//!
//! [`LockCore`] owns every piece of mutable lock state: the awaiter slab,
//! the holder sets, the three pending queues, the release-callback list,
//! and the completion latch. All transitions happen under one private
//! `parking_lot::Mutex`.
//!
//! # Private Mutex Discipline
//!
//! Nothing observable happens while the mutex is held: no user callbacks,
//! no waking, no awaiting. Wakers are collected into a small list and fired
//! after the guard is dropped, and the completion latch is set after the
//! guard is dropped. This keeps a woken task free to re-enter the lock
//! immediately without deadlocking against its waker.
//!
//! # Admission
//!
//! Admission is evaluated under the mutex after every state change, until a
//! fixpoint:
//!
//! 1. Nested requests (parent currently held) are granted from anywhere in
//!    their queue as soon as exclusion permits.
//! 2. Unrelated requests are FIFO per grade; the writer queue is evaluated
//!    before the upgradeable queue before the reader queue, so writers are
//!    not starved.
//! 3. A queued writer (nested or not) blocks new unrelated top-level
//!    readers.

use parking_lot::Mutex as ParkingMutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Poll, Waker};

use crate::context::LockContext;
use crate::error::{Error, ErrorKind};
use crate::event::Event;

use super::flags::{AwaiterId, LockFlags, LockKind};

/// Boxed future produced by a release callback.
pub(crate) type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// Async callable registered through `on_before_write_lock_released`.
pub(crate) type ReleaseCallback = Box<dyn FnOnce() -> CallbackFuture + Send>;

/// Wakers to fire once the private mutex is dropped.
pub(crate) type WakeList = SmallVec<[Waker; 4]>;

pub(crate) struct CallbackEntry {
    /// The write awaiter that was held when the callback was registered.
    pub(crate) registered_under: AwaiterId,
    pub(crate) run: ReleaseCallback,
}

/// How a release proceeds after its synchronous part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseStart {
    /// Fully released; nothing left to do.
    Done,
    /// Callbacks must drain before the holder slot clears. The awaiter is
    /// in the `Draining` state and still excludes other requests.
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AwaiterState {
    Pending,
    Held,
    /// Write (or sticky-upgraded upgradeable read) whose release pipeline
    /// is running. Still observably held.
    Draining,
    Released,
    Canceled,
}

struct AwaiterRecord {
    kind: LockKind,
    flags: LockFlags,
    parent: Option<AwaiterId>,
    state: AwaiterState,
    waker: Option<Waker>,
    /// Live records whose `parent` is this record. The slot is only
    /// reclaimed once this drops to zero, so ancestor chains stay
    /// resolvable however releases interleave.
    live_children: u32,
    /// Upgradeable read that retains a released nested write.
    sticky_upgraded: bool,
    /// Callbacks handed off from a released nested write; drained when
    /// this (sticky) upgradeable read releases.
    deferred: VecDeque<CallbackEntry>,
}

impl AwaiterRecord {
    fn is_held(&self) -> bool {
        matches!(self.state, AwaiterState::Held | AwaiterState::Draining)
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, AwaiterState::Released | AwaiterState::Canceled)
    }
}

struct Slot {
    generation: u32,
    record: Option<AwaiterRecord>,
}

struct CoreState {
    slots: Vec<Slot>,
    free: SmallVec<[u32; 8]>,
    read_holders: SmallVec<[AwaiterId; 4]>,
    upgradeable_holders: SmallVec<[AwaiterId; 4]>,
    write_holders: SmallVec<[AwaiterId; 4]>,
    waiting_readers: VecDeque<AwaiterId>,
    waiting_upgradeables: VecDeque<AwaiterId>,
    waiting_writers: VecDeque<AwaiterId>,
    /// Callbacks for the currently open write episode.
    callbacks: VecDeque<CallbackEntry>,
    completion_requested: bool,
    completion_signaled: bool,
    /// Release pipelines currently running outside the mutex.
    drains_in_flight: usize,
    /// Aggregate from a drop-path drain, delivered through `completion`.
    completion_error: Option<Error>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            slots: Vec::with_capacity(8),
            free: SmallVec::new(),
            read_holders: SmallVec::new(),
            upgradeable_holders: SmallVec::new(),
            write_holders: SmallVec::new(),
            waiting_readers: VecDeque::with_capacity(4),
            waiting_upgradeables: VecDeque::with_capacity(4),
            waiting_writers: VecDeque::with_capacity(4),
            callbacks: VecDeque::new(),
            completion_requested: false,
            completion_signaled: false,
            drains_in_flight: 0,
            completion_error: None,
        }
    }

    fn record(&self, id: AwaiterId) -> Option<&AwaiterRecord> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.record.as_ref()
    }

    fn record_mut(&mut self, id: AwaiterId) -> Option<&mut AwaiterRecord> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.record.as_mut()
    }

    fn insert(
        &mut self,
        kind: LockKind,
        flags: LockFlags,
        parent: Option<AwaiterId>,
        state: AwaiterState,
        waker: Option<Waker>,
    ) -> AwaiterId {
        if let Some(p) = parent {
            if let Some(parent_rec) = self.record_mut(p) {
                parent_rec.live_children += 1;
            }
        }
        let record = AwaiterRecord {
            kind,
            flags,
            parent,
            state,
            waker,
            live_children: 0,
            sticky_upgraded: false,
            deferred: VecDeque::new(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.record = Some(record);
            AwaiterId::new(index, slot.generation)
        } else {
            let index = u32::try_from(self.slots.len()).expect("awaiter slab exhausted");
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            AwaiterId::new(index, 0)
        }
    }

    /// Reclaims terminal records with no live children, walking up the
    /// ancestor chain as reference counts reach zero.
    fn try_free(&mut self, start: AwaiterId) {
        let mut current = start;
        loop {
            let Some(record) = self.record(current) else {
                return;
            };
            if !record.is_terminal() || record.live_children > 0 {
                return;
            }
            let parent = record.parent;
            self.slots[current.index() as usize].record = None;
            self.free.push(current.index());
            match parent {
                Some(p) => match self.record_mut(p) {
                    Some(parent_rec) => {
                        parent_rec.live_children -= 1;
                        current = p;
                    }
                    None => return,
                },
                None => return,
            }
        }
    }

    fn is_held(&self, id: AwaiterId) -> bool {
        self.record(id).is_some_and(AwaiterRecord::is_held)
    }

    /// True if `target` appears on the ancestor chain starting at `start`.
    fn chain_contains(&self, start: Option<AwaiterId>, target: AwaiterId) -> bool {
        let mut current = start;
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = self.record(id).and_then(|r| r.parent);
        }
        false
    }

    /// True if the chain contains an upgradeable read or write, which is
    /// what makes a nested write or upgradeable-read request legal.
    fn chain_has_upgrade_grade(&self, start: Option<AwaiterId>) -> bool {
        let mut current = start;
        while let Some(id) = current {
            match self.record(id) {
                Some(record) => {
                    if !matches!(record.kind, LockKind::Read) {
                        return true;
                    }
                    current = record.parent;
                }
                None => return false,
            }
        }
        false
    }

    /// Nearest held upgradeable read on the chain that asked for sticky
    /// write retention.
    fn nearest_sticky_ancestor(&self, start: Option<AwaiterId>) -> Option<AwaiterId> {
        let mut current = start;
        while let Some(id) = current {
            let record = self.record(id)?;
            if record.is_held()
                && matches!(record.kind, LockKind::UpgradeableRead)
                && record.flags.contains(LockFlags::STICKY_WRITE)
            {
                return Some(id);
            }
            current = record.parent;
        }
        None
    }

    fn all_ancestral(&self, holders: &[AwaiterId], parent: Option<AwaiterId>) -> bool {
        holders.iter().all(|&h| self.chain_contains(parent, h))
    }

    /// Whether a request with the given grade and parent may be granted now.
    fn admissible(&self, kind: LockKind, parent: Option<AwaiterId>) -> bool {
        match kind {
            LockKind::Write => {
                self.all_ancestral(&self.write_holders, parent)
                    && self.all_ancestral(&self.upgradeable_holders, parent)
                    && self.all_ancestral(&self.read_holders, parent)
            }
            LockKind::UpgradeableRead => {
                self.all_ancestral(&self.write_holders, parent)
                    && self.all_ancestral(&self.upgradeable_holders, parent)
            }
            LockKind::Read => {
                if !self.all_ancestral(&self.write_holders, parent) {
                    return false;
                }
                // A sticky-upgraded upgradeable read is a logically held
                // write and excludes unrelated readers.
                for &u in &self.upgradeable_holders {
                    if self.record(u).is_some_and(|r| r.sticky_upgraded)
                        && !self.chain_contains(parent, u)
                    {
                        return false;
                    }
                }
                let nested = parent.is_some_and(|p| self.is_held(p));
                // Writer preference: a queued writer blocks new unrelated
                // top-level readers.
                nested || self.waiting_writers.is_empty()
            }
        }
    }

    fn holders_mut(&mut self, kind: LockKind) -> &mut SmallVec<[AwaiterId; 4]> {
        match kind {
            LockKind::Read => &mut self.read_holders,
            LockKind::UpgradeableRead => &mut self.upgradeable_holders,
            LockKind::Write => &mut self.write_holders,
        }
    }

    fn remove_holder(&mut self, kind: LockKind, id: AwaiterId) -> bool {
        let set = self.holders_mut(kind);
        match set.iter().position(|&h| h == id) {
            Some(pos) => {
                set.remove(pos);
                true
            }
            None => false,
        }
    }

    fn queue_len(&self, kind: LockKind) -> usize {
        match kind {
            LockKind::Read => self.waiting_readers.len(),
            LockKind::UpgradeableRead => self.waiting_upgradeables.len(),
            LockKind::Write => self.waiting_writers.len(),
        }
    }

    fn queue_get(&self, kind: LockKind, index: usize) -> AwaiterId {
        match kind {
            LockKind::Read => self.waiting_readers[index],
            LockKind::UpgradeableRead => self.waiting_upgradeables[index],
            LockKind::Write => self.waiting_writers[index],
        }
    }

    fn queue_remove(&mut self, kind: LockKind, index: usize) {
        match kind {
            LockKind::Read => self.waiting_readers.remove(index),
            LockKind::UpgradeableRead => self.waiting_upgradeables.remove(index),
            LockKind::Write => self.waiting_writers.remove(index),
        };
    }

    fn enqueue(&mut self, kind: LockKind, id: AwaiterId) {
        match kind {
            LockKind::Read => self.waiting_readers.push_back(id),
            LockKind::UpgradeableRead => self.waiting_upgradeables.push_back(id),
            LockKind::Write => self.waiting_writers.push_back(id),
        }
    }

    fn dequeue_id(&mut self, kind: LockKind, id: AwaiterId) -> bool {
        let queue = match kind {
            LockKind::Read => &mut self.waiting_readers,
            LockKind::UpgradeableRead => &mut self.waiting_upgradeables,
            LockKind::Write => &mut self.waiting_writers,
        };
        match queue.iter().position(|&q| q == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    fn grant(&mut self, kind: LockKind, id: AwaiterId, wakers: &mut WakeList) {
        if let Some(record) = self.record_mut(id) {
            record.state = AwaiterState::Held;
            if let Some(waker) = record.waker.take() {
                wakers.push(waker);
            }
        }
        self.holders_mut(kind).push(id);
        tracing::trace!(id = %id, kind = %kind, "lock granted");
    }

    /// One scan over a queue. Nested requests are granted from anywhere;
    /// unrelated requests only in FIFO order (the first blocked unrelated
    /// entry fences the rest).
    fn service_queue(&mut self, kind: LockKind, wakers: &mut WakeList) -> bool {
        let mut progress = false;
        let mut fenced = false;
        let mut index = 0;
        while index < self.queue_len(kind) {
            let id = self.queue_get(kind, index);
            let Some(parent) = self.record(id).map(|r| r.parent) else {
                // Stale entry left by an abandoned request.
                self.queue_remove(kind, index);
                continue;
            };
            let nested = parent.is_some_and(|p| self.is_held(p));
            if !nested && fenced {
                index += 1;
                continue;
            }
            if self.admissible(kind, parent) {
                self.queue_remove(kind, index);
                self.grant(kind, id, wakers);
                progress = true;
            } else {
                if !nested {
                    fenced = true;
                }
                index += 1;
            }
        }
        progress
    }

    /// Re-evaluates admission until no further progress. Writers first so
    /// an upgrade or queued writer is never overtaken by readers.
    fn pump(&mut self, wakers: &mut WakeList) {
        loop {
            let mut progress = false;
            progress |= self.service_queue(LockKind::Write, wakers);
            progress |= self.service_queue(LockKind::UpgradeableRead, wakers);
            progress |= self.service_queue(LockKind::Read, wakers);
            if !progress {
                break;
            }
        }
    }

    fn no_holders(&self) -> bool {
        self.read_holders.is_empty()
            && self.upgradeable_holders.is_empty()
            && self.write_holders.is_empty()
    }

    fn no_waiters(&self) -> bool {
        self.waiting_readers.is_empty()
            && self.waiting_upgradeables.is_empty()
            && self.waiting_writers.is_empty()
    }

    /// True once the completion latch should be set: completion requested,
    /// everything released, every callback done.
    fn completion_ready(&mut self) -> bool {
        if self.completion_signaled {
            return false;
        }
        if self.completion_requested
            && self.no_holders()
            && self.no_waiters()
            && self.callbacks.is_empty()
            && self.drains_in_flight == 0
        {
            self.completion_signaled = true;
            return true;
        }
        false
    }

    /// Synchronous release of a held awaiter: clears the holder slot and
    /// re-runs admission. The caller has already dealt with callbacks.
    fn finish_release(
        &mut self,
        kind: LockKind,
        id: AwaiterId,
        wakers: &mut WakeList,
    ) -> Result<(), Error> {
        if !self.remove_holder(kind, id) {
            return Err(Error::invalid_operation(format!(
                "released awaiter {id} is not in the {kind} holder set"
            )));
        }
        if let Some(record) = self.record_mut(id) {
            record.state = AwaiterState::Released;
            record.waker = None;
        }
        tracing::trace!(id = %id, kind = %kind, "lock released");
        self.try_free(id);
        self.pump(wakers);
        Ok(())
    }
}

/// The lock state machine. Owned by the facade behind an `Arc` so that
/// releasers and futures can travel between tasks.
pub(crate) struct LockCore {
    state: ParkingMutex<CoreState>,
    completion: Event,
}

impl LockCore {
    pub(crate) fn new() -> Self {
        Self {
            state: ParkingMutex::new(CoreState::new()),
            completion: Event::new(),
        }
    }

    fn unlock_and_wake(
        &self,
        guard: parking_lot::MutexGuard<'_, CoreState>,
        wakers: WakeList,
        signal_completion: bool,
    ) {
        drop(guard);
        for waker in wakers {
            waker.wake();
        }
        if signal_completion {
            tracing::debug!("lock completion signalled");
            self.completion.set();
        }
    }

    /// Poll-side entry point for acquisition. On the first poll this
    /// validates the request, grants on the fast path, or enqueues;
    /// afterwards it observes grants and cancellation.
    pub(crate) fn poll_acquire(
        &self,
        id_slot: &mut Option<AwaiterId>,
        kind: LockKind,
        flags: LockFlags,
        ctx: &LockContext,
        waker: &Waker,
    ) -> Poll<Result<AwaiterId, Error>> {
        if let Some(id) = *id_slot {
            return self.poll_acquire_pending(id_slot, id, kind, ctx, waker);
        }

        // Failures are delivered through the future, never panicked.
        if !flags.is_valid() {
            return Poll::Ready(Err(Error::invalid_operation(format!(
                "unrecognized lock flags {:#06x}",
                flags.bits()
            ))));
        }
        if flags.contains(LockFlags::STICKY_WRITE) && !matches!(kind, LockKind::UpgradeableRead) {
            return Poll::Ready(Err(Error::invalid_operation(
                "sticky write is only meaningful on an upgradeable read",
            )));
        }
        if ctx.is_cancel_requested() {
            return Poll::Ready(Err(Error::cancelled()));
        }

        let mut snapshot: SmallVec<[AwaiterId; 8]> = SmallVec::new();
        ctx.snapshot_into(&mut snapshot);

        let mut st = self.state.lock();

        // The parent is the innermost lock that is still actually held.
        let parent = snapshot
            .iter()
            .rev()
            .copied()
            .find(|&id| st.is_held(id));

        if st.completion_requested && parent.is_none() {
            return Poll::Ready(Err(Error::new(ErrorKind::Completed)));
        }
        if matches!(kind, LockKind::Write | LockKind::UpgradeableRead)
            && parent.is_some()
            && !st.chain_has_upgrade_grade(parent)
        {
            return Poll::Ready(Err(Error::invalid_operation(format!(
                "cannot escalate a read lock to a {kind} lock"
            ))));
        }

        let nested = parent.is_some();
        let queue_clear = match kind {
            LockKind::Read => true,
            LockKind::Write => nested || st.waiting_writers.is_empty(),
            LockKind::UpgradeableRead => nested || st.waiting_upgradeables.is_empty(),
        };

        if queue_clear && st.admissible(kind, parent) {
            let id = st.insert(kind, flags, parent, AwaiterState::Held, None);
            st.holders_mut(kind).push(id);
            tracing::trace!(id = %id, kind = %kind, nested, "lock granted");
            drop(st);
            ctx.push(id);
            return Poll::Ready(Ok(id));
        }

        let id = st.insert(
            kind,
            flags,
            parent,
            AwaiterState::Pending,
            Some(waker.clone()),
        );
        st.enqueue(kind, id);
        tracing::trace!(id = %id, kind = %kind, nested, "lock queued");
        drop(st);
        *id_slot = Some(id);
        Poll::Pending
    }

    fn poll_acquire_pending(
        &self,
        id_slot: &mut Option<AwaiterId>,
        id: AwaiterId,
        kind: LockKind,
        ctx: &LockContext,
        waker: &Waker,
    ) -> Poll<Result<AwaiterId, Error>> {
        let mut wakers = WakeList::new();
        let mut signal = false;
        let result = {
            let mut st = self.state.lock();
            let state = st.record(id).map(|r| r.state);
            match state {
                None => {
                    *id_slot = None;
                    Poll::Ready(Err(Error::invalid_operation(
                        "pending awaiter record vanished",
                    )))
                }
                Some(AwaiterState::Held) => {
                    *id_slot = None;
                    Poll::Ready(Ok(id))
                }
                Some(AwaiterState::Pending) => {
                    if ctx.is_cancel_requested() {
                        // Revoke the pending request and re-run admission:
                        // a cancelled writer must unblock queued readers.
                        if let Some(record) = st.record_mut(id) {
                            record.state = AwaiterState::Canceled;
                            record.waker = None;
                        }
                        st.dequeue_id(kind, id);
                        st.try_free(id);
                        st.pump(&mut wakers);
                        signal = st.completion_ready();
                        *id_slot = None;
                        tracing::trace!(id = %id, kind = %kind, "pending lock cancelled");
                        Poll::Ready(Err(Error::cancelled()))
                    } else {
                        if let Some(record) = st.record_mut(id) {
                            match &mut record.waker {
                                Some(existing) if existing.will_wake(waker) => {}
                                Some(existing) => existing.clone_from(waker),
                                slot @ None => *slot = Some(waker.clone()),
                            }
                        }
                        Poll::Pending
                    }
                }
                Some(_) => {
                    *id_slot = None;
                    Poll::Ready(Err(Error::invalid_operation(
                        "pending awaiter in unexpected state",
                    )))
                }
            }
        };
        for woken in wakers {
            woken.wake();
        }
        if signal {
            self.completion.set();
        }
        if let Poll::Ready(Ok(granted)) = &result {
            ctx.push(*granted);
        }
        result
    }

    /// Called when an acquisition future is dropped while it still owns a
    /// request: a pending record is dequeued as if never enqueued; a record
    /// that was granted but never observed is released.
    pub(crate) fn abandon_request(core: &std::sync::Arc<LockCore>, id: AwaiterId) {
        let mut wakers = WakeList::new();
        let mut release_held = false;
        {
            let mut st = core.state.lock();
            let Some(record) = st.record(id) else {
                return;
            };
            let kind = record.kind;
            match record.state {
                AwaiterState::Pending => {
                    if let Some(rec) = st.record_mut(id) {
                        rec.state = AwaiterState::Canceled;
                        rec.waker = None;
                    }
                    st.dequeue_id(kind, id);
                    st.try_free(id);
                    st.pump(&mut wakers);
                    let signal = st.completion_ready();
                    core.unlock_and_wake(st, wakers, signal);
                    return;
                }
                AwaiterState::Held => {
                    // Grant raced with the drop; release below, outside
                    // this guard, through the normal pipeline rules.
                    release_held = true;
                }
                _ => {}
            }
        }
        if release_held {
            let fut = super::pipeline::ReleaseFuture::new_internal(
                std::sync::Arc::clone(core),
                id,
                None,
                false,
            );
            let _ = crate::util::block_on(fut);
        }
    }

    /// Synchronous half of a release. Returns [`ReleaseStart::Drain`] when
    /// callbacks must run before the holder slot clears.
    pub(crate) fn begin_release(&self, id: AwaiterId) -> Result<ReleaseStart, Error> {
        let mut wakers = WakeList::new();
        let mut st = self.state.lock();

        let Some(record) = st.record(id) else {
            return Err(Error::invalid_operation(format!("awaiter {id} is not live")));
        };
        let kind = record.kind;
        let parent = record.parent;
        let sticky_upgraded = record.sticky_upgraded;
        let deferred_empty = record.deferred.is_empty();
        match record.state {
            AwaiterState::Held => {}
            AwaiterState::Draining => {
                return Err(Error::invalid_operation(format!(
                    "awaiter {id} release already in progress"
                )));
            }
            _ => {
                return Err(Error::invalid_operation(format!("awaiter {id} is not held")));
            }
        }

        let start = match kind {
            LockKind::Read => {
                st.finish_release(kind, id, &mut wakers)?;
                ReleaseStart::Done
            }
            LockKind::UpgradeableRead => {
                if sticky_upgraded && !deferred_empty {
                    if let Some(rec) = st.record_mut(id) {
                        rec.state = AwaiterState::Draining;
                    }
                    st.drains_in_flight += 1;
                    ReleaseStart::Drain
                } else {
                    if let Some(rec) = st.record_mut(id) {
                        rec.sticky_upgraded = false;
                    }
                    st.finish_release(kind, id, &mut wakers)?;
                    ReleaseStart::Done
                }
            }
            LockKind::Write => {
                let last_write =
                    st.write_holders.len() == 1 && st.write_holders.first() == Some(&id);
                if !last_write {
                    st.finish_release(kind, id, &mut wakers)?;
                    ReleaseStart::Done
                } else if let Some(sticky) = st.nearest_sticky_ancestor(parent) {
                    // Sticky hand-off: the upgradeable read keeps the write
                    // logically active and inherits the callback queue
                    // until it releases.
                    let callbacks = std::mem::take(&mut st.callbacks);
                    if let Some(ancestor) = st.record_mut(sticky) {
                        ancestor.sticky_upgraded = true;
                        ancestor.deferred.extend(callbacks);
                    }
                    tracing::trace!(
                        id = %id,
                        ancestor = %sticky,
                        "write retained by sticky upgradeable read"
                    );
                    st.finish_release(kind, id, &mut wakers)?;
                    ReleaseStart::Done
                } else if st.callbacks.is_empty() {
                    st.finish_release(kind, id, &mut wakers)?;
                    ReleaseStart::Done
                } else {
                    if let Some(rec) = st.record_mut(id) {
                        rec.state = AwaiterState::Draining;
                    }
                    st.drains_in_flight += 1;
                    ReleaseStart::Drain
                }
            }
        };
        let signal = st.completion_ready();
        self.unlock_and_wake(st, wakers, signal);
        Ok(start)
    }

    /// Pops the next callback for a draining awaiter. Callbacks appended
    /// while the drain runs are picked up by the same pass.
    pub(crate) fn next_drain_callback(&self, id: AwaiterId) -> Option<ReleaseCallback> {
        let mut st = self.state.lock();
        let record = st.record(id)?;
        if record.state != AwaiterState::Draining {
            return None;
        }
        let kind = record.kind;
        let entry = match kind {
            LockKind::Write => st.callbacks.pop_front(),
            LockKind::UpgradeableRead => st.record_mut(id).and_then(|r| r.deferred.pop_front()),
            LockKind::Read => None,
        }?;
        tracing::trace!(id = %id, registered_under = %entry.registered_under, "running release callback");
        Some(entry.run)
    }

    /// Completes a drain: clears the holder slot, re-runs admission, and
    /// routes the aggregate. An unobserved aggregate is surfaced through
    /// `completion`.
    pub(crate) fn finish_drain(
        &self,
        id: AwaiterId,
        errors: Vec<Error>,
        observed: bool,
    ) -> Result<(), Error> {
        let aggregate = if errors.is_empty() {
            None
        } else {
            Some(Error::aggregate(errors))
        };

        let mut wakers = WakeList::new();
        let released = {
            let mut st = self.state.lock();
            let Some(record) = st.record(id) else {
                return Err(Error::invalid_operation(format!(
                    "draining awaiter {id} vanished"
                )));
            };
            let kind = record.kind;
            if record.state != AwaiterState::Draining {
                return Err(Error::invalid_operation(format!(
                    "awaiter {id} is not draining"
                )));
            }
            if matches!(kind, LockKind::UpgradeableRead) {
                if let Some(rec) = st.record_mut(id) {
                    rec.sticky_upgraded = false;
                }
            }
            st.drains_in_flight -= 1;
            let released = st.finish_release(kind, id, &mut wakers);
            if let Some(err) = &aggregate {
                tracing::warn!(id = %id, error = %err, "release callbacks failed");
                if !observed {
                    st.completion_error = Some(err.clone());
                }
            }
            let signal = st.completion_ready();
            self.unlock_and_wake(st, wakers, signal);
            released
        };
        released?;
        match (aggregate, observed) {
            (Some(err), true) => Err(err),
            _ => Ok(()),
        }
    }

    /// True when releasing `id` would have to drain callbacks.
    pub(crate) fn release_requires_drain(&self, id: AwaiterId) -> bool {
        let st = self.state.lock();
        let Some(record) = st.record(id) else {
            return false;
        };
        if record.state != AwaiterState::Held {
            return false;
        }
        match record.kind {
            LockKind::Read => false,
            LockKind::UpgradeableRead => record.sticky_upgraded && !record.deferred.is_empty(),
            LockKind::Write => {
                st.write_holders.len() == 1
                    && st.write_holders.first() == Some(&id)
                    && st.nearest_sticky_ancestor(record.parent).is_none()
                    && !st.callbacks.is_empty()
            }
        }
    }

    /// Registers a callback to run while the write lock is still held, just
    /// before it is released.
    pub(crate) fn register_callback(
        &self,
        ctx: &LockContext,
        callback: ReleaseCallback,
    ) -> Result<(), Error> {
        let mut snapshot: SmallVec<[AwaiterId; 8]> = SmallVec::new();
        ctx.snapshot_into(&mut snapshot);

        let mut st = self.state.lock();

        // Innermost actual write first, then an upgradeable read that is
        // retaining a released sticky write.
        let write_target = snapshot.iter().rev().copied().find(|&id| {
            st.record(id)
                .is_some_and(|r| r.is_held() && matches!(r.kind, LockKind::Write))
        });
        if let Some(id) = write_target {
            st.callbacks.push_back(CallbackEntry {
                registered_under: id,
                run: callback,
            });
            return Ok(());
        }

        let sticky_target = snapshot.iter().rev().copied().find(|&id| {
            st.record(id).is_some_and(|r| {
                r.is_held() && matches!(r.kind, LockKind::UpgradeableRead) && r.sticky_upgraded
            })
        });
        if let Some(id) = sticky_target {
            if let Some(rec) = st.record_mut(id) {
                rec.deferred.push_back(CallbackEntry {
                    registered_under: id,
                    run: callback,
                });
                return Ok(());
            }
        }
        Err(Error::invalid_operation(
            "release callbacks require a held write lock",
        ))
    }

    /// Marks the lock as draining. Idempotent. New top-level requests fail;
    /// requests already queued are still serviced.
    pub(crate) fn complete(&self) {
        let signal = {
            let mut st = self.state.lock();
            if !st.completion_requested {
                st.completion_requested = true;
                tracing::debug!("lock marked complete");
            }
            st.completion_ready()
        };
        if signal {
            tracing::debug!("lock completion signalled");
            self.completion.set();
        }
    }

    pub(crate) fn completion_event(&self) -> &Event {
        &self.completion
    }

    pub(crate) fn completion_result(&self) -> Result<(), Error> {
        match self.state.lock().completion_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn is_completion_requested(&self) -> bool {
        self.state.lock().completion_requested
    }

    /// (read, upgradeable-read, write) holders, draining included.
    pub(crate) fn held_counts(&self) -> (usize, usize, usize) {
        let st = self.state.lock();
        (
            st.read_holders.len(),
            st.upgradeable_holders.len(),
            st.write_holders.len(),
        )
    }

    /// (read, upgradeable-read, write) pending queue depths.
    pub(crate) fn pending_counts(&self) -> (usize, usize, usize) {
        let st = self.state.lock();
        (
            st.waiting_readers.len(),
            st.waiting_upgradeables.len(),
            st.waiting_writers.len(),
        )
    }

    fn context_holds<F>(&self, ctx: &LockContext, predicate: F) -> bool
    where
        F: Fn(&AwaiterRecord) -> bool,
    {
        let mut snapshot: SmallVec<[AwaiterId; 8]> = SmallVec::new();
        ctx.snapshot_into(&mut snapshot);
        if snapshot.is_empty() {
            return false;
        }
        let st = self.state.lock();
        snapshot
            .iter()
            .any(|&id| st.record(id).is_some_and(|r| r.is_held() && predicate(r)))
    }

    pub(crate) fn is_read_lock_held(&self, ctx: &LockContext) -> bool {
        self.context_holds(ctx, |r| matches!(r.kind, LockKind::Read))
    }

    pub(crate) fn is_upgradeable_read_lock_held(&self, ctx: &LockContext) -> bool {
        self.context_holds(ctx, |r| matches!(r.kind, LockKind::UpgradeableRead))
    }

    pub(crate) fn is_write_lock_held(&self, ctx: &LockContext) -> bool {
        self.context_holds(ctx, |r| {
            matches!(r.kind, LockKind::Write)
                || (matches!(r.kind, LockKind::UpgradeableRead) && r.sticky_upgraded)
        })
    }

    /// True if the context's visible stack holds a lock whose flags contain
    /// all of `flags`.
    pub(crate) fn lock_stack_contains(&self, flags: LockFlags, ctx: &LockContext) -> bool {
        self.context_holds(ctx, |r| r.flags.contains(flags))
    }

    /// True if the ancestor chain of `id` (inclusive) holds a lock whose
    /// flags contain all of `flags`.
    pub(crate) fn awaiter_chain_contains(&self, flags: LockFlags, id: AwaiterId) -> bool {
        let st = self.state.lock();
        let mut current = Some(id);
        while let Some(cursor) = current {
            match st.record(cursor) {
                Some(record) => {
                    if record.is_held() && record.flags.contains(flags) {
                        return true;
                    }
                    current = record.parent;
                }
                None => return false,
            }
        }
        false
    }

    #[cfg(test)]
    fn slab_len(&self) -> usize {
        self.state.lock().slots.len()
    }

    #[cfg(test)]
    fn live_records(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| s.record.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn noop() -> Waker {
        Waker::noop().clone()
    }

    /// Polls an acquisition once; `Pending` leaves the request queued in
    /// `slot`.
    fn poll_request(
        core: &LockCore,
        ctx: &LockContext,
        kind: LockKind,
        flags: LockFlags,
        slot: &mut Option<AwaiterId>,
    ) -> Poll<Result<AwaiterId, Error>> {
        let waker = noop();
        core.poll_acquire(slot, kind, flags, ctx, &waker)
    }

    fn acquire(core: &LockCore, ctx: &LockContext, kind: LockKind) -> AwaiterId {
        acquire_with(core, ctx, kind, LockFlags::NONE)
    }

    fn acquire_with(
        core: &LockCore,
        ctx: &LockContext,
        kind: LockKind,
        flags: LockFlags,
    ) -> AwaiterId {
        let mut slot = None;
        match poll_request(core, ctx, kind, flags, &mut slot) {
            Poll::Ready(Ok(id)) => id,
            other => panic!("expected immediate grant, got {other:?}"),
        }
    }

    fn release(core: &LockCore, ctx: &LockContext, id: AwaiterId) {
        let start = core.begin_release(id).expect("release should succeed");
        assert_eq!(start, ReleaseStart::Done);
        ctx.pop(id);
    }

    #[test]
    fn concurrent_readers_are_admitted() {
        init_test("concurrent_readers_are_admitted");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let a = acquire(&core, &ctx_a, LockKind::Read);
        let b = acquire(&core, &ctx_b, LockKind::Read);

        let (readers, _, _) = core.held_counts();
        crate::assert_with_log!(readers == 2, "both readers held", 2usize, readers);
        assert!(core.is_read_lock_held(&ctx_a));
        assert!(core.is_read_lock_held(&ctx_b));

        release(&core, &ctx_a, a);
        release(&core, &ctx_b, b);
        let (readers, _, _) = core.held_counts();
        crate::assert_with_log!(readers == 0, "all released", 0usize, readers);
        crate::test_complete!("concurrent_readers_are_admitted");
    }

    #[test]
    fn writer_waits_for_reader_then_acquires() {
        init_test("writer_waits_for_reader_then_acquires");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let reader = acquire(&core, &ctx_a, LockKind::Read);

        let mut slot = None;
        let pending =
            poll_request(&core, &ctx_b, LockKind::Write, LockFlags::NONE, &mut slot).is_pending();
        crate::assert_with_log!(pending, "writer pending behind reader", true, pending);

        release(&core, &ctx_a, reader);

        let granted = matches!(
            poll_request(&core, &ctx_b, LockKind::Write, LockFlags::NONE, &mut slot),
            Poll::Ready(Ok(_))
        );
        crate::assert_with_log!(granted, "writer granted after release", true, granted);
        crate::test_complete!("writer_waits_for_reader_then_acquires");
    }

    #[test]
    fn queued_writer_blocks_new_top_level_readers() {
        init_test("queued_writer_blocks_new_top_level_readers");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();
        let ctx_c = LockContext::new();

        let reader = acquire(&core, &ctx_a, LockKind::Read);

        let mut writer_slot = None;
        assert!(
            poll_request(&core, &ctx_b, LockKind::Write, LockFlags::NONE, &mut writer_slot)
                .is_pending()
        );

        // A new unrelated reader queues behind the writer.
        let mut reader_slot = None;
        let reader_pending = poll_request(
            &core,
            &ctx_c,
            LockKind::Read,
            LockFlags::NONE,
            &mut reader_slot,
        )
        .is_pending();
        crate::assert_with_log!(reader_pending, "reader fenced by writer", true, reader_pending);

        // Releasing the original reader admits the writer, not the reader.
        release(&core, &ctx_a, reader);
        let writer = match poll_request(
            &core,
            &ctx_b,
            LockKind::Write,
            LockFlags::NONE,
            &mut writer_slot,
        ) {
            Poll::Ready(Ok(id)) => id,
            other => panic!("writer should be granted, got {other:?}"),
        };
        assert!(
            poll_request(&core, &ctx_c, LockKind::Read, LockFlags::NONE, &mut reader_slot)
                .is_pending()
        );

        // Reader is admitted once the writer is done.
        release(&core, &ctx_b, writer);
        let granted = matches!(
            poll_request(&core, &ctx_c, LockKind::Read, LockFlags::NONE, &mut reader_slot),
            Poll::Ready(Ok(_))
        );
        crate::assert_with_log!(granted, "reader granted after writer", true, granted);
        crate::test_complete!("queued_writer_blocks_new_top_level_readers");
    }

    #[test]
    fn nested_reader_skips_queue_under_pending_writer() {
        init_test("nested_reader_skips_queue_under_pending_writer");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let outer = acquire(&core, &ctx_a, LockKind::Read);

        let mut writer_slot = None;
        assert!(
            poll_request(&core, &ctx_b, LockKind::Write, LockFlags::NONE, &mut writer_slot)
                .is_pending()
        );

        // Same flow requests another read: granted despite the queued writer.
        let nested = acquire(&core, &ctx_a, LockKind::Read);

        release(&core, &ctx_a, nested);
        release(&core, &ctx_a, outer);
        crate::test_complete!("nested_reader_skips_queue_under_pending_writer");
    }

    #[test]
    fn upgradeable_reader_upgrades_ahead_of_queued_writer() {
        init_test("upgradeable_reader_upgrades_ahead_of_queued_writer");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let upgradeable = acquire(&core, &ctx_a, LockKind::UpgradeableRead);

        let mut unrelated_slot = None;
        assert!(poll_request(
            &core,
            &ctx_b,
            LockKind::Write,
            LockFlags::NONE,
            &mut unrelated_slot
        )
        .is_pending());

        // The holder's own upgrade is granted immediately.
        let upgrade = acquire(&core, &ctx_a, LockKind::Write);

        release(&core, &ctx_a, upgrade);
        release(&core, &ctx_a, upgradeable);

        // Now the unrelated writer gets its turn.
        let granted = matches!(
            poll_request(
                &core,
                &ctx_b,
                LockKind::Write,
                LockFlags::NONE,
                &mut unrelated_slot
            ),
            Poll::Ready(Ok(_))
        );
        crate::assert_with_log!(granted, "queued writer granted last", true, granted);
        crate::test_complete!("upgradeable_reader_upgrades_ahead_of_queued_writer");
    }

    #[test]
    fn upgrade_waits_for_existing_readers_to_exit() {
        init_test("upgrade_waits_for_existing_readers_to_exit");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let reader = acquire(&core, &ctx_b, LockKind::Read);
        let upgradeable = acquire(&core, &ctx_a, LockKind::UpgradeableRead);

        let mut upgrade_slot = None;
        let pending = poll_request(
            &core,
            &ctx_a,
            LockKind::Write,
            LockFlags::NONE,
            &mut upgrade_slot,
        )
        .is_pending();
        crate::assert_with_log!(pending, "upgrade waits for reader", true, pending);

        release(&core, &ctx_b, reader);

        let upgrade = match poll_request(
            &core,
            &ctx_a,
            LockKind::Write,
            LockFlags::NONE,
            &mut upgrade_slot,
        ) {
            Poll::Ready(Ok(id)) => id,
            other => panic!("upgrade should be granted after drain, got {other:?}"),
        };

        let (_, ur, w) = core.held_counts();
        assert_eq!((ur, w), (1, 1));
        release(&core, &ctx_a, upgrade);
        release(&core, &ctx_a, upgradeable);
        crate::test_complete!("upgrade_waits_for_existing_readers_to_exit");
    }

    #[test]
    fn second_upgradeable_reader_is_serialized() {
        init_test("second_upgradeable_reader_is_serialized");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let first = acquire(&core, &ctx_a, LockKind::UpgradeableRead);

        let mut slot = None;
        let pending = poll_request(
            &core,
            &ctx_b,
            LockKind::UpgradeableRead,
            LockFlags::NONE,
            &mut slot,
        )
        .is_pending();
        crate::assert_with_log!(pending, "second upgradeable queued", true, pending);

        release(&core, &ctx_a, first);
        let granted = matches!(
            poll_request(
                &core,
                &ctx_b,
                LockKind::UpgradeableRead,
                LockFlags::NONE,
                &mut slot
            ),
            Poll::Ready(Ok(_))
        );
        crate::assert_with_log!(granted, "second granted after first", true, granted);
        crate::test_complete!("second_upgradeable_reader_is_serialized");
    }

    #[test]
    fn escalating_a_plain_read_fails() {
        init_test("escalating_a_plain_read_fails");
        let core = LockCore::new();
        let ctx = LockContext::new();

        let reader = acquire(&core, &ctx, LockKind::Read);

        for kind in [LockKind::Write, LockKind::UpgradeableRead] {
            let mut slot = None;
            let result = poll_request(&core, &ctx, kind, LockFlags::NONE, &mut slot);
            let failed = matches!(
                &result,
                Poll::Ready(Err(e)) if e.kind() == ErrorKind::InvalidOperation
            );
            crate::assert_with_log!(failed, "escalation rejected", true, failed);
        }

        release(&core, &ctx, reader);
        crate::test_complete!("escalating_a_plain_read_fails");
    }

    #[test]
    fn sticky_write_retained_until_upgradeable_release() {
        init_test("sticky_write_retained_until_upgradeable_release");
        let core = LockCore::new();
        let ctx = LockContext::new();

        let upgradeable =
            acquire_with(&core, &ctx, LockKind::UpgradeableRead, LockFlags::STICKY_WRITE);
        let write = acquire(&core, &ctx, LockKind::Write);

        release(&core, &ctx, write);
        // The write slot is empty, but the upgradeable read retains it.
        let (_, _, writes) = core.held_counts();
        assert_eq!(writes, 0);
        assert!(core.is_write_lock_held(&ctx));

        // A second nested write is granted immediately.
        let write_again = acquire(&core, &ctx, LockKind::Write);
        release(&core, &ctx, write_again);
        assert!(core.is_write_lock_held(&ctx));

        // Unrelated readers are excluded while the sticky write is active.
        let other = LockContext::new();
        let mut slot = None;
        let fenced =
            poll_request(&core, &other, LockKind::Read, LockFlags::NONE, &mut slot).is_pending();
        crate::assert_with_log!(fenced, "sticky write excludes readers", true, fenced);

        release(&core, &ctx, upgradeable);
        assert!(!core.is_write_lock_held(&ctx));
        let granted = matches!(
            poll_request(&core, &other, LockKind::Read, LockFlags::NONE, &mut slot),
            Poll::Ready(Ok(_))
        );
        crate::assert_with_log!(granted, "reader admitted after release", true, granted);
        crate::test_complete!("sticky_write_retained_until_upgradeable_release");
    }

    #[test]
    fn non_sticky_upgrade_releases_write_immediately() {
        init_test("non_sticky_upgrade_releases_write_immediately");
        let core = LockCore::new();
        let ctx = LockContext::new();

        let upgradeable = acquire(&core, &ctx, LockKind::UpgradeableRead);
        let write = acquire(&core, &ctx, LockKind::Write);
        release(&core, &ctx, write);

        assert!(!core.is_write_lock_held(&ctx));
        assert!(core.is_upgradeable_read_lock_held(&ctx));

        release(&core, &ctx, upgradeable);
        crate::test_complete!("non_sticky_upgrade_releases_write_immediately");
    }

    #[test]
    fn complete_fails_new_top_level_but_admits_nested() {
        init_test("complete_fails_new_top_level_but_admits_nested");
        let core = LockCore::new();
        let ctx = LockContext::new();

        let reader = acquire(&core, &ctx, LockKind::Read);
        core.complete();

        // Top-level request from another flow fails.
        let other = LockContext::new();
        let mut slot = None;
        let completed = matches!(
            poll_request(&core, &other, LockKind::Read, LockFlags::NONE, &mut slot),
            Poll::Ready(Err(e)) if e.kind() == ErrorKind::Completed
        );
        crate::assert_with_log!(completed, "top-level rejected", true, completed);

        // Nested request under the live reader is still admitted.
        let nested = acquire(&core, &ctx, LockKind::Read);

        release(&core, &ctx, nested);
        release(&core, &ctx, reader);
        assert!(core.completion_event().is_set());
        crate::test_complete!("complete_fails_new_top_level_but_admits_nested");
    }

    #[test]
    fn complete_services_previously_queued_requests() {
        init_test("complete_services_previously_queued_requests");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let writer = acquire(&core, &ctx_a, LockKind::Write);

        let mut queued_slot = None;
        assert!(
            poll_request(&core, &ctx_b, LockKind::Write, LockFlags::NONE, &mut queued_slot)
                .is_pending()
        );

        core.complete();
        assert!(!core.completion_event().is_set());

        release(&core, &ctx_a, writer);

        // The queued request is still serviced after complete.
        let granted = match poll_request(
            &core,
            &ctx_b,
            LockKind::Write,
            LockFlags::NONE,
            &mut queued_slot,
        ) {
            Poll::Ready(Ok(id)) => id,
            other => panic!("queued writer should be granted, got {other:?}"),
        };
        assert!(!core.completion_event().is_set());

        release(&core, &ctx_b, granted);
        assert!(core.completion_event().is_set());
        crate::test_complete!("complete_services_previously_queued_requests");
    }

    #[test]
    fn slab_reuses_slots_over_repeated_acquire_release() {
        init_test("slab_reuses_slots_over_repeated_acquire_release");
        let core = LockCore::new();
        let ctx = LockContext::new();

        // Warm up: one top-level and a three-deep nest.
        let outer = acquire(&core, &ctx, LockKind::UpgradeableRead);
        let mid = acquire(&core, &ctx, LockKind::Read);
        let inner = acquire(&core, &ctx, LockKind::Read);
        release(&core, &ctx, inner);
        release(&core, &ctx, mid);
        release(&core, &ctx, outer);
        let warm = core.slab_len();

        for _ in 0..1000 {
            let outer = acquire(&core, &ctx, LockKind::UpgradeableRead);
            let mid = acquire(&core, &ctx, LockKind::Read);
            let inner = acquire(&core, &ctx, LockKind::Read);
            release(&core, &ctx, inner);
            release(&core, &ctx, mid);
            release(&core, &ctx, outer);
        }

        let after = core.slab_len();
        crate::assert_with_log!(after == warm, "slab does not grow", warm, after);
        crate::assert_with_log!(
            core.live_records() == 0,
            "no live records remain",
            0usize,
            core.live_records()
        );
        crate::test_complete!("slab_reuses_slots_over_repeated_acquire_release");
    }

    #[test]
    fn out_of_order_release_keeps_chains_resolvable() {
        init_test("out_of_order_release_keeps_chains_resolvable");
        let core = LockCore::new();
        let ctx = LockContext::new();

        let outer = acquire(&core, &ctx, LockKind::UpgradeableRead);
        let inner = acquire(&core, &ctx, LockKind::Read);

        // Outer released first; the inner read's chain stays walkable.
        release(&core, &ctx, outer);
        assert!(core.awaiter_chain_contains(LockFlags::NONE, inner));

        release(&core, &ctx, inner);
        crate::assert_with_log!(
            core.live_records() == 0,
            "records reclaimed after out-of-order release",
            0usize,
            core.live_records()
        );
        crate::test_complete!("out_of_order_release_keeps_chains_resolvable");
    }

    #[test]
    fn double_release_is_rejected_by_core() {
        init_test("double_release_is_rejected_by_core");
        let core = LockCore::new();
        let ctx = LockContext::new();
        let other = LockContext::new();

        let first = acquire(&core, &ctx, LockKind::Read);
        let second = acquire(&core, &other, LockKind::Read);

        release(&core, &ctx, first);
        let err = core.begin_release(first).expect_err("second release must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);

        // The sibling holder is untouched.
        let (readers, _, _) = core.held_counts();
        crate::assert_with_log!(readers == 1, "sibling still held", 1usize, readers);
        release(&core, &other, second);
        crate::test_complete!("double_release_is_rejected_by_core");
    }

    #[test]
    fn hidden_locks_are_invisible_but_still_exclude() {
        init_test("hidden_locks_are_invisible_but_still_exclude");
        let core = LockCore::new();
        let ctx = LockContext::new();

        let writer = acquire(&core, &ctx, LockKind::Write);
        assert!(core.is_write_lock_held(&ctx));

        let frame = ctx.hide_locks();
        assert!(!core.is_write_lock_held(&ctx));
        assert!(!core.lock_stack_contains(LockFlags::NONE, &ctx));

        // Other flows are still excluded.
        let other = LockContext::new();
        let mut slot = None;
        assert!(
            poll_request(&core, &other, LockKind::Read, LockFlags::NONE, &mut slot).is_pending()
        );

        drop(frame);
        assert!(core.is_write_lock_held(&ctx));
        release(&core, &ctx, writer);
        crate::test_complete!("hidden_locks_are_invisible_but_still_exclude");
    }

    #[test]
    fn request_under_suppression_is_top_level() {
        init_test("request_under_suppression_is_top_level");
        let core = std::sync::Arc::new(LockCore::new());
        let ctx = LockContext::new();
        let other = LockContext::new();

        let reader = acquire(&core, &ctx, LockKind::Read);

        // An unrelated writer queues; nested reads normally skip the fence.
        let mut writer_slot = None;
        assert!(
            poll_request(&core, &other, LockKind::Write, LockFlags::NONE, &mut writer_slot)
                .is_pending()
        );
        let frame = ctx.hide_locks();

        // Under suppression, the same flow's read is treated as top-level
        // and fences behind the queued writer.
        let mut slot = None;
        let pending =
            poll_request(&core, &ctx, LockKind::Read, LockFlags::NONE, &mut slot).is_pending();
        crate::assert_with_log!(pending, "suppressed request queues", true, pending);

        drop(frame);
        // Drop the pending suppressed request.
        if let Some(id) = slot {
            LockCore::abandon_request(&core, id);
        }
        release(&core, &ctx, reader);
        crate::test_complete!("request_under_suppression_is_top_level");
    }

    #[test]
    fn pre_cancelled_context_fails_without_queueing() {
        init_test("pre_cancelled_context_fails_without_queueing");
        let core = LockCore::new();
        let ctx = LockContext::new();
        ctx.set_cancel_requested(true);

        let mut slot = None;
        let cancelled = matches!(
            poll_request(&core, &ctx, LockKind::Read, LockFlags::NONE, &mut slot),
            Poll::Ready(Err(e)) if e.is_cancelled()
        );
        crate::assert_with_log!(cancelled, "request cancelled", true, cancelled);
        let (r, u, w) = core.pending_counts();
        assert_eq!((r, u, w), (0, 0, 0));
        crate::assert_with_log!(core.live_records() == 0, "nothing queued", 0usize, core.live_records());
        crate::test_complete!("pre_cancelled_context_fails_without_queueing");
    }

    #[test]
    fn cancelling_sole_pending_writer_unblocks_readers() {
        init_test("cancelling_sole_pending_writer_unblocks_readers");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();
        let ctx_c = LockContext::new();

        let reader = acquire(&core, &ctx_a, LockKind::Read);

        let mut writer_slot = None;
        assert!(
            poll_request(&core, &ctx_b, LockKind::Write, LockFlags::NONE, &mut writer_slot)
                .is_pending()
        );

        let mut reader_slot = None;
        assert!(
            poll_request(&core, &ctx_c, LockKind::Read, LockFlags::NONE, &mut reader_slot)
                .is_pending()
        );

        // Cancel the writer; the fenced reader must be admitted.
        ctx_b.set_cancel_requested(true);
        let cancelled = matches!(
            poll_request(&core, &ctx_b, LockKind::Write, LockFlags::NONE, &mut writer_slot),
            Poll::Ready(Err(e)) if e.is_cancelled()
        );
        crate::assert_with_log!(cancelled, "writer cancelled", true, cancelled);

        let granted = matches!(
            poll_request(&core, &ctx_c, LockKind::Read, LockFlags::NONE, &mut reader_slot),
            Poll::Ready(Ok(_))
        );
        crate::assert_with_log!(granted, "reader unblocked", true, granted);

        release(&core, &ctx_a, reader);
        crate::test_complete!("cancelling_sole_pending_writer_unblocks_readers");
    }

    #[test]
    fn cancellation_after_grant_is_ignored() {
        init_test("cancellation_after_grant_is_ignored");
        let core = LockCore::new();
        let ctx_a = LockContext::new();
        let ctx_b = LockContext::new();

        let writer = acquire(&core, &ctx_a, LockKind::Write);

        let mut slot = None;
        assert!(
            poll_request(&core, &ctx_b, LockKind::Read, LockFlags::NONE, &mut slot).is_pending()
        );

        // The release grants the pending reader before the cancel is seen.
        release(&core, &ctx_a, writer);
        ctx_b.set_cancel_requested(true);

        let granted = matches!(
            poll_request(&core, &ctx_b, LockKind::Read, LockFlags::NONE, &mut slot),
            Poll::Ready(Ok(_))
        );
        crate::assert_with_log!(granted, "issued lock survives cancel", true, granted);
        crate::test_complete!("cancellation_after_grant_is_ignored");
    }

    #[test]
    fn sticky_flag_on_non_upgradeable_request_fails() {
        init_test("sticky_flag_on_non_upgradeable_request_fails");
        let core = LockCore::new();
        let ctx = LockContext::new();

        let mut slot = None;
        let waker = noop();
        let rejected = matches!(
            core.poll_acquire(&mut slot, LockKind::Read, LockFlags::STICKY_WRITE, &ctx, &waker),
            Poll::Ready(Err(e)) if e.kind() == ErrorKind::InvalidOperation
        );
        crate::assert_with_log!(rejected, "sticky read rejected", true, rejected);
        crate::test_complete!("sticky_flag_on_non_upgradeable_request_fails");
    }
}
