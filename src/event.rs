//! Latched event primitive with cancel-aware waiting.
//!
//! [`Event`] is a manually reset signal: once [`Event::set`] latches it,
//! every current and future [`Event::wait`] resolves until [`Event::reset`]
//! clears the latch. Waiters are resumed through their wakers after the
//! internal lock is dropped, so a continuation never runs on the setter's
//! stack.
//!
//! # Cancel Safety
//!
//! - `wait().await`: cancel-safe, the waiter slot is reclaimed on drop.
//! - `set` before any waiter: latched, the next waiter resolves promptly.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// A latched signal for one-shot conditions.
///
/// # Example
///
/// ```ignore
/// let event = Event::new();
///
/// let fut = async {
///     event.wait().await;
///     println!("signalled");
/// };
///
/// event.set();
/// ```
#[derive(Debug)]
pub struct Event {
    state: Mutex<EventState>,
}

#[derive(Debug)]
struct EventState {
    set: bool,
    waiters: WaiterSlab,
}

/// Slab-like storage for waiters that reuses freed slots so cancelled
/// waiters in the middle do not grow the vector without bound.
#[derive(Debug)]
struct WaiterSlab {
    entries: Vec<WaiterEntry>,
    free_slots: SmallVec<[usize; 4]>,
    /// Number of entries holding a waker. Maintained incrementally so
    /// `active_count()` is O(1).
    active: usize,
}

#[derive(Debug)]
struct WaiterEntry {
    waker: Option<Waker>,
    /// True from insert until the owning future removes the entry. A woken
    /// entry keeps its slot (waker taken, live) until the future cleans up.
    live: bool,
}

impl WaiterSlab {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_slots: SmallVec::new(),
            active: 0,
        }
    }

    #[inline]
    fn insert(&mut self, waker: Waker) -> usize {
        self.active += 1;
        let entry = WaiterEntry {
            waker: Some(waker),
            live: true,
        };
        if let Some(index) = self.free_slots.pop() {
            self.entries[index] = entry;
            index
        } else {
            let index = self.entries.len();
            self.entries.push(entry);
            index
        }
    }

    #[inline]
    fn remove(&mut self, index: usize) {
        if index < self.entries.len() && self.entries[index].live {
            if self.entries[index].waker.is_some() {
                self.active -= 1;
            }
            self.entries[index].waker = None;
            self.entries[index].live = false;
            self.free_slots.push(index);
        }

        // Shrink from the end: pop entries that are free and at the tail.
        while self.entries.last().is_some_and(|e| !e.live) {
            let tail_idx = self.entries.len() - 1;
            self.entries.pop();
            if let Some(pos) = self.free_slots.iter().position(|&i| i == tail_idx) {
                self.free_slots.swap_remove(pos);
            }
        }
    }

    /// Takes every registered waker; slots stay allocated until their
    /// owning futures observe the latch and remove themselves.
    #[inline]
    fn take_wakers(&mut self) -> SmallVec<[Waker; 8]> {
        let wakers: SmallVec<[Waker; 8]> = self
            .entries
            .iter_mut()
            .filter_map(|entry| entry.waker.take())
            .collect();
        self.active -= wakers.len();
        wakers
    }

    #[inline]
    fn active_count(&self) -> usize {
        self.active
    }
}

impl Event {
    /// Creates a new event in the unset state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventState {
                set: false,
                waiters: WaiterSlab::new(),
            }),
        }
    }

    /// Latches the event, waking every registered waiter. Idempotent.
    pub fn set(&self) {
        let wakers = {
            let mut state = self.state.lock();
            if state.set {
                return;
            }
            state.set = true;
            state.waiters.take_wakers()
        };
        // Wake outside the lock.
        for waker in wakers {
            waker.wake();
        }
    }

    /// Clears the latch. Waiters registered afterwards block until the next
    /// `set`.
    pub fn reset(&self) {
        self.state.lock().set = false;
    }

    /// Returns true if the event is currently latched.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Returns a future that completes once the event is latched.
    ///
    /// If the event is already set, the future completes on its first poll;
    /// the continuation still runs on the awaiting task, never inline in
    /// `set`.
    pub fn wait(&self) -> EventWait<'_> {
        EventWait {
            event: self,
            waiter_index: None,
            done: false,
        }
    }

    /// Returns the number of tasks currently waiting.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.active_count()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Event::wait`].
#[derive(Debug)]
pub struct EventWait<'a> {
    event: &'a Event,
    waiter_index: Option<usize>,
    done: bool,
}

impl Future for EventWait<'_> {
    type Output = ();

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            return Poll::Ready(());
        }

        let mut state = self.event.state.lock();
        if state.set {
            if let Some(index) = self.waiter_index.take() {
                state.waiters.remove(index);
            }
            drop(state);
            self.done = true;
            return Poll::Ready(());
        }

        match self.waiter_index {
            Some(index) => {
                // Update the waker in case the executor handed us a new one.
                let waiters = &mut state.waiters;
                match &mut waiters.entries[index].waker {
                    Some(existing) if existing.will_wake(cx.waker()) => {}
                    Some(existing) => existing.clone_from(cx.waker()),
                    slot @ None => {
                        *slot = Some(cx.waker().clone());
                        waiters.active += 1;
                    }
                }
            }
            None => {
                let index = state.waiters.insert(cx.waker().clone());
                drop(state);
                self.waiter_index = Some(index);
                return Poll::Pending;
            }
        }
        drop(state);

        Poll::Pending
    }
}

impl Drop for EventWait<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.waiter_index.take() {
            let mut state = self.event.state.lock();
            state.waiters.remove(index);
        }
    }
}
