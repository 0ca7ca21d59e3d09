//! Small internal helpers.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

/// Wakes a parked thread.
struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Drives a future to completion on the current thread.
///
/// Used by the blocking lock variants and by releaser drops that still have
/// callbacks to drain. The caller must not already be inside an executor
/// that owns this thread's parking.
pub(crate) fn block_on<F: Future>(fut: F) -> F::Output {
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut fut = pin!(fut);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn block_on_ready_future() {
        let value = block_on(async { 7 });
        assert_eq!(value, 7);
    }

    #[test]
    fn block_on_parks_until_woken() {
        struct Gate {
            open: Arc<AtomicBool>,
        }

        impl Future for Gate {
            type Output = ();

            fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.open.load(Ordering::Acquire) {
                    Poll::Ready(())
                } else {
                    let open = Arc::clone(&self.open);
                    let waker = cx.waker().clone();
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(20));
                        open.store(true, Ordering::Release);
                        waker.wake();
                    });
                    Poll::Pending
                }
            }
        }

        block_on(Gate {
            open: Arc::new(AtomicBool::new(false)),
        });
    }
}
