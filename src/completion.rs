//! One-shot completion signalling between a ring consumer and a waiter.
//!
//! The IRQ path fulfills a [`Promise`] when the device returns a buffer;
//! the requesting task holds the matching [`Completion`] and either awaits
//! it as a `Future` or blocks on it with [`Completion::wait`], which takes
//! an optional deadline in ticks of a periodic [`Clock`].

use alloc::sync::Arc;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use spin::Mutex;

/// Periodic tick source used for completion deadlines.
pub trait Clock {
    fn ticks(&self) -> u64;
}

/// Clock advanced explicitly by a periodic timer handler.
#[derive(Debug, Default)]
pub struct TickCounter {
    ticks: AtomicU64,
}

impl TickCounter {
    pub const fn new() -> Self {
        Self { ticks: AtomicU64::new(0) }
    }

    /// Called from the timer interrupt.
    pub fn tick(&self) {
        self.advance(1);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }
}

impl Clock for TickCounter {
    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult<T> {
    Ready(T),
    /// Deadline passed first. The completion stays valid and may be waited on again.
    TimedOut,
    /// The promise was dropped without a value (queue torn down or drained).
    Cancelled,
}

impl<T> WaitResult<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }
}

struct Shared<T> {
    value: Mutex<Option<T>>,
    closed: AtomicBool,
    waker: AtomicWaker,
}

/// Create a connected promise/completion pair.
pub fn completion<T>() -> (Promise<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        closed: AtomicBool::new(false),
        waker: AtomicWaker::new(),
    });
    (
        Promise { shared: Some(shared.clone()) },
        Completion { shared },
    )
}

/// Producer half, fulfilled at most once.
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    pub fn fulfill(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            *shared.value.lock() = Some(value);
            shared.closed.store(true, Ordering::Release);
            shared.waker.wake();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.closed.store(true, Ordering::Release);
            shared.waker.wake();
        }
    }
}

/// Consumer half.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completion<T> {
    /// True once the promise was fulfilled or dropped.
    pub fn is_settled(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn try_take(&mut self) -> Option<T> {
        self.shared.value.lock().take()
    }

    fn poll_settled(&mut self) -> Option<WaitResult<T>> {
        if let Some(value) = self.try_take() {
            return Some(WaitResult::Ready(value));
        }
        if self.is_settled() {
            // A fulfill may have landed between the two loads.
            return Some(match self.try_take() {
                Some(value) => WaitResult::Ready(value),
                None => WaitResult::Cancelled,
            });
        }
        None
    }

    /// Block until the completion settles or `timeout` ticks elapse.
    ///
    /// `idle` runs between checks; cooperative callers pass a hook that
    /// yields to the scheduler or processes pending interrupts.
    pub fn wait<C: Clock + ?Sized>(
        &mut self,
        clock: &C,
        timeout: Option<u64>,
        mut idle: impl FnMut(),
    ) -> WaitResult<T> {
        let deadline = timeout.map(|ticks| clock.ticks().saturating_add(ticks));
        loop {
            if let Some(result) = self.poll_settled() {
                return result;
            }
            if let Some(deadline) = deadline {
                if clock.ticks() >= deadline {
                    return WaitResult::TimedOut;
                }
            }
            idle();
        }
    }
}

impl<T> Future for Completion<T> {
    /// `None` if the promise was dropped unfulfilled.
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.poll_settled() {
            return Poll::Ready(result.ready());
        }
        this.shared.waker.register(cx.waker());
        match this.poll_settled() {
            Some(result) => Poll::Ready(result.ready()),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn test_fulfill_then_wait() {
        let clock = TickCounter::new();
        let (promise, mut done) = completion::<u32>();
        assert!(!done.is_settled());
        promise.fulfill(7);
        assert_eq!(done.wait(&clock, None, || {}), WaitResult::Ready(7));
    }

    #[test]
    fn test_wait_times_out() {
        let clock = TickCounter::new();
        let (_promise, mut done) = completion::<u32>();
        let mut idles = 0;
        let result = done.wait(&clock, Some(5), || {
            idles += 1;
            clock.tick();
        });
        assert_eq!(result, WaitResult::TimedOut);
        assert_eq!(idles, 5);
    }

    #[test]
    fn test_dropped_promise_cancels() {
        let clock = TickCounter::new();
        let (promise, mut done) = completion::<u32>();
        drop(promise);
        assert_eq!(done.wait(&clock, Some(1), || {}), WaitResult::Cancelled);
    }

    #[test]
    fn test_completion_as_future() {
        let (promise, mut done) = completion::<&'static str>();
        assert!((&mut done).now_or_never().is_none());
        promise.fulfill("reply");
        assert_eq!(done.now_or_never(), Some(Some("reply")));
    }
}
