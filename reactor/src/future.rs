//! Completion futures for pending reactor intents.
//!
//! Every connect, listen, and lease intent resolves through an [`IoFuture`]:
//! a promise with three terminal states (completed, failed, cancelled) and
//! at-most-once delivery. Callers may block on the result or attach a
//! [`CompletionCallback`] fired exactly once from the resolving thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ReactorError;

/// Callback notified exactly once when a future reaches a terminal state.
///
/// Invoked on the thread that resolved the intent, outside the future's
/// internal lock.
pub trait CompletionCallback<T>: Send + Sync {
    /// The intent resolved successfully.
    fn completed(&self, _value: &T) {}
    /// The intent resolved with a failure (including timeout).
    fn failed(&self, _err: &ReactorError) {}
    /// The intent was cancelled before resolving.
    fn cancelled(&self) {}
}

enum State<T> {
    Pending,
    Completed(T),
    Failed(ReactorError),
    Cancelled,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    callback: Mutex<Option<Box<dyn CompletionCallback<T>>>>,
}

/// Shared handle to a pending intent's completion state.
pub struct IoFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for IoFuture<T> {
    fn clone(&self) -> Self {
        IoFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> IoFuture<T> {
    /// Creates a pending future with an optional completion callback.
    pub fn new(callback: Option<Box<dyn CompletionCallback<T>>>) -> Self {
        IoFuture {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending),
                cond: Condvar::new(),
                callback: Mutex::new(callback),
            }),
        }
    }

    fn transition(&self, next: State<T>) -> bool {
        let mut state = self.inner.state.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = next;
        self.inner.cond.notify_all();
        true
    }

    fn take_callback(&self) -> Option<Box<dyn CompletionCallback<T>>> {
        self.inner.callback.lock().take()
    }

    /// Resolves the future with a value. Returns `false` if it already
    /// reached a terminal state.
    pub fn complete(&self, value: T) -> bool {
        if !self.transition(State::Completed(value.clone())) {
            return false;
        }
        if let Some(cb) = self.take_callback() {
            cb.completed(&value);
        }
        true
    }

    /// Resolves the future with a failure.
    pub fn fail(&self, err: ReactorError) -> bool {
        if !self.transition(State::Failed(err.clone())) {
            return false;
        }
        if let Some(cb) = self.take_callback() {
            cb.failed(&err);
        }
        true
    }

    /// Cancels the future.
    pub fn cancel(&self) -> bool {
        if !self.transition(State::Cancelled) {
            return false;
        }
        if let Some(cb) = self.take_callback() {
            cb.cancelled();
        }
        true
    }

    /// Whether the future reached any terminal state.
    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock(), State::Pending)
    }

    /// Non-blocking snapshot of the terminal state, if any.
    pub fn try_result(&self) -> Option<Result<T, ReactorError>> {
        match &*self.inner.state.lock() {
            State::Pending => None,
            State::Completed(v) => Some(Ok(v.clone())),
            State::Failed(e) => Some(Err(e.clone())),
            State::Cancelled => Some(Err(ReactorError::Cancelled)),
        }
    }

    /// The failure recorded on this future, if it failed or was cancelled.
    pub fn error(&self) -> Option<ReactorError> {
        match self.try_result() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Blocks until the future resolves.
    pub fn wait(&self) -> Result<T, ReactorError> {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                State::Pending => self.inner.cond.wait(&mut state),
                State::Completed(v) => return Ok(v.clone()),
                State::Failed(e) => return Err(e.clone()),
                State::Cancelled => return Err(ReactorError::Cancelled),
            }
        }
    }

    /// Blocks until the future resolves or the wait itself times out.
    ///
    /// An elapsed wait returns `ReactorError::Timeout` without mutating the
    /// future; the intent remains pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, ReactorError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                State::Pending => {
                    if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                        if matches!(*state, State::Pending) {
                            return Err(ReactorError::Timeout);
                        }
                    }
                }
                State::Completed(v) => return Ok(v.clone()),
                State::Failed(e) => return Err(e.clone()),
                State::Cancelled => return Err(ReactorError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Counter {
        completed: AtomicUsize,
        failed: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Counter {
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
            })
        }
    }

    struct CountingCallback(Arc<Counter>);

    impl CompletionCallback<u32> for CountingCallback {
        fn completed(&self, _: &u32) {
            self.0.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn failed(&self, _: &ReactorError) {
            self.0.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn cancelled(&self) {
            self.0.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivery_is_at_most_once() {
        let counter = Counter::new();
        let future: IoFuture<u32> =
            IoFuture::new(Some(Box::new(CountingCallback(Arc::clone(&counter)))));

        assert!(future.complete(7));
        assert!(!future.complete(8));
        assert!(!future.fail(ReactorError::Timeout));
        assert!(!future.cancel());

        assert_eq!(counter.completed.load(Ordering::SeqCst), 1);
        assert_eq!(counter.failed.load(Ordering::SeqCst), 0);
        assert_eq!(counter.cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(future.wait().unwrap(), 7);
    }

    #[test]
    fn cancel_surfaces_as_cancelled_error() {
        let future: IoFuture<u32> = IoFuture::new(None);
        assert!(future.cancel());
        assert!(matches!(future.wait(), Err(ReactorError::Cancelled)));
    }

    #[test]
    fn wait_unblocks_cross_thread() {
        let future: IoFuture<u32> = IoFuture::new(None);
        let other = future.clone();
        let handle = thread::spawn(move || other.wait());
        thread::sleep(Duration::from_millis(20));
        future.complete(42);
        assert_eq!(handle.join().unwrap().unwrap(), 42);
    }

    #[test]
    fn wait_timeout_leaves_future_pending() {
        let future: IoFuture<u32> = IoFuture::new(None);
        assert!(matches!(
            future.wait_timeout(Duration::from_millis(10)),
            Err(ReactorError::Timeout)
        ));
        assert!(!future.is_done());
        future.complete(1);
        assert_eq!(future.wait().unwrap(), 1);
    }
}
