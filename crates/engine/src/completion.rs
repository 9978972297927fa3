//! One-shot completion handle
//!
//! Every operation answer goes through a [`Completion`]. The executor
//! completes it exactly once; the caller picks how to consume it:
//! - block the thread ([`Completion::wait`], [`Completion::wait_timeout`])
//! - `.await` a [`CompletionFuture`]
//! - attach a callback ([`Completion::on_complete`])

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(T) + Send>;

struct State<T> {
    value: Option<T>,
    wakers: Vec<Waker>,
    callback: Option<Callback<T>>,
}

/// Write-once result slot
pub struct Completion<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Empty, not yet completed
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                value: None,
                wakers: Vec::new(),
                callback: None,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store the answer; returns false if one was already stored
    pub fn complete(&self, value: T) -> bool {
        let (callback, wakers) = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            (state.callback.take(), std::mem::take(&mut state.wakers))
        };
        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        if let Some(callback) = callback {
            callback(value);
        }
        true
    }

    /// Whether an answer is stored
    pub fn is_complete(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// The stored answer, if any
    pub fn peek(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Block until completed
    pub fn wait(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = &state.value {
                return value.clone();
            }
            self.ready.wait(&mut state);
        }
    }

    /// Block until completed or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(value) = &state.value {
                return Some(value.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return state.value.clone();
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Run `callback` with the answer, now if already completed
    pub fn on_complete(&self, callback: impl FnOnce(T) + Send + 'static) {
        let ready = {
            let mut state = self.state.lock();
            match &state.value {
                Some(value) => Some(value.clone()),
                None => {
                    state.callback = Some(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(value) = ready {
            callback(value);
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Completion")
            .field("complete", &state.value.is_some())
            .field("has_callback", &state.callback.is_some())
            .finish()
    }
}

/// Future over a shared completion
#[derive(Debug)]
pub struct CompletionFuture<T> {
    completion: Arc<Completion<T>>,
}

impl<T> CompletionFuture<T> {
    /// Await `completion`
    pub fn new(completion: Arc<Completion<T>>) -> Self {
        Self { completion }
    }
}

impl<T: Clone + Send + 'static> Future for CompletionFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.completion.state.lock();
        if let Some(value) = &state.value {
            return Poll::Ready(value.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_completes_once() {
        let c: Completion<u32> = Completion::new();
        assert!(!c.is_complete());
        assert!(c.complete(1));
        assert!(!c.complete(2));
        assert_eq!(c.wait(), 1);
        assert_eq!(c.peek(), Some(1));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let c: Completion<u32> = Completion::new();
        assert_eq!(c.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_wait_wakes_on_complete() {
        let c = Arc::new(Completion::<u32>::new());
        let waiter = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        c.complete(9);
        assert_eq!(waiter.join().unwrap(), Some(9));
    }

    #[test]
    fn test_callback_runs_once_either_order() {
        let calls = Arc::new(AtomicUsize::new(0));

        let before: Completion<u32> = Completion::new();
        let counter = Arc::clone(&calls);
        before.on_complete(move |v| {
            assert_eq!(v, 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        before.complete(3);
        before.complete(4);

        let after: Completion<u32> = Completion::new();
        after.complete(3);
        let counter = Arc::clone(&calls);
        after.on_complete(move |v| {
            assert_eq!(v, 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_future_resolves() {
        let c = Arc::new(Completion::<u32>::new());
        let completer = Arc::clone(&c);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.complete(5);
        });
        assert_eq!(CompletionFuture::new(c).await, 5);
    }
}
