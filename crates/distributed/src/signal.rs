//! Settable, cloneable completion signals.
//!
//! A [`CompletionSignal`] resolves at most once. Waiters obtain a boxed future
//! with [`CompletionSignal::wait`]; [`any_of`] resolves on the first of many.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};

#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    sender: Mutex<Option<oneshot::Sender<()>>>,
    done: AtomicBool,
    future: Shared<BoxFuture<'static, ()>>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel::<()>();
        // A dropped sender also wakes waiters; teardown relies on that.
        let future = rx.map(|_| ()).boxed().shared();
        Self {
            inner: Arc::new(SignalInner {
                sender: Mutex::new(Some(tx)),
                done: AtomicBool::new(false),
                future,
            }),
        }
    }

    /// Resolves the signal. Returns true only for the call that resolved it.
    pub fn complete(&self) -> bool {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                self.inner.done.store(true, Ordering::Release);
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    pub fn wait(&self) -> BoxFuture<'static, ()> {
        self.inner.future.clone().boxed()
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Already-resolved future.
pub fn resolved() -> BoxFuture<'static, ()> {
    future::ready(()).boxed()
}

/// Resolves when the first input resolves; immediately when `futures` is empty.
pub fn any_of(futures: Vec<BoxFuture<'static, ()>>) -> BoxFuture<'static, ()> {
    if futures.is_empty() {
        return resolved();
    }
    future::select_all(futures).map(|_| ()).boxed()
}
