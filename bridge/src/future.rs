//! Thread-safe, single-resolution result cell.
//!
//! A [`CrossThreadFuture`] is created by whoever initiates a cross-thread
//! call, resolved exactly once by the side that executes it, and observed by
//! any number of handles. OS threads block on it with [`CrossThreadFuture::wait`]
//! or [`CrossThreadFuture::result`]; loop tasks await
//! [`CrossThreadFuture::resolved`]. Every terminal-state write happens under
//! the internal mutex, so it happens-before any observation of that state.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use tether_types::{BridgeError, FutureStatus};

type DoneCallback = Box<dyn FnOnce(FutureStatus) + Send>;

enum Slot<T> {
    Pending,
    Running,
    Cancelled,
    Value(T),
    Error(BridgeError),
    /// An observer took the outcome; remembers which terminal state it was.
    Taken(FutureStatus),
}

impl<T> Slot<T> {
    fn status(&self) -> FutureStatus {
        match self {
            Slot::Pending => FutureStatus::Pending,
            Slot::Running => FutureStatus::Running,
            Slot::Cancelled => FutureStatus::Cancelled,
            Slot::Value(_) => FutureStatus::Succeeded,
            Slot::Error(_) => FutureStatus::Failed,
            Slot::Taken(status) => *status,
        }
    }
}

struct State<T> {
    slot: Slot<T>,
    callbacks: Vec<DoneCallback>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Wakes blocked OS threads.
    done: Condvar,
    /// Wakes loop tasks.
    notify: Notify,
}

/// Result cell shared between one producer and any number of observers.
///
/// Handles are cheap to clone. The value is not required to be `Clone`: the
/// first observer to call [`result`](Self::result) takes it, later takers get
/// [`BridgeError::ResultConsumed`]. Cancellation is observed by everyone.
pub struct CrossThreadFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CrossThreadFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for CrossThreadFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossThreadFuture")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Default for CrossThreadFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CrossThreadFuture<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slot: Slot::Pending,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Callbacks never run under the lock, so poisoning only mirrors a
        // panic that already left the state consistent.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> FutureStatus {
        self.lock().slot.status()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status() == FutureStatus::Cancelled
    }

    /// Mark the future as picked up by its producer.
    ///
    /// Returns `false` if it was already cancelled or resolved, in which case
    /// the producer should not publish anything.
    pub fn set_running(&self) -> bool {
        let mut state = self.lock();
        match state.slot {
            Slot::Pending => {
                state.slot = Slot::Running;
                true
            }
            Slot::Running => true,
            _ => false,
        }
    }

    /// Resolve with a value. Ignored (returns `false`) once terminal.
    pub fn resolve(&self, value: T) -> bool {
        self.finish(Slot::Value(value))
    }

    /// Resolve with an error. Ignored (returns `false`) once terminal.
    pub fn resolve_error(&self, err: BridgeError) -> bool {
        self.finish(Slot::Error(err))
    }

    /// Ask for cancellation from any thread.
    ///
    /// A pending or running future becomes cancelled and its callbacks run on
    /// the calling thread. A resolved future is left alone.
    pub fn request_cancel(&self) -> bool {
        self.finish(Slot::Cancelled)
    }

    fn finish(&self, outcome: Slot<T>) -> bool {
        let status = outcome.status();
        let callbacks = {
            let mut state = self.lock();
            if state.slot.status().is_terminal() {
                return false;
            }
            state.slot = outcome;
            std::mem::take(&mut state.callbacks)
        };

        self.shared.done.notify_all();
        self.shared.notify.notify_waiters();
        for callback in callbacks {
            callback(status);
        }
        true
    }

    /// Run `callback` once the future is terminal.
    ///
    /// Registration and the terminal check happen under one lock: if the
    /// future is already terminal the callback runs right here, otherwise it
    /// runs exactly once on the thread that resolves or cancels it.
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce(FutureStatus) + Send + 'static,
    {
        let status = {
            let mut state = self.lock();
            let status = state.slot.status();
            if !status.is_terminal() {
                state.callbacks.push(Box::new(callback));
                return;
            }
            status
        };
        callback(status);
    }

    /// Block the calling thread until the future is terminal.
    pub fn wait(&self) -> FutureStatus {
        let mut state = self.lock();
        while !state.slot.status().is_terminal() {
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.slot.status()
    }

    /// Like [`wait`](Self::wait) with an upper bound. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FutureStatus> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let status = state.slot.status();
            if status.is_terminal() {
                return Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Block until terminal, then take the value or the error.
    pub fn result(&self) -> Result<T, BridgeError> {
        self.wait();
        self.try_take().unwrap_or(Err(BridgeError::ResultConsumed))
    }

    /// Take the outcome without blocking. `None` while still pending or running.
    pub fn try_take(&self) -> Option<Result<T, BridgeError>> {
        let mut state = self.lock();
        let status = state.slot.status();
        if !status.is_terminal() {
            return None;
        }
        let outcome = match std::mem::replace(&mut state.slot, Slot::Taken(status)) {
            Slot::Value(value) => Ok(value),
            Slot::Error(err) => Err(err),
            // Every observer sees the cancellation, so keep it in place.
            Slot::Cancelled => {
                state.slot = Slot::Cancelled;
                Err(BridgeError::Cancelled)
            }
            Slot::Taken(_) | Slot::Pending | Slot::Running => Err(BridgeError::ResultConsumed),
        };
        Some(outcome)
    }

    /// Wait for a terminal state from inside a loop task.
    pub async fn resolved(&self) -> FutureStatus {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resolve between the check and
            // the await still wakes us.
            notified.as_mut().enable();
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            notified.await;
        }
    }

    /// Async counterpart of [`result`](Self::result).
    pub async fn outcome(&self) -> Result<T, BridgeError> {
        self.resolved().await;
        self.try_take().unwrap_or(Err(BridgeError::ResultConsumed))
    }
}

/// Settles a future if its producer goes away without resolving it.
///
/// Producers hold one of these for as long as they own the work. When the
/// work is dropped unresolved (a task dropped by runtime shutdown, a loop
/// thread that exits early) waiters are released with the fallback outcome
/// instead of hanging.
pub(crate) struct ResolveOnDrop<T> {
    future: CrossThreadFuture<T>,
    fallback: Option<BridgeError>,
}

impl<T> ResolveOnDrop<T> {
    /// Falls back to cancellation.
    pub(crate) fn new(future: CrossThreadFuture<T>) -> Self {
        Self {
            future,
            fallback: None,
        }
    }

    /// Falls back to the given error.
    pub(crate) fn with_error(future: CrossThreadFuture<T>, err: BridgeError) -> Self {
        Self {
            future,
            fallback: Some(err),
        }
    }

    pub(crate) fn future(&self) -> &CrossThreadFuture<T> {
        &self.future
    }
}

impl<T> Drop for ResolveOnDrop<T> {
    fn drop(&mut self) {
        if self.future.is_done() {
            return;
        }
        match self.fallback.take() {
            Some(err) => {
                self.future.resolve_error(err);
            }
            None => {
                self.future.request_cancel();
            }
        }
    }
}
