//! Calls from a worker thread back into the loop that spawned it.

use std::cell::RefCell;
use std::future::Future;

use tokio::runtime::Handle;

use tether_types::{BridgeError, Result};

use crate::future::{CrossThreadFuture, ResolveOnDrop};
use crate::scope::CancelScope;
use crate::work::{Work, run_work};

thread_local! {
    static WORKER_LOOP: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Marks the current thread as a worker of the loop behind `handle` until dropped.
pub(crate) struct WorkerContext {
    previous: Option<Handle>,
}

impl WorkerContext {
    pub(crate) fn enter(handle: Handle) -> Self {
        let previous = WORKER_LOOP.with(|cell| cell.borrow_mut().replace(handle));
        Self { previous }
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        let previous = self.previous.take();
        WORKER_LOOP.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Whether the calling thread is running a blocking call started with
/// [`run_blocking`](crate::run_blocking).
#[must_use]
pub fn in_worker_thread() -> bool {
    WORKER_LOOP.with(|cell| cell.borrow().is_some())
}

fn worker_loop() -> Result<Handle> {
    WORKER_LOOP
        .with(|cell| cell.borrow().clone())
        .ok_or(BridgeError::NotInWorkerThread)
}

/// Run async work on the worker's originating loop and block until it finishes.
pub fn run_in_loop<T, F, Fut>(make: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = worker_loop()?;
    submit(&handle, Work::awaitable(make()))
}

/// Run a synchronous function on the worker's originating loop and block until
/// it returns.
pub fn run_sync_in_loop<T, F>(func: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = worker_loop()?;
    submit(&handle, Work::immediate(func))
}

fn submit<T: Send + 'static>(handle: &Handle, work: Work<T>) -> Result<T> {
    let future = CrossThreadFuture::new();
    handle.spawn(run_work(
        work,
        ResolveOnDrop::new(future.clone()),
        CancelScope::root(),
    ));
    future.result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outside_worker_is_rejected() {
        assert!(!in_worker_thread());
        assert!(matches!(
            run_sync_in_loop(|| anyhow::Ok(())),
            Err(BridgeError::NotInWorkerThread)
        ));
        assert!(matches!(
            run_in_loop(|| async { anyhow::Ok(()) }),
            Err(BridgeError::NotInWorkerThread)
        ));
    }

    #[tokio::test]
    async fn context_is_scoped_to_guard() {
        let handle = Handle::current();
        std::thread::spawn(move || {
            {
                let _context = WorkerContext::enter(handle);
                assert!(in_worker_thread());
            }
            assert!(!in_worker_thread());
        })
        .join()
        .unwrap();
    }
}
