//! Units of work submitted to the loop and the runner that executes them.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use tether_types::{BridgeError, FutureStatus, panic_message};

use crate::future::{CrossThreadFuture, ResolveOnDrop};
use crate::scope::CancelScope;

type SyncCall<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;

/// What a caller hands to the loop.
///
/// The caller decides up front whether the work finishes on the spot or has
/// to be awaited, so the runner never has to inspect a returned value.
pub enum Work<T> {
    /// Runs to completion on the loop thread without yielding.
    Immediate(SyncCall<T>),
    /// Awaited inside its own cancel scope.
    Awaitable(BoxFuture<'static, anyhow::Result<T>>),
}

impl<T> fmt::Debug for Work<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Immediate(_) => f.write_str("Work::Immediate"),
            Work::Awaitable(_) => f.write_str("Work::Awaitable"),
        }
    }
}

impl<T: Send + 'static> Work<T> {
    pub fn immediate<F>(func: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Work::Immediate(Box::new(func))
    }

    pub fn awaitable<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Work::Awaitable(Box::pin(fut))
    }
}

/// Execute `work` on the loop and publish its outcome to `slot`.
///
/// Cancellation flows both ways: a future cancelled from another thread
/// cancels `scope`, and a `scope` cancelled from the loop side cancels the
/// future. A panic resolves waiters with [`BridgeError::Panicked`] and then
/// keeps unwinding into the task.
pub(crate) async fn run_work<T>(work: Work<T>, slot: ResolveOnDrop<T>, scope: CancelScope)
where
    T: Send + 'static,
{
    let future = slot.future().clone();
    match work {
        Work::Immediate(func) => {
            if future.is_cancelled() {
                return;
            }
            match std::panic::catch_unwind(AssertUnwindSafe(func)) {
                Ok(outcome) => publish(&future, outcome),
                Err(payload) => {
                    future.resolve_error(BridgeError::Panicked(panic_message(payload.as_ref())));
                    std::panic::resume_unwind(payload);
                }
            }
        }
        Work::Awaitable(fut) => {
            if future.is_cancelled() {
                scope.cancel();
            } else {
                let on_cancel = scope.clone();
                future.on_done(move |status| {
                    if status == FutureStatus::Cancelled {
                        on_cancel.cancel();
                    }
                });
            }

            match AssertUnwindSafe(scope.run(fut)).catch_unwind().await {
                Ok(Ok(outcome)) => publish(&future, outcome),
                Ok(Err(_)) => {
                    future.request_cancel();
                }
                Err(payload) => {
                    future.resolve_error(BridgeError::Panicked(panic_message(payload.as_ref())));
                    std::panic::resume_unwind(payload);
                }
            }
        }
    }
    drop(slot);
}

fn publish<T>(future: &CrossThreadFuture<T>, outcome: anyhow::Result<T>) {
    match outcome {
        Ok(value) => {
            future.resolve(value);
        }
        Err(err) => match BridgeError::flatten(err) {
            BridgeError::Cancelled => {
                future.request_cancel();
            }
            err => {
                future.resolve_error(err);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn slot<T>() -> (CrossThreadFuture<T>, ResolveOnDrop<T>) {
        let future = CrossThreadFuture::new();
        let slot = ResolveOnDrop::new(future.clone());
        (future, slot)
    }

    #[tokio::test]
    async fn immediate_value_is_published() {
        let (future, slot) = slot();
        run_work(Work::immediate(|| anyhow::Ok(21 * 2)), slot, CancelScope::root()).await;
        assert_eq!(future.result().unwrap(), 42);
    }

    #[tokio::test]
    async fn awaitable_error_is_published() {
        let (future, slot) = slot::<()>();
        run_work(
            Work::awaitable(async { Err::<(), _>(anyhow::anyhow!("no route to host")) }),
            slot,
            CancelScope::root(),
        )
        .await;
        let err = future.result().unwrap_err();
        assert_eq!(err.to_string(), "no route to host");
    }

    #[tokio::test]
    async fn propagated_cancellation_cancels_future() {
        let (future, slot) = slot::<()>();
        run_work(
            Work::awaitable(async { Err::<(), _>(anyhow::Error::new(BridgeError::Cancelled)) }),
            slot,
            CancelScope::root(),
        )
        .await;
        assert!(future.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_never_starts_body() {
        let (future, slot) = slot::<()>();
        future.request_cancel();
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        run_work(
            Work::awaitable(async move {
                flag.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            }),
            slot,
            CancelScope::root(),
        )
        .await;
        assert!(!started.load(Ordering::SeqCst));
        assert!(future.is_cancelled());
    }

    #[tokio::test]
    async fn future_cancel_interrupts_running_body() {
        let (future, slot) = slot::<()>();
        let remote = future.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.request_cancel();
        });
        run_work(
            Work::awaitable(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                anyhow::Ok(())
            }),
            slot,
            CancelScope::root(),
        )
        .await;
        assert!(future.is_cancelled());
        canceller.join().unwrap();
    }

    #[tokio::test]
    async fn scope_cancel_cancels_future() {
        let (future, slot) = slot::<()>();
        let scope = CancelScope::root();
        scope.cancel();
        run_work(
            Work::awaitable(async { anyhow::Ok(()) }),
            slot,
            scope,
        )
        .await;
        assert!(future.is_cancelled());
    }

    #[tokio::test]
    async fn panic_resolves_waiters_then_unwinds() {
        let (future, slot) = slot::<u8>();
        let ran = AssertUnwindSafe(run_work(
            Work::immediate(|| -> anyhow::Result<u8> { panic!("sync boom") }),
            slot,
            CancelScope::root(),
        ))
        .catch_unwind()
        .await;
        assert!(ran.is_err());
        assert!(matches!(future.result(), Err(BridgeError::Panicked(msg)) if msg == "sync boom"));
    }

    #[tokio::test]
    async fn unpolled_work_cancels_on_drop() {
        let (future, slot) = slot::<()>();
        drop(run_work(Work::immediate(|| anyhow::Ok(())), slot, CancelScope::root()));
        assert!(future.is_cancelled());
    }
}
