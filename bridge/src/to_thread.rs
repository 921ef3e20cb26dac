//! Offloading blocking calls from the loop to worker threads.

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use tether_types::{BridgeError, Result};

use crate::from_thread::WorkerContext;
use crate::future::CrossThreadFuture;
use crate::limiter::{CapacityLimiter, default_thread_limiter};
use crate::scope::CancelScope;

#[derive(Debug, Clone, Default)]
pub struct BlockingOptions {
    /// Let cancellation abandon the call instead of waiting for it.
    pub cancellable: bool,
    /// Limiter to borrow a token from. The loop's default when `None`.
    pub limiter: Option<CapacityLimiter>,
}

impl BlockingOptions {
    #[must_use]
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    #[must_use]
    pub fn limiter(mut self, limiter: CapacityLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

/// Run `func` on a worker thread and await its result.
///
/// A token is borrowed from the limiter before the thread is used and held
/// until `func` returns, so the limiter bounds live worker threads even when
/// callers stop waiting. Inside a worker, [`run_in_loop`](crate::run_in_loop)
/// reaches back into this loop.
///
/// With `cancellable` set, cancelling the enclosing scope (or dropping the
/// returned future) abandons the call at once: `func` keeps running and its
/// result is discarded. Otherwise cancellation of the enclosing scopes is held
/// off until `func` returns, and is then reported as
/// [`BridgeError::Cancelled`]. A panic in `func` resumes in the caller.
pub async fn run_blocking<T, F>(func: F, options: BlockingOptions) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = Handle::try_current().map_err(|_| BridgeError::NoEventLoop)?;
    let limiter = match options.limiter {
        Some(limiter) => limiter,
        None => default_thread_limiter()?,
    };
    let permit = limiter.acquire().await?;

    let future = CrossThreadFuture::new();
    let producer = future.clone();
    let worker_loop = handle.clone();
    let join = handle.spawn_blocking(move || {
        let _permit = permit;
        let _context = WorkerContext::enter(worker_loop);
        match func() {
            Ok(value) => producer.resolve(value),
            Err(err) => producer.resolve_error(BridgeError::flatten(err)),
        };
    });

    if options.cancellable {
        return collect(join, &future).await;
    }

    let scope = CancelScope::current();
    let _shield = scope.as_ref().map(CancelScope::shield);
    let outcome = collect(join, &future).await;
    if scope.is_some_and(|scope| scope.is_cancelled()) {
        tracing::debug!("Blocking call finished after cancellation was requested");
        return Err(BridgeError::Cancelled);
    }
    outcome
}

async fn collect<T>(join: JoinHandle<()>, future: &CrossThreadFuture<T>) -> Result<T> {
    match join.await {
        Ok(()) => future.try_take().unwrap_or(Err(BridgeError::Cancelled)),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // The runtime is shutting down and dropped the call before it ran.
        Err(_) => Err(BridgeError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::from_thread::{in_worker_thread, run_sync_in_loop};

    #[tokio::test]
    async fn returns_value_from_worker() {
        let loop_thread = std::thread::current().id();
        let (value, worker_thread) = run_blocking(
            || anyhow::Ok((6 * 7, std::thread::current().id())),
            BlockingOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_ne!(worker_thread, loop_thread);
    }

    #[tokio::test]
    async fn error_reaches_caller_unchanged() {
        let err = run_blocking(
            || Err::<(), _>(anyhow::anyhow!("disk full")),
            BlockingOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn panic_resumes_in_caller() {
        use futures_util::FutureExt;
        let outcome = std::panic::AssertUnwindSafe(run_blocking(
            || -> anyhow::Result<()> { panic!("worker panic") },
            BlockingOptions::default(),
        ))
        .catch_unwind()
        .await;
        let payload = outcome.unwrap_err();
        assert_eq!(tether_types::panic_message(payload.as_ref()), "worker panic");
    }

    #[tokio::test]
    async fn permit_is_returned_after_call() {
        let limiter = CapacityLimiter::new(1).unwrap();
        for _ in 0..3 {
            run_blocking(|| anyhow::Ok(()), BlockingOptions::default().limiter(limiter.clone()))
                .await
                .unwrap();
        }
        assert_eq!(limiter.borrowed_tokens(), 0);
    }

    #[tokio::test]
    async fn closed_limiter_rejects_call() {
        let limiter = CapacityLimiter::new(1).unwrap();
        limiter.close();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let err = run_blocking(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            },
            BlockingOptions::default().limiter(limiter),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::LimiterClosed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn worker_can_call_back_into_loop() {
        let loop_thread = std::thread::current().id();
        let seen = run_blocking(
            || {
                assert!(in_worker_thread());
                let seen = run_sync_in_loop(|| anyhow::Ok(std::thread::current().id()))?;
                anyhow::Ok(seen)
            },
            BlockingOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(seen, loop_thread);
    }

    #[tokio::test]
    async fn dropped_call_keeps_permit_until_worker_finishes() {
        let limiter = CapacityLimiter::new(1).unwrap();
        let call = run_blocking(
            || {
                std::thread::sleep(Duration::from_millis(100));
                anyhow::Ok(())
            },
            BlockingOptions::default()
                .cancellable(true)
                .limiter(limiter.clone()),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(20), call).await;
        assert!(timed_out.is_err());
        assert_eq!(limiter.borrowed_tokens(), 1);

        tokio::time::timeout(Duration::from_secs(2), limiter.acquire())
            .await
            .unwrap()
            .unwrap();
    }
}
