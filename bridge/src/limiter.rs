//! Counting admission limiter for worker threads.

use std::cell::RefCell;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use tether_types::{BridgeError, DEFAULT_THREAD_TOKENS, Result};

#[derive(Debug)]
struct Tokens {
    total: usize,
    /// Permits still out on loan that must be forgotten instead of returned
    /// because the total shrank below what was borrowed.
    debt: usize,
}

struct LimiterInner {
    semaphore: Arc<Semaphore>,
    tokens: Mutex<Tokens>,
}

/// Caps how many blocking calls hold a worker thread at once.
///
/// Clones share the same pool of tokens.
#[derive(Clone)]
pub struct CapacityLimiter {
    inner: Arc<LimiterInner>,
}

impl fmt::Debug for CapacityLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityLimiter")
            .field("total", &self.total_tokens())
            .field("borrowed", &self.borrowed_tokens())
            .finish()
    }
}

fn check_tokens(total: usize) -> Result<NonZeroUsize> {
    if total > Semaphore::MAX_PERMITS {
        return Err(BridgeError::InvalidTokens(total));
    }
    NonZeroUsize::new(total).ok_or(BridgeError::InvalidTokens(total))
}

impl CapacityLimiter {
    pub fn new(total: usize) -> Result<Self> {
        Ok(Self::with_tokens(check_tokens(total)?))
    }

    pub(crate) fn with_tokens(total: NonZeroUsize) -> Self {
        let total = total.get().min(Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(LimiterInner {
                semaphore: Arc::new(Semaphore::new(total)),
                tokens: Mutex::new(Tokens { total, debt: 0 }),
            }),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, Tokens> {
        self.inner
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a token. Waiters are admitted in FIFO order.
    pub async fn acquire(&self) -> Result<LimiterPermit> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::LimiterClosed)?;
        Ok(self.wrap(permit))
    }

    /// Take a token if one is free right now.
    pub fn try_acquire(&self) -> Result<Option<LimiterPermit>> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Some(self.wrap(permit))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(BridgeError::LimiterClosed),
        }
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> LimiterPermit {
        LimiterPermit {
            permit: Some(permit),
            limiter: self.clone(),
        }
    }

    #[must_use]
    pub fn total_tokens(&self) -> usize {
        self.tokens().total
    }

    #[must_use]
    pub fn borrowed_tokens(&self) -> usize {
        let tokens = self.tokens();
        (tokens.total + tokens.debt).saturating_sub(self.inner.semaphore.available_permits())
    }

    #[must_use]
    pub fn available_tokens(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Resize the pool.
    ///
    /// Growing admits waiters right away. Shrinking below the number of
    /// borrowed tokens takes effect as those tokens come back.
    pub fn set_total_tokens(&self, total: usize) -> Result<()> {
        let total = check_tokens(total)?.get();
        let mut tokens = self.tokens();
        if total >= tokens.total {
            let mut grow = total - tokens.total;
            let repaid = grow.min(tokens.debt);
            tokens.debt -= repaid;
            grow -= repaid;
            self.inner.semaphore.add_permits(grow);
        } else {
            let shrink = tokens.total - total;
            let mut removed = 0;
            while removed < shrink {
                match self.inner.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        removed += 1;
                    }
                    Err(_) => break,
                }
            }
            tokens.debt += shrink - removed;
        }
        tracing::debug!(from = tokens.total, to = total, "Resized capacity limiter");
        tokens.total = total;
        Ok(())
    }

    /// Fail current and future waiters with [`BridgeError::LimiterClosed`].
    /// Tokens already held stay valid.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }
}

/// One borrowed token. Returned to the limiter on drop.
#[must_use = "the token is returned as soon as the permit is dropped"]
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
    limiter: CapacityLimiter,
}

impl fmt::Debug for LimiterPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterPermit").finish_non_exhaustive()
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let mut tokens = self.limiter.tokens();
        if tokens.debt > 0 {
            tokens.debt -= 1;
            permit.forget();
        }
    }
}

thread_local! {
    static LOOP_DEFAULT: RefCell<Option<CapacityLimiter>> = const { RefCell::new(None) };
}

static SHARED_DEFAULT: OnceLock<CapacityLimiter> = OnceLock::new();

fn fallback_limiter() -> CapacityLimiter {
    CapacityLimiter::with_tokens(
        NonZeroUsize::new(DEFAULT_THREAD_TOKENS).unwrap_or(NonZeroUsize::MIN),
    )
}

/// The limiter blocking calls use when none is given.
///
/// Each current-thread loop gets its own, created on first use. Multi-thread
/// runtimes share one process-wide limiter.
pub fn default_thread_limiter() -> Result<CapacityLimiter> {
    let handle = Handle::try_current().map_err(|_| BridgeError::NoEventLoop)?;
    if handle.runtime_flavor() != RuntimeFlavor::CurrentThread {
        return Ok(SHARED_DEFAULT.get_or_init(fallback_limiter).clone());
    }
    Ok(LOOP_DEFAULT.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(fallback_limiter)
            .clone()
    }))
}

/// Installs a loop's default limiter on the loop thread for as long as the
/// loop runs.
pub(crate) struct LoopLimiterGuard {
    previous: Option<CapacityLimiter>,
}

impl LoopLimiterGuard {
    pub(crate) fn install(limiter: CapacityLimiter) -> Self {
        let previous = LOOP_DEFAULT.with(|cell| cell.borrow_mut().replace(limiter));
        Self { previous }
    }
}

impl Drop for LoopLimiterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        LOOP_DEFAULT.with(|cell| *cell.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_tokens_rejected() {
        assert!(matches!(
            CapacityLimiter::new(0),
            Err(BridgeError::InvalidTokens(0))
        ));
        let limiter = CapacityLimiter::new(1).unwrap();
        assert!(matches!(
            limiter.set_total_tokens(0),
            Err(BridgeError::InvalidTokens(0))
        ));
    }

    #[test]
    fn counts_follow_permits() {
        let limiter = CapacityLimiter::new(2).unwrap();
        let first = limiter.try_acquire().unwrap().unwrap();
        assert_eq!(limiter.borrowed_tokens(), 1);
        assert_eq!(limiter.available_tokens(), 1);
        let second = limiter.try_acquire().unwrap().unwrap();
        assert!(limiter.try_acquire().unwrap().is_none());
        drop(first);
        drop(second);
        assert_eq!(limiter.borrowed_tokens(), 0);
        assert_eq!(limiter.available_tokens(), 2);
    }

    #[test]
    fn shrink_below_borrowed_is_repaid_on_release() {
        let limiter = CapacityLimiter::new(3).unwrap();
        let a = limiter.try_acquire().unwrap().unwrap();
        let b = limiter.try_acquire().unwrap().unwrap();

        limiter.set_total_tokens(1).unwrap();
        assert_eq!(limiter.total_tokens(), 1);
        assert_eq!(limiter.available_tokens(), 0);
        assert_eq!(limiter.borrowed_tokens(), 2);

        drop(a);
        assert_eq!(limiter.available_tokens(), 0);
        drop(b);
        assert_eq!(limiter.available_tokens(), 1);
        assert_eq!(limiter.borrowed_tokens(), 0);
    }

    #[test]
    fn grow_repays_debt_first() {
        let limiter = CapacityLimiter::new(2).unwrap();
        let a = limiter.try_acquire().unwrap().unwrap();
        let b = limiter.try_acquire().unwrap().unwrap();
        limiter.set_total_tokens(1).unwrap();
        limiter.set_total_tokens(3).unwrap();
        assert_eq!(limiter.available_tokens(), 1);
        drop(a);
        drop(b);
        assert_eq!(limiter.available_tokens(), 3);
    }

    #[tokio::test]
    async fn grow_admits_waiter() {
        let limiter = CapacityLimiter::new(1).unwrap();
        let _held = limiter.acquire().await.unwrap();

        let waiter = limiter.clone();
        let pending = tokio::spawn(async move { waiter.acquire().await.map(drop) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        limiter.set_total_tokens(2).unwrap();
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let limiter = CapacityLimiter::new(1).unwrap();
        let _held = limiter.acquire().await.unwrap();
        limiter.close();
        assert!(matches!(
            limiter.acquire().await,
            Err(BridgeError::LimiterClosed)
        ));
        assert!(matches!(
            limiter.try_acquire(),
            Err(BridgeError::LimiterClosed)
        ));
    }

    #[test]
    fn default_limiter_needs_a_loop() {
        assert!(matches!(
            default_thread_limiter(),
            Err(BridgeError::NoEventLoop)
        ));
    }

    #[tokio::test]
    async fn default_limiter_is_shared_within_a_loop() {
        let first = default_thread_limiter().unwrap();
        let second = default_thread_limiter().unwrap();
        assert_eq!(first.total_tokens(), DEFAULT_THREAD_TOKENS);
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
    }

    #[tokio::test]
    async fn installed_limiter_wins_and_is_restored() {
        let installed = CapacityLimiter::new(3).unwrap();
        {
            let _guard = LoopLimiterGuard::install(installed.clone());
            assert!(Arc::ptr_eq(
                &default_thread_limiter().unwrap().inner,
                &installed.inner
            ));
        }
        assert!(!Arc::ptr_eq(
            &default_thread_limiter().unwrap().inner,
            &installed.inner
        ));
    }
}
