//! Cancellation scopes for loop tasks.
//!
//! A scope can be cancelled from any thread. Cancellation cascades to child
//! scopes and fires at the next await point of the code running inside
//! [`CancelScope::run`], unless a [`ShieldGuard`] holds it off.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::watch;

use tether_types::BridgeError;

tokio::task_local! {
    static CURRENT: CancelScope;
}

#[derive(Debug, Clone, Copy, Default)]
struct ScopeState {
    cancel_requested: bool,
    shields: usize,
}

impl ScopeState {
    fn fires(self) -> bool {
        self.cancel_requested && self.shields == 0
    }
}

struct ScopeInner {
    state: watch::Sender<ScopeState>,
    parent: Option<CancelScope>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.inner.state.borrow();
        f.debug_struct("CancelScope")
            .field("cancel_requested", &state.cancel_requested)
            .field("shields", &state.shields)
            .finish_non_exhaustive()
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    /// A scope nested in the current task's scope, or a root scope outside one.
    #[must_use]
    pub fn new() -> Self {
        match Self::current() {
            Some(parent) => parent.child(),
            None => Self::root(),
        }
    }

    /// A scope with no parent. Only cancelled directly.
    #[must_use]
    pub fn root() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<CancelScope>) -> Self {
        let (state, _) = watch::channel(ScopeState::default());
        Self {
            inner: Arc::new(ScopeInner {
                state,
                parent,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A child scope. Starts cancelled if this scope already is.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::with_parent(Some(self.clone()));
        {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // `cancel` flips the flag before walking children, so one of the two
        // sides always sees the other.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// The scope of the code currently running inside [`CancelScope::run`].
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Request cancellation from any thread.
    pub fn cancel(&self) {
        let newly = self.inner.state.send_if_modified(|state| {
            if state.cancel_requested {
                false
            } else {
                state.cancel_requested = true;
                true
            }
        });
        if !newly {
            return;
        }

        let children: Vec<_> = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for inner in children {
            CancelScope { inner }.cancel();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.borrow().cancel_requested
    }

    /// Resolves once cancellation is requested and no shield is held.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so the channel stays open while we wait.
        let _ = rx.wait_for(|state| state.fires()).await;
    }

    /// Hold off cancellation of this scope and all its ancestors until the
    /// guard is dropped.
    #[must_use]
    pub fn shield(&self) -> ShieldGuard {
        let mut scopes = Vec::new();
        let mut next = Some(self.clone());
        while let Some(scope) = next {
            scope.inner.state.send_modify(|state| state.shields += 1);
            next = scope.inner.parent.clone();
            scopes.push(scope);
        }
        ShieldGuard { scopes }
    }

    /// Drive `fut` inside this scope.
    ///
    /// Returns [`BridgeError::Cancelled`] without polling `fut` at all if the
    /// scope was cancelled before entry; otherwise `fut` is dropped at the
    /// first await point after cancellation fires.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, BridgeError>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let scoped = CURRENT.scope(self.clone(), fut);
        tokio::select! {
            biased;
            () = self.cancelled() => Err(BridgeError::Cancelled),
            out = scoped => Ok(out),
        }
    }
}

/// Keeps a scope chain from firing cancellation while held.
#[must_use = "cancellation resumes as soon as the guard is dropped"]
pub struct ShieldGuard {
    scopes: Vec<CancelScope>,
}

impl fmt::Debug for ShieldGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShieldGuard")
            .field("depth", &self.scopes.len())
            .finish()
    }
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        for scope in &self.scopes {
            scope
                .inner
                .state
                .send_modify(|state| state.shields = state.shields.saturating_sub(1));
        }
    }
}
