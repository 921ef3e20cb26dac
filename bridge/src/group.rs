use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::Instrument;

use tether_types::panic_message;

use crate::scope::CancelScope;

#[derive(Default)]
struct GroupState {
    live: usize,
    panic: Option<Box<dyn Any + Send>>,
}

/// The set of tasks a portal spawned, with one scope that cancels all of them.
///
/// The first task to panic cancels the rest and fires `on_panic`;
/// [`TaskGroup::join`] rethrows that panic once everything has finished.
pub(crate) struct TaskGroup {
    scope: CancelScope,
    state: Mutex<GroupState>,
    idle: Notify,
    on_panic: Box<dyn Fn() + Send + Sync>,
}

impl TaskGroup {
    pub(crate) fn new(scope: CancelScope, on_panic: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            scope,
            state: Mutex::new(GroupState::default()),
            idle: Notify::new(),
            on_panic: Box::new(on_panic),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub(crate) fn live(&self) -> usize {
        self.lock().live
    }

    pub(crate) fn cancel(&self) {
        self.scope.cancel();
    }

    pub(crate) fn spawn<F>(self: &Arc<Self>, handle: &Handle, name: Option<&str>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.lock().live += 1;
        // Created outside the task so the count drops even if the runtime
        // discards the task without ever polling it.
        let member = Member {
            group: Arc::clone(self),
        };
        let span = tracing::debug_span!("portal_task", name = name.unwrap_or("unnamed"));
        handle.spawn(
            async move {
                if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
                    member.group.record_panic(payload);
                }
                drop(member);
            }
            .instrument(span),
        );
    }

    fn record_panic(&self, payload: Box<dyn Any + Send>) {
        tracing::error!(
            panic = %panic_message(payload.as_ref()),
            "Portal task panicked, cancelling group"
        );
        let first = {
            let mut state = self.lock();
            let first = state.panic.is_none();
            if first {
                state.panic = Some(payload);
            }
            first
        };
        self.scope.cancel();
        if first {
            (self.on_panic)();
        }
    }

    /// Wait for every spawned task to finish, then rethrow the first panic.
    pub(crate) async fn join(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live() == 0 {
                break;
            }
            notified.await;
        }
        let panic = self.lock().panic.take();
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
    }
}

struct Member {
    group: Arc<TaskGroup>,
}

impl Drop for Member {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.group.lock();
            state.live -= 1;
            state.live == 0
        };
        if idle {
            self.group.idle.notify_waiters();
        }
    }
}
