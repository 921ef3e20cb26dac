//! Driving async enter/exit pairs from synchronous code.

use std::fmt;
use std::future::Future;
use std::thread;

use tokio::sync::oneshot;

use tether_types::{BridgeError, Result};

use crate::future::{CrossThreadFuture, ResolveOnDrop};
use crate::portal::Portal;
use crate::work::Work;

/// Something with an async setup step and an async teardown step.
///
/// `exit` receives the error that ended the body, if any, and returns the
/// error to report. Returning `Ok(())` for a given error swallows it.
pub trait AsyncContext: Send + 'static {
    type Value: Send + 'static;

    fn enter(&mut self) -> impl Future<Output = anyhow::Result<Self::Value>> + Send;

    fn exit(self, error: Option<anyhow::Error>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

enum ContextState<C> {
    Idle(C),
    Entered {
        exit_signal: oneshot::Sender<Option<anyhow::Error>>,
        finished: CrossThreadFuture<()>,
    },
    Closed,
}

/// Synchronous handle on an [`AsyncContext`] that lives on a portal's loop.
///
/// Entering spawns one loop task that runs `enter`, parks until the
/// synchronous side exits, then runs `exit` with whatever error it was given.
/// Dropping an entered guard exits cleanly.
pub struct BlockingContext<C: AsyncContext> {
    portal: Portal,
    state: ContextState<C>,
}

impl<C: AsyncContext> fmt::Debug for BlockingContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ContextState::Idle(_) => "idle",
            ContextState::Entered { .. } => "entered",
            ContextState::Closed => "closed",
        };
        f.debug_struct("BlockingContext")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl<C: AsyncContext> BlockingContext<C> {
    pub(crate) fn new(portal: Portal, context: C) -> Self {
        Self {
            portal,
            state: ContextState::Idle(context),
        }
    }

    /// Run the context's `enter` on the loop and return its value.
    pub fn enter(&mut self) -> Result<C::Value> {
        if !matches!(self.state, ContextState::Idle(_)) {
            return Err(BridgeError::ContextMisuse("enter"));
        }
        self.portal.check_running()?;
        let ContextState::Idle(mut context) =
            std::mem::replace(&mut self.state, ContextState::Closed)
        else {
            return Err(BridgeError::ContextMisuse("enter"));
        };

        let entered = CrossThreadFuture::new();
        let (exit_signal, exit_rx) = oneshot::channel();
        let handoff = ResolveOnDrop::new(entered.clone());
        let task = async move {
            let value = match context.enter().await {
                Ok(value) => value,
                Err(err) => {
                    handoff.future().resolve_error(BridgeError::flatten(err));
                    return anyhow::Ok(());
                }
            };
            handoff.future().resolve(value);
            drop(handoff);
            // A dropped sender means the synchronous side went away: exit cleanly.
            let error = exit_rx.await.unwrap_or(None);
            context.exit(error).await
        };

        let finished = self.portal.start_task_soon(Work::awaitable(task), Some("async_context"))?;
        let value = entered.result()?;
        self.state = ContextState::Entered {
            exit_signal,
            finished,
        };
        Ok(value)
    }

    /// Run the context's `exit` with the error that ended the body.
    ///
    /// Returns whatever `exit` reports: `Ok(())` when it swallowed `error`,
    /// the original or a replacement error otherwise.
    pub fn exit(&mut self, error: Option<anyhow::Error>) -> Result<()> {
        if !matches!(self.state, ContextState::Entered { .. }) {
            return Err(BridgeError::ContextMisuse("exit"));
        }
        let ContextState::Entered {
            exit_signal,
            finished,
        } = std::mem::replace(&mut self.state, ContextState::Closed)
        else {
            return Err(BridgeError::ContextMisuse("exit"));
        };
        // The loop side may have been cancelled already; `finished` says how.
        let _ = exit_signal.send(error);
        finished.result()
    }

    /// Enter, run `body`, and exit with the body's error if it failed.
    ///
    /// Returns `Ok(None)` when the body failed and `exit` swallowed the error.
    pub fn scoped<R>(
        &mut self,
        body: impl FnOnce(&mut C::Value) -> anyhow::Result<R>,
    ) -> Result<Option<R>> {
        let mut value = self.enter()?;
        match body(&mut value) {
            Ok(out) => {
                self.exit(None)?;
                Ok(Some(out))
            }
            Err(err) => {
                self.exit(Some(err))?;
                Ok(None)
            }
        }
    }
}

impl<C: AsyncContext> Drop for BlockingContext<C> {
    fn drop(&mut self) {
        let ContextState::Entered {
            exit_signal,
            finished,
        } = std::mem::replace(&mut self.state, ContextState::Closed)
        else {
            return;
        };
        let _ = exit_signal.send(None);
        // Blocking here on the loop thread would deadlock the exit task.
        if thread::current().id() == self.portal.loop_thread() {
            return;
        }
        if let Err(err) = finished.result() {
            tracing::warn!("Async context failed to exit cleanly: {err}");
        }
    }
}
