//! Entry point for foreign threads into a running loop.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use futures_util::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};

use tether_types::{BridgeError, Result, TaskExit};

use crate::context::{AsyncContext, BlockingContext};
use crate::event::Event;
use crate::future::{CrossThreadFuture, ResolveOnDrop};
use crate::group::TaskGroup;
use crate::scope::CancelScope;
use crate::work::{Work, run_work};

struct PortalInner {
    handle: Handle,
    loop_thread: ThreadId,
    running: AtomicBool,
    stopped: Event,
    group: Arc<TaskGroup>,
}

/// Handle that lets other OS threads run work on one event loop.
///
/// Cloning is cheap; every clone talks to the same loop. All submission
/// methods block the calling thread, so they refuse to run on the loop
/// thread itself.
#[derive(Clone)]
pub struct Portal {
    inner: Arc<PortalInner>,
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("loop_thread", &self.inner.loop_thread)
            .field("running", &self.is_running())
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

/// Handed to a task started with [`Portal::start_task`] so it can report
/// when it is ready.
pub struct TaskStatus<S> {
    ready: CrossThreadFuture<S>,
}

impl<S> fmt::Debug for TaskStatus<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStatus")
            .field("ready", &self.ready.status())
            .finish()
    }
}

impl<S> TaskStatus<S> {
    /// Report readiness and hand `value` to the starter.
    pub fn started(self, value: S) {
        self.ready.resolve(value);
    }
}

impl Portal {
    /// Bind a portal to the current-thread loop running the caller.
    ///
    /// A panic in any portal task stops the portal and cancels the rest.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| BridgeError::NoEventLoop)?;
        if handle.runtime_flavor() != RuntimeFlavor::CurrentThread {
            return Err(BridgeError::UnsupportedRuntime);
        }
        let inner = Arc::new_cyclic(|weak: &Weak<PortalInner>| {
            let weak = weak.clone();
            let group = TaskGroup::new(CancelScope::new(), move || {
                if let Some(inner) = weak.upgrade() {
                    Portal { inner }.stop(true);
                }
            });
            PortalInner {
                handle,
                loop_thread: thread::current().id(),
                running: AtomicBool::new(true),
                stopped: Event::new(),
                group: Arc::new(group),
            }
        });
        let portal = Self { inner };
        tracing::debug!(loop_thread = ?portal.inner.loop_thread, "Portal opened");
        Ok(portal)
    }

    /// Open a portal for the duration of `body`.
    ///
    /// When `body` finishes the portal stops accepting work. On success it
    /// waits for tasks already submitted; on error it cancels them first.
    /// A panic in any portal task is rethrown here once all tasks are done.
    /// If `body` itself panics, the tasks are cancelled and that panic wins.
    pub async fn run<F, Fut, R>(body: F) -> Result<R>
    where
        F: FnOnce(Portal) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let portal = Portal::new()?;
        let caller = portal.clone();
        let outcome = AssertUnwindSafe(async move { body(caller).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => {
                portal.close(result.is_err()).await;
                result
            }
            Err(payload) => {
                portal.stop(true);
                let _ = AssertUnwindSafe(portal.inner.group.join())
                    .catch_unwind()
                    .await;
                panic::resume_unwind(payload)
            }
        }
    }

    /// Stop accepting work and wait for every task to finish.
    pub async fn close(&self, cancel_remaining: bool) {
        self.stop(cancel_remaining);
        self.inner.group.join().await;
        tracing::debug!("Portal closed");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn loop_thread(&self) -> ThreadId {
        self.inner.loop_thread
    }

    /// Tasks spawned through this portal that have not finished yet.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.inner.group.live()
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }
        if thread::current().id() == self.inner.loop_thread {
            return Err(BridgeError::CalledFromLoopThread);
        }
        Ok(())
    }

    /// Stop accepting new work. Callable from any thread.
    ///
    /// With `cancel_remaining`, every task still in flight is cancelled and
    /// its future reports [`BridgeError::Cancelled`].
    pub fn stop(&self, cancel_remaining: bool) {
        let was_running = self.inner.running.swap(false, Ordering::AcqRel);
        self.inner.stopped.set();
        if cancel_remaining {
            self.inner.group.cancel();
        }
        if was_running {
            tracing::info!(cancel_remaining, "Portal stopped");
        }
    }

    /// Wait on the loop until some thread calls [`stop`](Self::stop).
    pub async fn sleep_until_stopped(&self) {
        self.inner.stopped.wait().await;
    }

    fn spawn_work<T>(&self, work: Work<T>, name: Option<&str>, future: CrossThreadFuture<T>)
    where
        T: Send + 'static,
    {
        let scope = self.inner.group.scope().child();
        let task = run_work(work, ResolveOnDrop::new(future), scope);
        self.inner.group.spawn(&self.inner.handle, name, task);
    }

    /// Submit work without waiting for it.
    ///
    /// The returned future resolves with the outcome. Cancelling it cancels
    /// the task; cancelling the task (for example by stopping the portal with
    /// `cancel_remaining`) cancels the future.
    pub fn start_task_soon<T>(
        &self,
        work: Work<T>,
        name: Option<&str>,
    ) -> Result<CrossThreadFuture<T>>
    where
        T: Send + 'static,
    {
        self.check_running()?;
        let future = CrossThreadFuture::new();
        self.spawn_work(work, name, future.clone());
        Ok(future)
    }

    /// Run async work on the loop and block until it finishes.
    pub fn call<T, F, Fut>(&self, make: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.check_running()?;
        self.start_task_soon(Work::awaitable(make()), None)?.result()
    }

    /// Run a synchronous function on the loop thread and block until it returns.
    pub fn call_sync<T, F>(&self, func: F) -> Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.start_task_soon(Work::immediate(func), None)?.result()
    }

    /// Start a task and return as soon as it is scheduled.
    ///
    /// Returns the task's completion future and a second future that resolves
    /// when the task calls [`TaskStatus::started`]. If the task ends without
    /// doing so, the readiness future fails with [`BridgeError::NotStarted`]
    /// while the completion future still reports how the task actually ended.
    pub fn start_task_with_status<S, T, F, Fut>(
        &self,
        make: F,
        name: Option<&str>,
    ) -> Result<(CrossThreadFuture<T>, CrossThreadFuture<S>)>
    where
        F: FnOnce(TaskStatus<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        S: Send + 'static,
        T: Send + 'static,
    {
        self.check_running()?;
        let ready = CrossThreadFuture::new();
        let future = CrossThreadFuture::new();

        let readiness = ready.clone();
        future.on_done(move |status| {
            if readiness.is_done() {
                return;
            }
            if let Some(exit) = TaskExit::from_status(status) {
                readiness.resolve_error(BridgeError::NotStarted { exit });
            }
        });

        let task = make(TaskStatus {
            ready: ready.clone(),
        });
        self.spawn_work(Work::awaitable(task), name, future.clone());
        Ok((future, ready))
    }

    /// Start a task and block until it reports readiness.
    ///
    /// Returns the task's completion future and the value it passed to
    /// [`TaskStatus::started`].
    pub fn start_task<S, T, F, Fut>(
        &self,
        make: F,
        name: Option<&str>,
    ) -> Result<(CrossThreadFuture<T>, S)>
    where
        F: FnOnce(TaskStatus<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        S: Send + 'static,
        T: Send + 'static,
    {
        let (future, ready) = self.start_task_with_status(make, name)?;
        let value = ready.result()?;
        Ok((future, value))
    }

    /// Drive an async context on the loop from synchronous code.
    ///
    /// The returned guard enters the context on [`BlockingContext::enter`]
    /// and exits it on [`BlockingContext::exit`] or on drop.
    #[must_use]
    pub fn wrap_async_context_manager<C: AsyncContext>(&self, context: C) -> BlockingContext<C> {
        BlockingContext::new(self.clone(), context)
    }
}
