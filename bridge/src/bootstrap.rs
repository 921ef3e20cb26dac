//! Hosting a portal on a dedicated thread.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tether_types::{BridgeError, Result};

use crate::backend::Backend;
use crate::future::{CrossThreadFuture, ResolveOnDrop};
use crate::portal::Portal;

const GRACE_POLL: Duration = Duration::from_millis(5);

/// A portal whose loop runs on a thread owned by this handle.
///
/// Dropping the handle stops the portal and joins the thread. Outstanding
/// tasks are awaited, unless the drop happens while panicking, in which case
/// they are cancelled first.
pub struct PortalThread {
    portal: Portal,
    thread: Option<JoinHandle<Result<()>>>,
}

impl fmt::Debug for PortalThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalThread")
            .field("portal", &self.portal)
            .field("joined", &self.thread.is_none())
            .finish()
    }
}

/// Start an event loop on a new thread and return a portal into it.
///
/// Blocks until the portal is ready. If the loop thread fails before that,
/// its own error (or panic) is surfaced here.
pub fn start_portal(backend: Arc<dyn Backend>) -> Result<PortalThread> {
    let available: CrossThreadFuture<Portal> = CrossThreadFuture::new();
    let handoff = available.clone();
    let loop_backend = Arc::clone(&backend);

    let thread = thread::Builder::new()
        .name(backend.thread_name().to_string())
        .spawn(move || {
            // Resolves the launcher even if the loop never gets to publish.
            let _exit_guard = ResolveOnDrop::with_error(handoff.clone(), BridgeError::LoopExited);
            let main = Box::pin(async move {
                let publish = handoff.clone();
                let hosted = Portal::run(move |portal| async move {
                    if publish.set_running() {
                        publish.resolve(portal.clone());
                        portal.sleep_until_stopped().await;
                    }
                    Ok::<(), BridgeError>(())
                })
                .await;
                if let Err(err) = hosted {
                    handoff.resolve_error(err);
                }
            });
            loop_backend.run(main)
        })
        .map_err(BridgeError::Startup)?;

    match available.result() {
        Ok(portal) => {
            tracing::info!(backend = backend.name(), "Portal thread started");
            Ok(PortalThread {
                portal,
                thread: Some(thread),
            })
        }
        Err(err) => match thread.join() {
            Ok(Err(startup)) => Err(startup),
            Ok(Ok(())) => Err(err),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Run `body` with a portal hosted on its own thread.
///
/// On success the portal waits for outstanding tasks before returning. On
/// error they are cancelled and the body's error is returned.
pub fn with_portal<R, F>(backend: Arc<dyn Backend>, body: F) -> Result<R>
where
    F: FnOnce(&Portal) -> anyhow::Result<R>,
{
    let mut hosted = start_portal(backend)?;
    match body(hosted.portal()) {
        Ok(value) => {
            hosted.shutdown(false)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(close_err) = hosted.shutdown(true) {
                tracing::warn!("Portal thread failed while unwinding body error: {close_err}");
            }
            Err(BridgeError::flatten(err))
        }
    }
}

impl PortalThread {
    #[must_use]
    pub fn portal(&self) -> &Portal {
        &self.portal
    }

    /// Stop the portal, let outstanding tasks finish, and join the thread.
    pub fn close(mut self) -> Result<()> {
        self.shutdown(false)
    }

    /// Stop the portal, cancel outstanding tasks, and join the thread.
    pub fn abort(mut self) -> Result<()> {
        self.shutdown(true)
    }

    /// Close gracefully, cancelling whatever is still running after `grace`.
    pub fn close_within(mut self, grace: Duration) -> Result<()> {
        self.portal.stop(false);
        let deadline = Instant::now() + grace;
        while self.thread.as_ref().is_some_and(|thread| !thread.is_finished()) {
            if Instant::now() >= deadline {
                tracing::warn!(
                    live_tasks = self.portal.live_tasks(),
                    "Shutdown grace expired, cancelling remaining tasks"
                );
                self.portal.stop(true);
                break;
            }
            thread::sleep(GRACE_POLL);
        }
        self.join()
    }

    fn shutdown(&mut self, cancel_remaining: bool) -> Result<()> {
        self.portal.stop(cancel_remaining);
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

impl Drop for PortalThread {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let panicking = thread::panicking();
        self.portal.stop(panicking);
        match thread.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("Portal thread exited with error: {err}"),
            Err(payload) if !panicking => std::panic::resume_unwind(payload),
            Err(_) => tracing::error!("Portal thread panicked while already unwinding"),
        }
    }
}
