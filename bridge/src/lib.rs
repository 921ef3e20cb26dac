//! Bridge between OS threads and a single-threaded event loop.
//!
//! Two directions are covered:
//!
//! - **Into the loop.** A [`Portal`] lets any thread submit work to a running
//!   loop and block for the result ([`Portal::call`], [`Portal::call_sync`]),
//!   fire-and-forget it ([`Portal::start_task_soon`]), or wait until a task
//!   reports readiness ([`Portal::start_task`]). [`start_portal`] hosts the
//!   loop on a dedicated thread.
//! - **Out of the loop.** [`run_blocking`] offloads a blocking call to a
//!   worker thread, admitted by a [`CapacityLimiter`]. From inside that worker,
//!   [`run_in_loop`] and [`run_sync_in_loop`] call back into the same loop.
//!
//! Results travel through a [`CrossThreadFuture`] in both directions, and
//! cancellation is reconciled between the future and the loop-side
//! [`CancelScope`] so that cancelling either one cancels the other.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // panics are resumed from user code, not raised here

mod backend;
mod bootstrap;
mod context;
mod event;
mod from_thread;
mod future;
mod group;
mod limiter;
mod portal;
mod scope;
mod to_thread;
mod work;

pub use backend::{Backend, TokioBackend};
pub use bootstrap::{PortalThread, start_portal, with_portal};
pub use context::{AsyncContext, BlockingContext};
pub use event::Event;
pub use from_thread::{in_worker_thread, run_in_loop, run_sync_in_loop};
pub use future::CrossThreadFuture;
pub use limiter::{CapacityLimiter, LimiterPermit, default_thread_limiter};
pub use portal::{Portal, TaskStatus};
pub use scope::{CancelScope, ShieldGuard};
pub use to_thread::{BlockingOptions, run_blocking};
pub use work::Work;

pub use tether_types::{BridgeError, FutureStatus, Result, TaskExit};
