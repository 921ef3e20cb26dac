//! Error taxonomy for the bridge.
//!
//! Usage errors (wrong thread, stopped portal) are reported immediately and
//! never retried. Application errors raised by user callables travel back to
//! the waiting side exactly once, wrapped in [`BridgeError::Failed`] with the
//! original error intact for downcasting. Cancellation is its own outcome.
//! Panics are not values: they keep unwinding across every boundary, and a
//! waiter whose producer panicked only ever sees [`BridgeError::Panicked`].

use std::any::Any;
use std::io;

use thiserror::Error;

use crate::status::TaskExit;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("this portal is not running")]
    NotRunning,
    #[error("this method cannot be called from the event loop thread")]
    CalledFromLoopThread,
    #[error("this function can only be run from a tether worker thread")]
    NotInWorkerThread,
    #[error("no event loop is running on this thread")]
    NoEventLoop,
    #[error("portals must be bound to a current-thread event loop")]
    UnsupportedRuntime,
    #[error("total tokens must be at least 1, got {0}")]
    InvalidTokens(usize),
    #[error("task exited without calling TaskStatus::started() ({exit})")]
    NotStarted { exit: TaskExit },
    #[error("operation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("capacity limiter is closed")]
    LimiterClosed,
    #[error("result was already taken by another observer")]
    ResultConsumed,
    #[error("failed to start event loop: {0}")]
    Startup(#[source] io::Error),
    #[error("event loop thread exited before the portal became available")]
    LoopExited,
    #[error("context manager cannot {0} in its current state")]
    ContextMisuse(&'static str),
}

impl BridgeError {
    /// Convert an application error, unwrapping a `BridgeError` that was
    /// propagated through it with `?` instead of nesting it.
    #[must_use]
    pub fn flatten(err: anyhow::Error) -> Self {
        err.downcast::<BridgeError>().unwrap_or_else(Self::Failed)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors caused by calling an API from the wrong place or at the wrong time.
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::NotRunning
                | Self::CalledFromLoopThread
                | Self::NotInWorkerThread
                | Self::NoEventLoop
                | Self::UnsupportedRuntime
                | Self::InvalidTokens(_)
                | Self::ContextMisuse(_)
        )
    }

    /// The application error raised by a user callable, if this is one.
    #[must_use]
    pub fn failure(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Downcast the application error back to its original type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.failure().and_then(|err| err.downcast_ref::<E>())
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn failed_preserves_original_type() {
        let err = BridgeError::from(anyhow::Error::new(DiskError));
        assert!(err.downcast_ref::<DiskError>().is_some());
        assert_eq!(err.to_string(), "disk on fire");
        assert!(!err.is_usage());
    }

    #[test]
    fn usage_errors_are_classified() {
        assert!(BridgeError::NotRunning.is_usage());
        assert!(BridgeError::CalledFromLoopThread.is_usage());
        assert!(BridgeError::NotInWorkerThread.is_usage());
        assert!(!BridgeError::Cancelled.is_usage());
        assert!(BridgeError::Cancelled.is_cancelled());
    }

    #[test]
    fn flatten_unwraps_propagated_bridge_error() {
        let err = BridgeError::flatten(anyhow::Error::new(BridgeError::Cancelled));
        assert!(err.is_cancelled());

        let err = BridgeError::flatten(anyhow::Error::new(DiskError));
        assert!(err.downcast_ref::<DiskError>().is_some());
    }

    #[test]
    fn not_started_mentions_exit() {
        let err = BridgeError::NotStarted {
            exit: TaskExit::Returned,
        };
        assert!(err.to_string().contains("task returned"));
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
