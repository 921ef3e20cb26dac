//! Observable states of a cross-thread future and of a finished task.

use std::fmt;

/// State of a cross-thread future as seen by an observer.
///
/// `Cancelled`, `Succeeded` and `Failed` are terminal: once reached, the
/// future never changes state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureStatus {
    /// Created, nobody has picked it up yet.
    Pending,
    /// The producing side acknowledged it and is working on it.
    Running,
    Cancelled,
    /// Resolved with a value.
    Succeeded,
    /// Resolved with an error.
    Failed,
}

impl FutureStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Succeeded | Self::Failed)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FutureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a task ended, recorded when it never reported readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskExit {
    Returned,
    Failed,
    Cancelled,
}

impl TaskExit {
    /// Map a terminal future status to the way the task ended.
    ///
    /// Returns `None` for non-terminal statuses.
    #[must_use]
    pub const fn from_status(status: FutureStatus) -> Option<Self> {
        match status {
            FutureStatus::Succeeded => Some(Self::Returned),
            FutureStatus::Failed => Some(Self::Failed),
            FutureStatus::Cancelled => Some(Self::Cancelled),
            FutureStatus::Pending | FutureStatus::Running => None,
        }
    }
}

impl fmt::Display for TaskExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned => f.write_str("task returned"),
            Self::Failed => f.write_str("task failed"),
            Self::Cancelled => f.write_str("task was cancelled"),
        }
    }
}
