//! Core types for tether.
//!
//! This crate holds the pieces every other tether crate agrees on: the error
//! taxonomy that crosses the thread boundary and the status enums observers
//! read from a cross-thread future. No IO, no async.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
mod status;

pub use error::{BridgeError, Result, panic_message};
pub use status::{FutureStatus, TaskExit};

/// Number of worker threads a context's default limiter admits at once.
pub const DEFAULT_THREAD_TOKENS: usize = 40;
