//! Event loop backends a portal thread can host.

use std::fmt;
use std::io;
use std::num::NonZeroUsize;

use futures_util::future::BoxFuture;
use tokio::runtime::{Builder, Runtime};

use tether_config::{BackendOptions, TetherConfig};
use tether_types::{BridgeError, DEFAULT_THREAD_TOKENS, Result};

use crate::limiter::{CapacityLimiter, LoopLimiterGuard};

/// Runs a main future to completion on a fresh event loop owned by the
/// calling thread.
pub trait Backend: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &str;

    /// Name for the OS thread that hosts the loop.
    fn thread_name(&self) -> &str {
        "tether-portal"
    }

    fn run(&self, main: BoxFuture<'static, ()>) -> Result<()>;
}

/// Single-threaded tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioBackend {
    options: BackendOptions,
    default_tokens: usize,
}

impl Default for TokioBackend {
    fn default() -> Self {
        Self::new(BackendOptions::default())
    }
}

impl TokioBackend {
    #[must_use]
    pub fn new(options: BackendOptions) -> Self {
        Self {
            options,
            default_tokens: DEFAULT_THREAD_TOKENS,
        }
    }

    #[must_use]
    pub fn from_config(config: &TetherConfig) -> Self {
        Self::new(config.backend.clone()).with_default_tokens(config.limiter.default_tokens)
    }

    /// Size of the default limiter installed for this loop.
    #[must_use]
    pub fn with_default_tokens(mut self, tokens: usize) -> Self {
        self.default_tokens = tokens;
        self
    }

    #[must_use]
    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    fn build_runtime(&self) -> io::Result<Runtime> {
        let mut builder = Builder::new_current_thread();
        if self.options.enable_time {
            builder.enable_time();
        }
        if self.options.enable_io {
            builder.enable_io();
        }
        if let Some(interval) = self.options.event_interval {
            builder.event_interval(interval);
        }
        builder.build()
    }
}

impl Backend for TokioBackend {
    fn name(&self) -> &str {
        "tokio-current-thread"
    }

    fn thread_name(&self) -> &str {
        &self.options.thread_name
    }

    fn run(&self, main: BoxFuture<'static, ()>) -> Result<()> {
        let tokens =
            NonZeroUsize::new(self.default_tokens).ok_or(BridgeError::InvalidTokens(0))?;
        let runtime = self.build_runtime().map_err(BridgeError::Startup)?;
        let _limiter = LoopLimiterGuard::install(CapacityLimiter::with_tokens(tokens));
        tracing::debug!(backend = self.name(), tokens = tokens.get(), "Event loop starting");
        runtime.block_on(main);
        // Dropping the runtime waits for worker threads still running.
        drop(runtime);
        tracing::debug!(backend = self.name(), "Event loop finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::default_thread_limiter;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_main_to_completion() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        TokioBackend::default()
            .run(Box::pin(async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn installs_configured_default_limiter() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        TokioBackend::default()
            .with_default_tokens(3)
            .run(Box::pin(async move {
                if let Ok(limiter) = default_thread_limiter() {
                    sink.store(limiter.total_tokens(), Ordering::SeqCst);
                }
            }))
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_tokens_fail_before_running() {
        let err = TokioBackend::default()
            .with_default_tokens(0)
            .run(Box::pin(async {}))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTokens(0)));
    }

    #[test]
    fn from_config_carries_options() {
        let mut config = TetherConfig::default();
        config.backend.thread_name = "custom-loop".to_string();
        config.limiter.default_tokens = 5;
        let backend = TokioBackend::from_config(&config);
        assert_eq!(backend.thread_name(), "custom-loop");
        assert_eq!(backend.default_tokens, 5);
    }
}
