//! Configuration loading and parsing for tether.
//!
//! Every field has a default, so a missing file or an empty table is valid.
//!
//! ```toml
//! [backend]
//! enable_time = true
//! enable_io = true
//! event_interval = 61
//! thread_name = "tether-${USER}"
//!
//! [limiter]
//! default_tokens = 40
//!
//! [portal]
//! shutdown_grace_ms = 2000
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use tether_types::DEFAULT_THREAD_TOKENS;

/// Environment variable overriding `limiter.default_tokens`.
pub const THREAD_TOKENS_ENV: &str = "TETHER_THREAD_TOKENS";

const DEFAULT_THREAD_NAME: &str = "tether-portal";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TetherConfig {
    pub backend: BackendOptions,
    pub limiter: LimiterConfig,
    pub portal: PortalConfig,
}

/// Options for the event loop a portal thread hosts.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendOptions {
    /// Enable the timer driver (`tokio::time`).
    pub enable_time: bool,
    /// Enable the IO driver (sockets, pipes).
    pub enable_io: bool,
    /// Scheduler ticks between polls of external events. `None` keeps the runtime default.
    pub event_interval: Option<u32>,
    /// Name given to the OS thread hosting the loop. `${VAR}` references are expanded.
    pub thread_name: String,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            enable_time: true,
            enable_io: true,
            event_interval: None,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Worker threads the default limiter of each loop admits concurrently.
    pub default_tokens: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_tokens: DEFAULT_THREAD_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortalConfig {
    /// How long a graceful close waits for in-flight tasks before forcing
    /// cancellation. `None` waits indefinitely.
    pub shutdown_grace_ms: Option<u64>,
}

impl PortalConfig {
    #[must_use]
    pub fn shutdown_grace(&self) -> Option<Duration> {
        self.shutdown_grace_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("limiter.default_tokens must be at least 1")]
    ZeroTokens,
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::ZeroTokens => None,
        }
    }
}

impl TetherConfig {
    /// Load `~/.tether/config.toml`, falling back to defaults when it does not exist.
    ///
    /// Environment overrides are applied on top of whatever was loaded.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path() {
            Some(path) => Self::load_from(&path)?.unwrap_or_default(),
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a config file. Returns `Ok(None)` if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {}: {err}", path.display());
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => {
                config.validate()?;
                Ok(Some(config))
            }
            Err(err) => {
                tracing::warn!("Failed to parse config at {}: {err}", path.display());
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Parse config text and expand `${VAR}` references in string fields.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.backend.thread_name = expand_env_vars(&config.backend.thread_name);
        Ok(config)
    }

    /// Apply `TETHER_THREAD_TOKENS` if it is set to a positive integer.
    pub fn apply_env_overrides(&mut self) {
        let Ok(raw) = env::var(THREAD_TOKENS_ENV) else {
            return;
        };
        match raw.trim().parse::<usize>() {
            Ok(tokens) if tokens > 0 => self.limiter.default_tokens = tokens,
            _ => {
                tracing::warn!("Ignoring {THREAD_TOKENS_ENV}={raw:?}: expected a positive integer");
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limiter.default_tokens == 0 {
            return Err(ConfigError::ZeroTokens);
        }
        Ok(())
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}

/// Replace `${VAR}` with the value of `VAR` (empty when unset).
///
/// An unclosed `${` is kept verbatim.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = TetherConfig::from_toml_str("").unwrap();
        assert_eq!(config, TetherConfig::default());
        assert_eq!(config.limiter.default_tokens, DEFAULT_THREAD_TOKENS);
        assert!(config.backend.enable_time);
        assert!(config.backend.enable_io);
        assert_eq!(config.backend.thread_name, "tether-portal");
        assert_eq!(config.portal.shutdown_grace(), None);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = TetherConfig::from_toml_str(
            r#"
            [backend]
            enable_io = false
            event_interval = 31

            [portal]
            shutdown_grace_ms = 1500
            "#,
        )
        .unwrap();
        assert!(config.backend.enable_time);
        assert!(!config.backend.enable_io);
        assert_eq!(config.backend.event_interval, Some(31));
        assert_eq!(config.limiter.default_tokens, DEFAULT_THREAD_TOKENS);
        assert_eq!(
            config.portal.shutdown_grace(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn zero_tokens_rejected() {
        let config = TetherConfig::from_toml_str("[limiter]\ndefault_tokens = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTokens)));
    }

    #[test]
    fn load_from_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = TetherConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[limiter]\ndefault_tokens = 4").unwrap();

        let config = TetherConfig::load_from(&path).unwrap().unwrap();
        assert_eq!(config.limiter.default_tokens, 4);
    }

    #[test]
    fn load_from_reports_parse_error_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[limiter\n").unwrap();

        let err = TetherConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn thread_name_expands_env_vars() {
        unsafe {
            std::env::set_var("TETHER_TEST_LOOP_SUFFIX", "blue");
        }
        let config = TetherConfig::from_toml_str(
            "[backend]\nthread_name = \"loop-${TETHER_TEST_LOOP_SUFFIX}\"\n",
        )
        .unwrap();
        assert_eq!(config.backend.thread_name, "loop-blue");
        unsafe {
            std::env::remove_var("TETHER_TEST_LOOP_SUFFIX");
        }
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("loop ${UNCLOSED"), "loop ${UNCLOSED");
        assert_eq!(expand_env_vars("plain"), "plain");
        assert_eq!(expand_env_vars("a${}b"), "ab");
    }

    #[test]
    fn env_override_applies_positive_tokens_only() {
        let mut config = TetherConfig::default();
        unsafe {
            std::env::set_var(THREAD_TOKENS_ENV, "7");
        }
        config.apply_env_overrides();
        assert_eq!(config.limiter.default_tokens, 7);

        unsafe {
            std::env::set_var(THREAD_TOKENS_ENV, "zero");
        }
        config.apply_env_overrides();
        assert_eq!(config.limiter.default_tokens, 7);

        unsafe {
            std::env::remove_var(THREAD_TOKENS_ENV);
        }
    }
}
