//! Runtime configuration.
//!
//! A [`RuntimeConfig`] can be built in code, read from `STRAND_*`
//! environment variables, or parsed from a TOML document:
//!
//! ```toml
//! workers = 4
//! thread_name = "edge-worker"
//! stack_size = 4194304
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Environment variable holding the worker count.
pub const ENV_WORKERS: &str = "STRAND_WORKERS";
/// Environment variable holding the worker thread name prefix.
pub const ENV_THREAD_NAME: &str = "STRAND_THREAD_NAME";
/// Environment variable holding the worker stack size in bytes.
pub const ENV_STACK_SIZE: &str = "STRAND_STACK_SIZE";

/// Smallest stack a worker thread may be given.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Configuration for the worker pool behind a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub workers: usize,
    /// Worker thread name prefix
    pub thread_name: String,
    /// Stack size for worker threads (bytes)
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0, // Auto-detect
            thread_name: "strand-worker".to_string(),
            stack_size: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    ///
    /// Use 0 for auto-detection (number of CPU cores).
    #[inline]
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Set the worker thread name prefix.
    #[inline]
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// Set the worker thread stack size.
    #[inline]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Get the effective number of workers.
    ///
    /// Returns `workers` if set, otherwise the available parallelism.
    #[inline]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Check the configuration for values the worker pool cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.thread_name.trim().is_empty() {
            return Err(Error::Config("thread_name must not be empty".into()));
        }
        if let Some(size) = self.stack_size
            && size < MIN_STACK_SIZE
        {
            return Err(Error::Config(format!(
                "stack_size {} is below the minimum of {} bytes",
                size, MIN_STACK_SIZE
            )));
        }
        Ok(())
    }

    /// Load configuration from `STRAND_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Same keys as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_WORKERS) {
            config.workers = parse_number(ENV_WORKERS, &value)?;
        }
        if let Some(value) = lookup(ENV_THREAD_NAME) {
            config.thread_name = value;
        }
        if let Some(value) = lookup(ENV_STACK_SIZE) {
            config.stack_size = Some(parse_number(ENV_STACK_SIZE, &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got {:?}", key, value)))
}
