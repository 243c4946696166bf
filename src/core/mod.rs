// Core types
pub mod types;
pub use types::*;

// Process-wide settings
pub mod config;
pub use config::{Config, DetectionMode};

// Deadlock signal and wait errors
pub mod error;
pub use error::{DeadlockError, Trace, WaitError};

// Logging and diagnostic delivery
pub mod dispatcher;
pub mod logger;
pub use logger::{flush_logs, init_logger};

// Confinement mechanisms and the per-thread ambient slot
pub mod ambient;
pub mod confinement;
pub use confinement::{Confinement, Continuation, LocalQueue};

// The detecting context
pub mod context;
pub use context::ConfinementContext;

pub mod scope;
pub use scope::{DetectionScope, unreleased_scopes, with_detection};

pub mod task;
pub use task::{CancellationToken, Task};

pub mod wait;
pub use wait::WaitOptions;

pub mod watchdog;

use anyhow::{Context, Result};
use std::time::Duration;

/// Blockwatch configuration struct
pub struct Blockwatch {
    config: Config,
    log_path: Option<String>,
    callback: Option<Box<dyn Fn(Diagnostic) + Send + Sync + 'static>>,
}

impl Default for Blockwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockwatch {
    /// Create a new Blockwatch with default settings
    ///
    /// By default:
    /// - Only actual deadlocks are detected
    /// - No traces are captured
    /// - Long waits are reported after 10 seconds
    /// - Logging is disabled
    /// - Diagnostics are printed to stderr
    pub fn new() -> Self {
        Blockwatch {
            config: Config::default(),
            log_path: None,
            callback: None,
        }
    }

    /// Set the mode used by scopes entered without one
    pub fn mode(mut self, mode: DetectionMode) -> Self {
        self.config.default_mode = mode;
        self
    }

    /// Capture a backtrace whenever a blocking wait begins
    pub fn generate_traces(mut self, enabled: bool) -> Self {
        self.config.generate_traces = enabled;
        self
    }

    /// How long a wait may block before it is reported as a potential deadlock
    pub fn warning_duration(mut self, duration: Duration) -> Self {
        self.config.blocking_warning_duration = duration;
        self
    }

    /// Activate logger and set the path for the log file
    ///
    /// # Arguments
    /// * `path` - Path to the log file. If the path contains "{timestamp}",
    ///   it will be replaced with the current timestamp.
    pub fn with_log<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.log_path = Some(path.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Set a callback to be invoked for every diagnostic
    ///
    /// The callback runs on a background thread, never on the blocked one.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Diagnostic) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Apply the configured settings
    ///
    /// # Errors
    /// Returns an error if logger initialization fails
    pub fn start(self) -> Result<()> {
        if let Some(log_path) = self.log_path {
            init_logger(Some(log_path)).context("Failed to initialize logger")?;
        }

        if let Some(callback) = self.callback {
            dispatcher::set_callback(callback);
        }

        config::apply(self.config);
        Ok(())
    }
}
