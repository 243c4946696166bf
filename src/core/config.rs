//! Process-wide detection settings
//!
//! Settings are read when a scope is entered or a wait starts, so changing
//! them never affects scopes and waits that are already in flight.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How aggressively blocking waits are checked
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DetectionMode {
    /// No detection at all. Scopes are inert and waits are plain waits.
    Disabled,
    /// Only report when a real single-threaded confinement would be violated
    #[default]
    OnlyActualDeadlocks,
    /// Also report waits that would deadlock under a single-threaded
    /// confinement, and warn about waits that block for too long
    AlsoPotentialDeadlocks,
}

impl DetectionMode {
    /// Whether this mode does anything at all
    pub fn is_enabled(self) -> bool {
        self != DetectionMode::Disabled
    }
}

/// Default delay before a long blocking wait is reported
pub const DEFAULT_BLOCKING_WARNING_DURATION: Duration = Duration::from_secs(10);

/// Snapshot of the global settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Mode used by scopes entered without an explicit mode
    pub default_mode: DetectionMode,
    /// Capture a backtrace every time a blocking wait begins
    pub generate_traces: bool,
    /// How long a wait may block before the watchdog warns
    pub blocking_warning_duration: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_mode: DetectionMode::default(),
            generate_traces: false,
            blocking_warning_duration: DEFAULT_BLOCKING_WARNING_DURATION,
        }
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_CONFIG: RwLock<Config> = RwLock::new(Config::default());
}

/// Current value of every setting
pub fn snapshot() -> Config {
    *GLOBAL_CONFIG.read()
}

/// Replace every setting at once
pub fn apply(config: Config) {
    *GLOBAL_CONFIG.write() = config;
}

pub fn default_mode() -> DetectionMode {
    GLOBAL_CONFIG.read().default_mode
}

pub fn set_default_mode(mode: DetectionMode) {
    GLOBAL_CONFIG.write().default_mode = mode;
}

pub fn generate_traces() -> bool {
    GLOBAL_CONFIG.read().generate_traces
}

pub fn set_generate_traces(enabled: bool) {
    GLOBAL_CONFIG.write().generate_traces = enabled;
}

pub fn blocking_warning_duration() -> Duration {
    GLOBAL_CONFIG.read().blocking_warning_duration
}

pub fn set_blocking_warning_duration(duration: Duration) {
    GLOBAL_CONFIG.write().blocking_warning_duration = duration;
}
