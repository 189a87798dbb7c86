//! Engine Configuration
//!
//! The engine has a single process-wide knob: the debug trace. When it is on,
//! the scheduler renders a description of every vertex it touches (kind, name,
//! rank, visited flag, memo state) into its `tracing` events. It is purely
//! observational and never changes what the engine computes.

use parking_lot::{const_rwlock, RwLock};
use serde::{Deserialize, Serialize};

/// Environment variable consulted by [`EngineConfig::from_env`].
pub const DEBUG_TRACE_ENV: &str = "STRAND_DEBUG_TRACE";

static GLOBAL: RwLock<EngineConfig> = const_rwlock(EngineConfig::DEFAULT);

/// Process-wide engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Log root sets, traversal order and action firing with full vertex
    /// descriptions.
    pub debug_trace: bool,
}

impl EngineConfig {
    const DEFAULT: Self = Self { debug_trace: false };

    /// Read the configuration from the environment.
    ///
    /// `STRAND_DEBUG_TRACE` accepts `1`, `true`, `yes` or `on` (any case).
    pub fn from_env() -> Self {
        let debug_trace = std::env::var(DEBUG_TRACE_ENV)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Self { debug_trace }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The currently installed configuration.
    pub fn global() -> Self {
        *GLOBAL.read()
    }

    /// Replace the process-wide configuration.
    pub fn install(self) {
        *GLOBAL.write() = self;
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Toggle the debug trace.
pub fn enable_debug(flag: bool) {
    GLOBAL.write().debug_trace = flag;
}

/// Whether the debug trace is on.
pub(crate) fn debug_enabled() -> bool {
    GLOBAL.read().debug_trace
}
