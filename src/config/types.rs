//! Configuration types.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::defaults::{
    DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_LISTEN, DEFAULT_OUTPUT_BUFFER_BYTES, DEFAULT_PROGRAM,
    DEFAULT_RECONCILE_INTERVAL_SECS, DEFAULT_SESSION_PREFIX,
};
use crate::gateway::GatewaySettings;
use crate::store::TableFile;

/// Top-level runtime configuration. Missing keys take defaults; unknown keys
/// are ignored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub multiplexer: MultiplexerConfig,
    pub window: WindowSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub output_buffer_bytes: usize,
    /// `0` disables the periodic reconciliation pass.
    pub reconcile_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub program: String,
    pub session_prefix: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowSection {
    pub ack_timeout_secs: u64,
    /// Empty means the platform data directory.
    pub store_path: String,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            ack_timeout_secs: DEFAULT_ACK_TIMEOUT_SECS,
            store_path: String::new(),
        }
    }
}

impl Config {
    pub fn gateway_settings(&self) -> GatewaySettings {
        let interval = self.gateway.reconcile_interval_secs;
        GatewaySettings {
            output_buffer_bytes: self.gateway.output_buffer_bytes,
            reconcile_interval: (interval > 0).then(|| Duration::from_secs(interval)),
            session_prefix: self.multiplexer.session_prefix.clone(),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.window.ack_timeout_secs)
    }

    /// Where the shared session table lives.
    pub fn store_path(&self) -> Option<PathBuf> {
        let configured = self.window.store_path.trim();
        if configured.is_empty() {
            TableFile::default_path()
        } else {
            Some(PathBuf::from(configured))
        }
    }
}

/// Config plus the file it came from (`None` for built-in defaults).
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: Option<PathBuf>,
}

/// Outcome of `tabmux init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalConfigInitResult {
    Created { path: PathBuf },
    AlreadyInitialized { path: PathBuf },
    Overwritten { path: PathBuf, backup_path: PathBuf },
}
