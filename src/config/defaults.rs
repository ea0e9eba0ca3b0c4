//! Default configuration constants.

/// Embedded default `tabmux.toml` template written by `tabmux init`.
pub(super) const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../templates/tabmux.toml");
pub(super) const DEFAULT_LISTEN: &str = "127.0.0.1:7681";
/// Bounded handoff buffer per multiplexer session.
pub(super) const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 256 * 1024;
pub(super) const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
pub(super) const DEFAULT_PROGRAM: &str = "tmux";
pub(super) const DEFAULT_SESSION_PREFIX: &str = "tabmux";
pub(super) const DEFAULT_ACK_TIMEOUT_SECS: u64 = 15;
/// Directory and file name used under the user config root.
pub(super) const CONFIG_DIR: &str = "tabmux";
pub(super) const CONFIG_FILE: &str = "tabmux.toml";
