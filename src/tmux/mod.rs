//! Multiplexer control adapter.
//!
//! The gateway talks to the external multiplexer only through the
//! [`Multiplexer`] trait. [`TmuxControl`] shells out to the tmux CLI for
//! one-shot commands and keeps a control-mode client per attachment.

pub mod attach;
pub(crate) mod command;
pub mod control;
pub mod naming;

pub use attach::{AttachEvent, AttachInput, Attachment};
pub use control::TmuxControl;

use crate::error::MuxError;
use crate::protocol::GridSize;
use async_trait::async_trait;

/// Session option marking multiplexer sessions created by tabmux.
pub const MANAGED_OPTION: &str = "@tabmux_managed";

/// Pane flags reported by `queryPaneState`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaneState {
    pub marked: bool,
    pub zoomed: bool,
    pub window_count: u32,
}

/// Control surface of the external terminal multiplexer.
///
/// `kill` is the only destructive call. Dropping an [`Attachment`] releases
/// the client without touching the session.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Create a detached session named `name`, returning the name.
    async fn create(
        &self,
        name: &str,
        command: Option<&str>,
        working_dir: Option<&str>,
    ) -> Result<String, MuxError>;

    async fn attach_exists(&self, name: &str) -> Result<bool, MuxError>;

    /// Every live session name. An absent server means no sessions.
    async fn list_sessions(&self) -> Result<Vec<String>, MuxError>;

    /// Opaque pass-through of one control command targeted at `name`.
    async fn send_command(&self, name: &str, control: &str) -> Result<String, MuxError>;

    async fn kill(&self, name: &str) -> Result<(), MuxError>;

    async fn query_pane_state(&self, name: &str) -> Result<PaneState, MuxError>;

    /// Start streaming I/O for `name`, optionally sizing the client first.
    async fn attach(&self, name: &str, size: Option<GridSize>) -> Result<Attachment, MuxError>;
}
