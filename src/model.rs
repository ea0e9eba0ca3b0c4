//! Session data model shared by every window and by the persisted table.
//!
//! Field names serialize in camelCase because the same JSON shape travels in
//! broadcasts between windows and sits in the persisted store. Every optional
//! field carries `#[serde(default)]` so older payloads keep loading, and
//! unknown fields are ignored for the same reason.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque stable tab identifier. Assigned once, never reused.
pub type SessionId = String;
/// Identifier of one UI window process.
pub type WindowId = String;

/// Current schema version for tables written by this build.
pub const TABLE_VERSION: u32 = 1;

/// A tab is either one terminal or a container of two panes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    #[default]
    Single,
    SplitContainer,
}

/// Lifecycle of a session, see the state machine in `orchestrator`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    #[default]
    Spawning,
    Active,
    Detached,
    Closed,
    Error,
}

impl LifecycleState {
    /// Short lowercase label used in logs and user notices.
    pub fn label(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Detached => "detached",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SplitOrientation {
    Vertical,
    Horizontal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PanePosition {
    Left,
    Right,
    Top,
    Bottom,
}

/// One pane slot inside a split container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SplitPane {
    pub pane_session_id: SessionId,
    /// Percentage of the container occupied by this pane.
    pub size_fraction: u32,
    pub position: PanePosition,
}

/// Two-pane layout carried only by `SplitContainer` sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SplitLayout {
    pub orientation: SplitOrientation,
    pub panes: Vec<SplitPane>,
}

impl SplitLayout {
    /// Build a 50/50 layout; positions follow the orientation.
    pub fn even(orientation: SplitOrientation, first: &str, second: &str) -> Self {
        let (a, b) = match orientation {
            SplitOrientation::Vertical => (PanePosition::Left, PanePosition::Right),
            SplitOrientation::Horizontal => (PanePosition::Top, PanePosition::Bottom),
        };
        Self {
            orientation,
            panes: vec![
                SplitPane {
                    pane_session_id: first.to_string(),
                    size_fraction: 50,
                    position: a,
                },
                SplitPane {
                    pane_session_id: second.to_string(),
                    size_fraction: 50,
                    position: b,
                },
            ],
        }
    }

    /// Check the structural rules: exactly two distinct panes summing to 100.
    pub fn validate(&self) -> Result<(), String> {
        if self.panes.len() != 2 {
            return Err(format!(
                "split layout must have exactly two panes, found {}",
                self.panes.len()
            ));
        }
        if self.panes[0].pane_session_id == self.panes[1].pane_session_id {
            return Err(format!(
                "split layout references pane {} twice",
                self.panes[0].pane_session_id
            ));
        }
        let total: u32 = self.panes.iter().map(|pane| pane.size_fraction).sum();
        if total != 100 {
            return Err(format!("split pane sizes must sum to 100, found {total}"));
        }
        Ok(())
    }

    /// Referenced pane session ids in layout order.
    pub fn pane_ids(&self) -> impl Iterator<Item = &str> {
        self.panes.iter().map(|pane| pane.pane_session_id.as_str())
    }

    pub fn references(&self, session_id: &str) -> bool {
        self.pane_ids().any(|id| id == session_id)
    }
}

/// A tab as stored in every window's table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub kind: SessionKind,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub tool_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplexer_session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_handle: Option<String>,
    /// `None` means detached: offered as a candidate in every window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_window_id: Option<WindowId>,
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_layout: Option<SplitLayout>,
    #[serde(default)]
    pub is_hidden_pane: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Unix milliseconds of the last detach, used to order detached tabs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Last user-visible failure, kept while the session is in `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Session {
    /// A fresh single-terminal tab in `spawning`.
    pub fn single(id: impl Into<String>, tool_type: impl Into<String>) -> Self {
        let tool_type = tool_type.into();
        Self {
            id: id.into(),
            kind: SessionKind::Single,
            display_name: tool_type.clone(),
            tool_type,
            multiplexer_session_name: None,
            connection_handle: None,
            owner_window_id: None,
            lifecycle_state: LifecycleState::Spawning,
            split_layout: None,
            is_hidden_pane: false,
            correlation_id: None,
            last_active_at: None,
            working_dir: None,
            command: None,
            error_message: None,
        }
    }

    /// A split container tab wrapping `layout`.
    pub fn container(id: impl Into<String>, layout: SplitLayout) -> Self {
        let mut session = Self::single(id, "split");
        session.kind = SessionKind::SplitContainer;
        session.display_name = "split".to_string();
        session.split_layout = Some(layout);
        session
    }

    pub fn with_owner(mut self, window_id: Option<&str>) -> Self {
        self.owner_window_id = window_id.map(str::to_string);
        self
    }

    pub fn with_state(mut self, state: LifecycleState) -> Self {
        self.lifecycle_state = state;
        self
    }

    pub fn with_mux_name(mut self, name: impl Into<String>) -> Self {
        self.multiplexer_session_name = Some(name.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn is_container(&self) -> bool {
        self.kind == SessionKind::SplitContainer
    }

    /// True when the session is detached and free for any window to claim.
    pub fn is_detached_candidate(&self) -> bool {
        self.owner_window_id.is_none() && self.lifecycle_state == LifecycleState::Detached
    }

    /// The `listVisible` rule for one window.
    pub fn is_visible_in(&self, window_id: &str) -> bool {
        if self.is_hidden_pane {
            return false;
        }
        self.owner_window_id.as_deref() == Some(window_id) || self.is_detached_candidate()
    }
}

/// Partial update applied by `SessionStore::update_session`.
///
/// `Option<Option<T>>` fields distinguish "leave alone" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub display_name: Option<String>,
    /// Set-once; rejected when the session already has a different name.
    pub multiplexer_session_name: Option<String>,
    pub connection_handle: Option<Option<String>>,
    pub owner_window_id: Option<Option<WindowId>>,
    pub lifecycle_state: Option<LifecycleState>,
    pub correlation_id: Option<Option<String>>,
    pub last_active_at: Option<u64>,
    pub error_message: Option<Option<String>>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn mux_name(mut self, name: impl Into<String>) -> Self {
        self.multiplexer_session_name = Some(name.into());
        self
    }

    pub fn handle(mut self, handle: Option<String>) -> Self {
        self.connection_handle = Some(handle);
        self
    }

    pub fn owner(mut self, window_id: Option<String>) -> Self {
        self.owner_window_id = Some(window_id);
        self
    }

    pub fn state(mut self, state: LifecycleState) -> Self {
        self.lifecycle_state = Some(state);
        self
    }

    pub fn correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn touched(mut self, at_millis: u64) -> Self {
        self.last_active_at = Some(at_millis);
        self
    }

    pub fn error(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copy every set field onto `session`. Invariant checks happen in the store.
    pub(crate) fn apply_to(&self, session: &mut Session) {
        if let Some(name) = &self.display_name {
            session.display_name = name.clone();
        }
        if let Some(name) = &self.multiplexer_session_name {
            session.multiplexer_session_name = Some(name.clone());
        }
        if let Some(handle) = &self.connection_handle {
            session.connection_handle = handle.clone();
        }
        if let Some(owner) = &self.owner_window_id {
            session.owner_window_id = owner.clone();
        }
        if let Some(state) = self.lifecycle_state {
            session.lifecycle_state = state;
        }
        if let Some(correlation_id) = &self.correlation_id {
            session.correlation_id = correlation_id.clone();
        }
        if let Some(at) = self.last_active_at {
            session.last_active_at = Some(at);
        }
        if let Some(message) = &self.error_message {
            session.error_message = message.clone();
        }
    }
}

/// The full session table: what gets persisted and broadcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTable {
    #[serde(default = "default_table_version")]
    pub version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, Session>,
    /// Tab order. Ids missing here are appended in id order on load.
    #[serde(default)]
    pub order: Vec<SessionId>,
}

fn default_table_version() -> u32 {
    TABLE_VERSION
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            version: TABLE_VERSION,
            sessions: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Repair `order` so it lists every session exactly once.
    pub fn normalize_order(&mut self) {
        let mut seen = std::collections::BTreeSet::new();
        self.order
            .retain(|id| self.sessions.contains_key(id) && seen.insert(id.clone()));
        for id in self.sessions.keys() {
            if !seen.contains(id) {
                self.order.push(id.clone());
            }
        }
    }

    /// Sessions in tab order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &Session> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Current Unix timestamp in milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
