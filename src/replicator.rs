//! Cross-window replication of the session table.
//!
//! Each window owns one [`Replicator`]. It wraps the window's
//! [`SessionStore`]: every successful mutation is persisted and then
//! announced to sibling windows as a full-table `state-changed` snapshot.
//! Receivers replace their table wholesale (last applied wins) while keeping
//! their window-local focus pointer.

use crate::error::SessionError;
use crate::model::{now_unix_millis, SessionId, SessionPatch, SessionTable, WindowId, TABLE_VERSION};
use crate::model::Session;
use crate::store::{SessionStore, TableFile, Violation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Message type tag of a snapshot broadcast.
pub const STATE_CHANGED: &str = "state-changed";

/// Snapshot broadcast between sibling windows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateChanged {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: WindowId,
    pub state: SessionTable,
    /// Unix milliseconds when the sender committed the snapshot.
    pub at: u64,
    #[serde(default = "current_version")]
    pub version: u32,
    /// Tab the sender had focused; receivers apply it only if they own it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<SessionId>,
}

fn current_version() -> u32 {
    TABLE_VERSION
}

/// Best-effort delivery of serialized snapshots to sibling windows.
pub trait BroadcastChannel: Send {
    fn publish(&self, payload: String) -> Result<(), SessionError>;
}

/// In-process bus connecting windows of one application instance.
///
/// Every subscriber, including the publishing window, sees every message.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<String>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl BroadcastChannel for LocalBus {
    fn publish(&self, payload: String) -> Result<(), SessionError> {
        // No subscribers is not a failure: nobody else is listening yet.
        let _ = self.sender.send(payload);
        Ok(())
    }
}

/// What happened to one received broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Our own broadcast echoed back.
    OwnEcho,
    /// Table replaced; carries any violations that were normalized away.
    Applied { from: WindowId, repaired: Vec<Violation> },
}

/// Window-side write path: store + persistence + broadcast.
pub struct Replicator {
    window_id: WindowId,
    store: SessionStore,
    file: Option<TableFile>,
    channel: Box<dyn BroadcastChannel>,
    focus: Option<SessionId>,
    revision: u64,
}

impl Replicator {
    pub fn new(
        window_id: impl Into<WindowId>,
        store: SessionStore,
        file: Option<TableFile>,
        channel: Box<dyn BroadcastChannel>,
    ) -> Self {
        Self {
            window_id: window_id.into(),
            store,
            file,
            channel,
            focus: None,
            revision: 0,
        }
    }

    /// Build a replicator whose store starts from the persisted table.
    pub fn load(
        window_id: impl Into<WindowId>,
        mut store: SessionStore,
        file: TableFile,
        channel: Box<dyn BroadcastChannel>,
    ) -> Result<Self, SessionError> {
        let table = file.load()?;
        let repaired = store.replace_table(table)?;
        if !repaired.is_empty() {
            warn!(repaired = repaired.len(), path = %file.path().display(), "repaired persisted session table");
        }
        Ok(Self::new(window_id, store, Some(file), channel))
    }

    pub fn window_id(&self) -> &str {
        &self.window_id
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Bumped on every local commit and every applied broadcast.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn focus(&self) -> Option<&str> {
        self.focus.as_deref()
    }

    /// Move the window-local focus pointer. Only visible tabs can be focused.
    pub fn set_focus(&mut self, id: &str) -> Result<(), SessionError> {
        let visible = self
            .store
            .get(id)
            .is_some_and(|session| session.is_visible_in(&self.window_id));
        if !visible {
            return Err(SessionError::NotFound(id.to_string()));
        }
        self.focus = Some(id.to_string());
        Ok(())
    }

    /// Run several store operations as one change: either all of them land
    /// and a single snapshot goes out, or none of them do.
    pub fn batch<T, F>(&mut self, op: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut SessionStore) -> Result<T, SessionError>,
    {
        let before = self.store.clone();
        match op(&mut self.store) {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(e) => {
                self.store = before;
                Err(e)
            }
        }
    }

    pub fn add_session(&mut self, session: Session) -> Result<(), SessionError> {
        self.batch(|store| store.add_session(session))
    }

    pub fn add_split(&mut self, container: Session, panes: [Session; 2]) -> Result<(), SessionError> {
        self.batch(|store| store.add_split(container, panes))
    }

    pub fn update_session(&mut self, id: &str, patch: SessionPatch) -> Result<Vec<SessionId>, SessionError> {
        self.batch(|store| store.update_session(id, patch))
    }

    pub fn remove_session(&mut self, id: &str) -> Result<Vec<Session>, SessionError> {
        self.batch(|store| store.remove_session(id))
    }

    /// Persist and announce the current table.
    fn commit(&mut self) {
        self.revision += 1;
        self.repair_focus(None);
        if let Some(file) = &self.file {
            if let Err(e) = file.save(self.store.table()) {
                warn!(error = %e, "failed to persist session table");
            }
        }
        let message = StateChanged {
            kind: STATE_CHANGED.to_string(),
            from: self.window_id.clone(),
            state: self.store.table().clone(),
            at: now_unix_millis(),
            version: TABLE_VERSION,
            focus: self.focus.clone(),
        };
        match serde_json::to_string(&message) {
            Ok(payload) => {
                if let Err(e) = self.channel.publish(payload) {
                    warn!(error = %e, "failed to broadcast session table");
                } else {
                    debug!(window = %self.window_id, sessions = self.store.len(), "broadcast state-changed");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize session table"),
        }
    }

    /// Apply one raw broadcast from the bus.
    ///
    /// Malformed payloads are rejected with `MalformedBroadcast` and leave the
    /// local table untouched.
    pub fn receive(&mut self, raw: &str) -> Result<Received, SessionError> {
        let message = match parse_broadcast(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(window = %self.window_id, error = %e, "dropping malformed broadcast");
                return Err(e);
            }
        };
        if message.from == self.window_id {
            return Ok(Received::OwnEcho);
        }
        let repaired = match self.store.replace_table(message.state) {
            Ok(repaired) => repaired,
            Err(e) => {
                error!(window = %self.window_id, from = %message.from, error = %e, "dropping broadcast that breaks the session table");
                return Err(SessionError::MalformedBroadcast(e.to_string()));
            }
        };
        if !repaired.is_empty() {
            warn!(from = %message.from, repaired = repaired.len(), "normalized received session table");
        }
        self.revision += 1;
        self.repair_focus(message.focus.as_deref());
        info!(
            window = %self.window_id,
            from = %message.from,
            sessions = self.store.len(),
            "applied state-changed"
        );
        Ok(Received::Applied {
            from: message.from,
            repaired,
        })
    }

    /// Keep focus on something this window can show.
    ///
    /// A hint wins only when it names a tab this window owns. Otherwise the
    /// current focus stays while still visible, else the first owned tab.
    fn repair_focus(&mut self, hint: Option<&str>) {
        let window = self.window_id.as_str();
        if let Some(hint) = hint {
            let owned = self
                .store
                .get(hint)
                .is_some_and(|session| session.owner_window_id.as_deref() == Some(window) && !session.is_hidden_pane);
            if owned {
                self.focus = Some(hint.to_string());
                return;
            }
        }
        let still_visible = self
            .focus
            .as_deref()
            .and_then(|id| self.store.get(id))
            .is_some_and(|session| session.is_visible_in(window));
        if still_visible {
            return;
        }
        self.focus = self
            .store
            .list_visible(window)
            .into_iter()
            .find(|session| session.owner_window_id.as_deref() == Some(window))
            .map(|session| session.id.clone());
    }
}

/// Decode and shape-check a broadcast.
pub fn parse_broadcast(raw: &str) -> Result<StateChanged, SessionError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| SessionError::MalformedBroadcast(e.to_string()))?;
    let kind = value.get("type").and_then(Value::as_str);
    if kind != Some(STATE_CHANGED) {
        return Err(SessionError::MalformedBroadcast(format!(
            "unexpected message type {kind:?}"
        )));
    }
    if value.get("from").and_then(Value::as_str).is_none() {
        return Err(SessionError::MalformedBroadcast("missing sender window id".into()));
    }
    if !value.get("state").is_some_and(Value::is_object) {
        return Err(SessionError::MalformedBroadcast("missing or non-table state".into()));
    }
    let version = value.get("version").and_then(Value::as_u64).unwrap_or(1);
    if version > u64::from(TABLE_VERSION) {
        return Err(SessionError::MalformedBroadcast(format!(
            "unsupported snapshot version {version}"
        )));
    }
    serde_json::from_value(value).map_err(|e| SessionError::MalformedBroadcast(e.to_string()))
}
