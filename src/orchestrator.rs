//! Reconnection orchestrator.
//!
//! Turns user intents (spawn, reattach, detach, close) into gateway requests
//! and binds the asynchronous replies back onto the session table. Each
//! outstanding spawn/reconnect is a [`PendingOp`] keyed by its correlation id.
//! Acknowledgments are matched by correlation id first, then by multiplexer
//! session name, then by tool type. Anything that no longer matches the
//! session's current correlation id is stale and its handle is released; a
//! repeated ack for a handle that is already bound changes nothing.
//!
//! Split families move as one unit: every pane's acknowledgment is held until
//! the whole family has answered, then the family is bound in a single store
//! transaction. A failure or timeout of any pane fails the whole family.

use crate::error::SessionError;
use crate::model::{
    now_unix_millis, LifecycleState, Session, SessionId, SessionPatch, SplitLayout,
    SplitOrientation,
};
use crate::normalizer::{DimensionNormalizer, Normalized, PaneGeometry};
use crate::protocol::{
    ClientMessage, ClientPayload, CloseRequest, ErrorCode, ErrorReply, GridSize, HandleRef,
    IoChunk, LiveWindows, OwnershipRevoked, ProcessGone, ReconnectRequest, ResizeRequest,
    ServerMessage, ServerPayload, SessionList, SpawnRequest, Spawned, WindowGone, WindowHello,
};
use crate::replicator::Replicator;
use crate::tmux::naming::random_hex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a spawn or reconnect may wait for its acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);
/// Tool type given to multiplexer sessions discovered outside tabmux.
pub const EXTERNAL_TOOL_TYPE: &str = "external";
/// Superseded correlation ids remembered for stale-ack detection.
const SUPERSEDED_HISTORY: usize = 256;

/// Outbound half of the gateway connection.
pub trait GatewayLink: Send {
    fn deliver(&mut self, message: ClientMessage) -> Result<(), SessionError>;
}

impl GatewayLink for mpsc::UnboundedSender<ClientMessage> {
    fn deliver(&mut self, message: ClientMessage) -> Result<(), SessionError> {
        self.send(message)
            .map_err(|_| SessionError::Link("gateway connection closed".into()))
    }
}

/// Parameters of a fresh terminal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnOptions {
    pub tool_type: String,
    pub display_name: Option<String>,
    pub working_dir: Option<String>,
    pub command: Option<String>,
    /// Explicit multiplexer session name; generated by the gateway when absent.
    pub multiplexer_session_name: Option<String>,
    pub geometry: Option<PaneGeometry>,
}

impl SpawnOptions {
    pub fn new(tool_type: impl Into<String>) -> Self {
        Self {
            tool_type: tool_type.into(),
            ..Self::default()
        }
    }
}

/// Where one pane of a new split gets its terminal from.
#[derive(Debug, Clone, PartialEq)]
pub enum PaneSource {
    Spawn(SpawnOptions),
    /// Render an existing multiplexer session.
    Attach {
        tool_type: String,
        multiplexer_session_name: String,
        geometry: Option<PaneGeometry>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Spawn,
    Reconnect,
}

/// Progress of one pending request. Bound, failed and timed-out requests
/// leave the pending set; their outcome lives in the session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Requested,
    /// Acknowledged, waiting for the rest of the split family.
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub correlation_id: String,
    pub session_id: SessionId,
    /// Root of the split family (the session itself for single tabs).
    pub family: SessionId,
    pub kind: OpKind,
    pub tool_type: String,
    pub multiplexer_session_name: Option<String>,
    pub phase: Phase,
    pub issued_at: Instant,
    pub ack: Option<Spawned>,
}

/// Which rule paired an acknowledgment with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Correlation,
    SessionName,
    ToolType,
}

impl MatchRule {
    fn label(self) -> &'static str {
        match self {
            Self::Correlation => "correlation id",
            Self::SessionName => "session name",
            Self::ToolType => "tool type",
        }
    }
}

/// Side effects for the window to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Output {
        session_id: SessionId,
        bytes: Vec<u8>,
    },
    /// User-visible message; `session_id` names the tab it concerns.
    Notice {
        session_id: Option<SessionId>,
        message: String,
    },
    /// The pane must render at `normalized.font_size`.
    Normalized {
        session_id: SessionId,
        normalized: Normalized,
    },
    Imported {
        session_ids: Vec<SessionId>,
    },
}

fn new_session_id() -> SessionId {
    format!("tab-{}", random_hex(12))
}

pub struct Orchestrator {
    replicator: Replicator,
    link: Box<dyn GatewayLink>,
    pending: BTreeMap<String, PendingOp>,
    superseded: VecDeque<String>,
    sequence: u64,
    ack_timeout: Duration,
    normalizer: DimensionNormalizer,
    geometry: HashMap<SessionId, PaneGeometry>,
    effects: Vec<Effect>,
    /// Other owners in the table when this window announced itself.
    announced_owners: Option<BTreeSet<String>>,
}

impl Orchestrator {
    pub fn new(replicator: Replicator, link: Box<dyn GatewayLink>, ack_timeout: Duration) -> Self {
        Self {
            replicator,
            link,
            pending: BTreeMap::new(),
            superseded: VecDeque::new(),
            sequence: 0,
            ack_timeout,
            normalizer: DimensionNormalizer::new(),
            geometry: HashMap::new(),
            effects: Vec::new(),
            announced_owners: None,
        }
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    pub fn replicator_mut(&mut self) -> &mut Replicator {
        &mut self.replicator
    }

    pub fn normalizer(&self) -> &DimensionNormalizer {
        &self.normalizer
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOp> {
        self.pending.values()
    }

    /// Effects produced since the last call.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn window(&self) -> String {
        self.replicator.window_id().to_string()
    }

    fn next_correlation_id(&mut self) -> String {
        self.sequence += 1;
        format!("{}-{}-{}", self.replicator.window_id(), self.sequence, random_hex(6))
    }

    fn new_pane(&self, id: &str, correlation_id: &str, source: &PaneSource) -> Session {
        let window = self.replicator.window_id();
        let mut session = match source {
            PaneSource::Spawn(options) => {
                let mut session = Session::single(id, options.tool_type.clone());
                if let Some(name) = &options.display_name {
                    session.display_name = name.clone();
                }
                session.working_dir = options.working_dir.clone();
                session.command = options.command.clone();
                session.multiplexer_session_name = options.multiplexer_session_name.clone();
                session
            }
            PaneSource::Attach {
                tool_type,
                multiplexer_session_name,
                ..
            } => Session::single(id, tool_type.clone()).with_mux_name(multiplexer_session_name.clone()),
        };
        session.owner_window_id = Some(window.to_string());
        session.lifecycle_state = LifecycleState::Spawning;
        session.correlation_id = Some(correlation_id.to_string());
        session
    }

    fn remember_geometry(&mut self, id: &str, source: &PaneSource) {
        let geometry = match source {
            PaneSource::Spawn(options) => options.geometry,
            PaneSource::Attach { geometry, .. } => *geometry,
        };
        if let Some(geometry) = geometry {
            self.geometry.insert(id.to_string(), geometry);
        }
    }

    /// Start a new single-terminal tab owned by this window.
    pub fn spawn(&mut self, options: SpawnOptions) -> Result<SessionId, SessionError> {
        let id = new_session_id();
        let correlation_id = self.next_correlation_id();
        let source = PaneSource::Spawn(options);
        let session = self.new_pane(&id, &correlation_id, &source);
        self.replicator.add_session(session)?;
        self.remember_geometry(&id, &source);
        info!(session_id = %id, %correlation_id, "spawn requested");
        if let Err(e) = self.issue(&id, &id, OpKind::Spawn) {
            self.fail_family(&id, e.clone(), None);
            return Err(e);
        }
        if let Err(e) = self.replicator.set_focus(&id) {
            debug!(session_id = %id, error = %e, "new tab not focusable");
        }
        Ok(id)
    }

    /// Start a split container whose two panes connect independently.
    pub fn spawn_split(
        &mut self,
        orientation: SplitOrientation,
        first: PaneSource,
        second: PaneSource,
    ) -> Result<SessionId, SessionError> {
        let container_id = new_session_id();
        let pane_ids = [new_session_id(), new_session_id()];
        let sources = [first, second];
        let correlations = [self.next_correlation_id(), self.next_correlation_id()];

        let window = self.window();
        let container = Session::container(
            container_id.clone(),
            SplitLayout::even(orientation, &pane_ids[0], &pane_ids[1]),
        )
        .with_owner(Some(&window))
        .with_state(LifecycleState::Spawning);
        let panes = [
            self.new_pane(&pane_ids[0], &correlations[0], &sources[0]),
            self.new_pane(&pane_ids[1], &correlations[1], &sources[1]),
        ];
        self.replicator.add_split(container, panes)?;
        info!(session_id = %container_id, "split spawn requested");

        for (pane_id, source) in pane_ids.iter().zip(sources.iter()) {
            self.remember_geometry(pane_id, source);
            let kind = match source {
                PaneSource::Spawn(_) => OpKind::Spawn,
                PaneSource::Attach { .. } => OpKind::Reconnect,
            };
            if let Err(e) = self.issue(pane_id, &container_id, kind) {
                self.fail_family(&container_id, e.clone(), None);
                return Err(e);
            }
        }
        if let Err(e) = self.replicator.set_focus(&container_id) {
            debug!(session_id = %container_id, error = %e, "new split not focusable");
        }
        Ok(container_id)
    }

    /// Reattach a detached (or failed) tab to this window. Reattaching any
    /// pane of a split reattaches the whole split.
    pub fn reattach(&mut self, id: &str) -> Result<SessionId, SessionError> {
        self.connect_family(id, false)
    }

    /// Like [`Self::reattach`], but members that never got a multiplexer
    /// session are spawned afresh.
    pub fn respawn(&mut self, id: &str) -> Result<SessionId, SessionError> {
        self.connect_family(id, true)
    }

    fn connect_family(&mut self, id: &str, allow_spawn: bool) -> Result<SessionId, SessionError> {
        let window = self.window();
        let (root_id, plan) = {
            let store = self.replicator.store();
            let family = store.family_of(id);
            let root = family
                .first()
                .and_then(|root| store.get(root))
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            match root.lifecycle_state {
                LifecycleState::Detached | LifecycleState::Error => {}
                other => {
                    return Err(SessionError::InvalidState {
                        session_id: root.id.clone(),
                        detail: format!("cannot reattach a {} session", other.label()),
                    })
                }
            }
            if let Some(owner) = root.owner_window_id.as_deref().filter(|owner| *owner != window) {
                return Err(SessionError::InvalidState {
                    session_id: root.id.clone(),
                    detail: format!("owned by window {owner}"),
                });
            }
            let mut plan = Vec::new();
            for member in &family {
                let Some(session) = store.get(member) else {
                    continue;
                };
                if session.is_container() {
                    continue;
                }
                let kind = match session.multiplexer_session_name {
                    Some(_) => OpKind::Reconnect,
                    None if allow_spawn => OpKind::Spawn,
                    None => {
                        return Err(SessionError::InvalidState {
                            session_id: member.clone(),
                            detail: "has no multiplexer session to reattach; respawn it instead".into(),
                        })
                    }
                };
                plan.push((member.clone(), kind));
            }
            (root.id.clone(), plan)
        };

        self.abandon_family(&root_id);
        let assignments: Vec<(SessionId, String)> = plan
            .iter()
            .map(|(member, _)| (member.clone(), self.next_correlation_id()))
            .collect();
        self.replicator.batch(|store| {
            store.update_session(
                &root_id,
                SessionPatch::new()
                    .owner(Some(window.clone()))
                    .state(LifecycleState::Spawning)
                    .error(None),
            )?;
            for (member, correlation_id) in &assignments {
                store.update_session(
                    member,
                    SessionPatch::new()
                        .state(LifecycleState::Spawning)
                        .correlation(Some(correlation_id.clone()))
                        .error(None),
                )?;
            }
            Ok(())
        })?;
        info!(session_id = %root_id, panes = plan.len(), "reattach requested");

        for (member, kind) in &plan {
            if let Err(e) = self.issue(member, &root_id, *kind) {
                self.fail_family(&root_id, e.clone(), None);
                return Err(e);
            }
        }
        if let Err(e) = self.replicator.set_focus(&root_id) {
            debug!(session_id = %root_id, error = %e, "reattached tab not focusable");
        }
        Ok(root_id)
    }

    /// Send the request for one member and track it as pending.
    fn issue(&mut self, session_id: &str, family: &str, kind: OpKind) -> Result<(), SessionError> {
        let session = self
            .replicator
            .store()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let correlation_id = session
            .correlation_id
            .clone()
            .ok_or_else(|| SessionError::InvalidState {
                session_id: session_id.to_string(),
                detail: "no correlation id assigned".into(),
            })?;
        let size = self.request_size(session_id, session.multiplexer_session_name.as_deref());
        let payload = match kind {
            OpKind::Spawn => ClientPayload::Spawn(SpawnRequest {
                tool_type: session.tool_type.clone(),
                working_dir: session.working_dir.clone(),
                command: session.command.clone(),
                multiplexer_session_name: session.multiplexer_session_name.clone(),
                size,
            }),
            OpKind::Reconnect => {
                let name = session.multiplexer_session_name.clone().ok_or_else(|| {
                    SessionError::InvalidState {
                        session_id: session_id.to_string(),
                        detail: "has no multiplexer session to reattach".into(),
                    }
                })?;
                ClientPayload::Reconnect(ReconnectRequest {
                    multiplexer_session_name: name,
                    size,
                })
            }
        };
        self.pending.insert(
            correlation_id.clone(),
            PendingOp {
                correlation_id: correlation_id.clone(),
                session_id: session_id.to_string(),
                family: family.to_string(),
                kind,
                tool_type: session.tool_type.clone(),
                multiplexer_session_name: session.multiplexer_session_name.clone(),
                phase: Phase::Requested,
                issued_at: Instant::now(),
                ack: None,
            },
        );
        debug!(%session_id, %correlation_id, ?kind, "request sent");
        self.link.deliver(ClientMessage::correlated(correlation_id, payload))
    }

    /// Grid to declare when attaching; panes sharing a multiplexer session
    /// go through the normalizer.
    fn request_size(&mut self, session_id: &str, mux_name: Option<&str>) -> Option<GridSize> {
        let geometry = *self.geometry.get(session_id)?;
        let Some(name) = mux_name else {
            return Some(geometry.natural_size());
        };
        let normalized = self.normalizer.attach(name, session_id, &geometry);
        self.note_normalized(session_id, &geometry, normalized);
        Some(normalized.size)
    }

    fn note_normalized(&mut self, session_id: &str, geometry: &PaneGeometry, normalized: Normalized) {
        let font_changed = (normalized.font_size - geometry.metrics.font_size).abs() > f64::EPSILON;
        if font_changed || !normalized.exact {
            self.effects.push(Effect::Normalized {
                session_id: session_id.to_string(),
                normalized,
            });
        }
    }

    /// Gracefully release this window's hold on a tab. Never kills anything.
    ///
    /// Returns `Ok(false)` when there was nothing to detach (still spawning or
    /// already detached).
    pub fn detach(&mut self, id: &str) -> Result<bool, SessionError> {
        let window = self.window();
        let (root_id, family, handles, names) = {
            let store = self.replicator.store();
            let family = store.family_of(id);
            let root = family
                .first()
                .and_then(|root| store.get(root))
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            match root.lifecycle_state {
                LifecycleState::Spawning | LifecycleState::Detached => {
                    debug!(session_id = %root.id, state = root.lifecycle_state.label(), "detach is a no-op");
                    return Ok(false);
                }
                LifecycleState::Closed => {
                    return Err(SessionError::InvalidState {
                        session_id: root.id.clone(),
                        detail: "closed sessions cannot be detached".into(),
                    })
                }
                LifecycleState::Active | LifecycleState::Error => {}
            }
            if root.owner_window_id.as_deref() != Some(window.as_str()) {
                return Err(SessionError::InvalidState {
                    session_id: root.id.clone(),
                    detail: "not owned by this window".into(),
                });
            }
            let mut handles = Vec::new();
            let mut names = Vec::new();
            for member in family.iter().filter_map(|member| store.get(member)) {
                if member.is_container() {
                    continue;
                }
                let Some(name) = member.multiplexer_session_name.clone() else {
                    return Err(SessionError::InvalidState {
                        session_id: member.id.clone(),
                        detail: "was never spawned; close or respawn it instead".into(),
                    });
                };
                names.push((member.id.clone(), name));
                handles.extend(member.connection_handle.clone());
            }
            (root.id.clone(), family, handles, names)
        };

        self.abandon_family(&root_id);
        for handle in &handles {
            self.disconnect(handle);
        }
        let now = now_unix_millis();
        self.replicator.batch(|store| {
            for member in family.iter().filter(|member| **member != root_id) {
                store.update_session(
                    member,
                    SessionPatch::new().handle(None).correlation(None).error(None),
                )?;
            }
            store.update_session(
                &root_id,
                SessionPatch::new()
                    .handle(None)
                    .correlation(None)
                    .error(None)
                    .owner(None)
                    .state(LifecycleState::Detached)
                    .touched(now),
            )?;
            Ok(())
        })?;
        for (member, name) in &names {
            self.normalizer.release(name, member);
        }
        info!(session_id = %root_id, handles = handles.len(), "detached");
        Ok(true)
    }

    /// Explicit, destructive termination of a tab's multiplexer sessions.
    pub fn close(&mut self, id: &str) -> Result<(), SessionError> {
        let window = self.window();
        let (root_id, targets) = {
            let store = self.replicator.store();
            let family = store.family_of(id);
            let root = family
                .first()
                .and_then(|root| store.get(root))
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if root.lifecycle_state == LifecycleState::Closed {
                return Ok(());
            }
            if let Some(owner) = root.owner_window_id.as_deref().filter(|owner| *owner != window) {
                return Err(SessionError::InvalidState {
                    session_id: root.id.clone(),
                    detail: format!("owned by window {owner}"),
                });
            }
            let targets: Vec<(SessionId, Option<String>, Option<String>)> = family
                .iter()
                .filter_map(|member| store.get(member))
                .filter(|member| !member.is_container())
                .map(|member| {
                    (
                        member.id.clone(),
                        member.connection_handle.clone(),
                        member.multiplexer_session_name.clone(),
                    )
                })
                .collect();
            (root.id.clone(), targets)
        };

        self.abandon_family(&root_id);
        let mut requested = BTreeSet::new();
        let mut local_only = Vec::new();
        for (member, handle, name) in targets {
            let Some(name) = name else {
                local_only.push(member);
                continue;
            };
            if !requested.insert(name.clone()) {
                continue;
            }
            let request = match handle {
                Some(handle) => CloseRequest {
                    connection_handle: Some(handle),
                    multiplexer_session_name: None,
                },
                None => CloseRequest {
                    connection_handle: None,
                    multiplexer_session_name: Some(name.clone()),
                },
            };
            let correlation_id = self.next_correlation_id();
            info!(session_id = %member, session = %name, "close requested");
            self.link
                .deliver(ClientMessage::correlated(correlation_id, ClientPayload::Close(request)))?;
        }

        if !local_only.is_empty() {
            let whole_family = requested.is_empty();
            self.replicator.batch(|store| {
                for member in &local_only {
                    store.update_session(
                        member,
                        SessionPatch::new()
                            .state(LifecycleState::Closed)
                            .handle(None)
                            .correlation(None),
                    )?;
                }
                if whole_family && !local_only.contains(&root_id) {
                    store.update_session(&root_id, SessionPatch::new().state(LifecycleState::Closed))?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Drop a finished tab from the table. Live tabs must be detached or
    /// closed first.
    pub fn forget(&mut self, id: &str) -> Result<(), SessionError> {
        let (root_id, members) = {
            let store = self.replicator.store();
            let family = store.family_of(id);
            let root = family
                .first()
                .and_then(|root| store.get(root))
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if matches!(root.lifecycle_state, LifecycleState::Active | LifecycleState::Spawning) {
                return Err(SessionError::InvalidState {
                    session_id: root.id.clone(),
                    detail: format!("is {}; detach or close it first", root.lifecycle_state.label()),
                });
            }
            let members: Vec<(SessionId, Option<String>)> = family
                .iter()
                .filter_map(|member| store.get(member))
                .map(|member| (member.id.clone(), member.multiplexer_session_name.clone()))
                .collect();
            (root.id.clone(), members)
        };
        self.abandon_family(&root_id);
        self.replicator.remove_session(&root_id)?;
        for (member, name) in members {
            if let Some(name) = name {
                self.normalizer.release(&name, &member);
            }
            self.geometry.remove(&member);
        }
        info!(session_id = %root_id, "forgotten");
        Ok(())
    }

    /// Forward keystrokes to a connected terminal.
    pub fn send_input(&mut self, id: &str, bytes: Vec<u8>) -> Result<(), SessionError> {
        let handle = self.live_handle(id)?;
        self.link.deliver(ClientMessage::new(ClientPayload::Input(IoChunk {
            connection_handle: handle,
            bytes,
        })))
    }

    fn live_handle(&self, id: &str) -> Result<String, SessionError> {
        let session = self
            .replicator
            .store()
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.owner_window_id.as_deref() != Some(self.replicator.window_id()) {
            return Err(SessionError::InvalidState {
                session_id: id.to_string(),
                detail: "not owned by this window".into(),
            });
        }
        session
            .connection_handle
            .clone()
            .ok_or_else(|| SessionError::InvalidState {
                session_id: id.to_string(),
                detail: "is not connected".into(),
            })
    }

    /// Record a pane's new rendering area and resize its terminal.
    ///
    /// Panes sharing a multiplexer session keep the reference grid and only
    /// change font; the reference holder moves the grid for everyone.
    pub fn resize(&mut self, id: &str, geometry: PaneGeometry) -> Result<(), SessionError> {
        let session = self
            .replicator
            .store()
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if session.is_container() {
            return Err(SessionError::InvalidState {
                session_id: id.to_string(),
                detail: "split containers have no terminal of their own".into(),
            });
        }
        let name = session.multiplexer_session_name.clone();
        let handle = session.connection_handle.clone();
        self.geometry.insert(id.to_string(), geometry);
        let Some(name) = name else {
            // Not bound yet: the geometry goes out with the request.
            return Ok(());
        };

        let registered = self.normalizer.panes(&name).iter().any(|pane| pane == id);
        let before = self.normalizer.reference(&name);
        let resized = if registered {
            self.normalizer.resize(&name, id, &geometry)
        } else {
            None
        };
        let normalized = match resized {
            Some(normalized) => normalized,
            None => self.normalizer.attach(&name, id, &geometry),
        };
        self.note_normalized(id, &geometry, normalized);
        let after = self.normalizer.reference(&name);
        if before == after {
            return Ok(());
        }

        for other in self.normalizer.panes(&name) {
            if other == id {
                continue;
            }
            let Some(other_geometry) = self.geometry.get(&other).copied() else {
                continue;
            };
            if let Some(refit) = self.normalizer.refit(&name, &other_geometry) {
                self.effects.push(Effect::Normalized {
                    session_id: other,
                    normalized: refit,
                });
            }
        }
        if let (Some(handle), Some(size)) = (handle, after) {
            debug!(session_id = %id, cols = size.cols, rows = size.rows, "resize sent");
            self.link.deliver(ClientMessage::new(ClientPayload::Resize(ResizeRequest {
                connection_handle: handle,
                cols: size.cols,
                rows: size.rows,
            })))?;
        }
        Ok(())
    }

    /// Release tabs held by windows that are no longer running (for example
    /// after the whole UI restarted from the persisted table, or a sibling
    /// crashed). Their gateway connections died with them, so the tabs become
    /// detached candidates; families with a never-spawned member are closed
    /// instead.
    pub fn release_orphans(&mut self, live_windows: &[String]) -> Result<Vec<SessionId>, SessionError> {
        let roots = self.roots_owned_by(|owner| !live_windows.iter().any(|live| live == owner));
        let released = self.release_families(&roots, false)?;
        if !released.is_empty() {
            info!(count = released.len(), "released tabs of windows that are gone");
        }
        Ok(released)
    }

    fn roots_owned_by(&self, matches: impl Fn(&str) -> bool) -> Vec<SessionId> {
        self.replicator
            .store()
            .sessions()
            .filter(|session| !session.is_hidden_pane)
            .filter(|session| session.owner_window_id.as_deref().is_some_and(|owner| matches(owner)))
            .filter(|session| session.lifecycle_state != LifecycleState::Closed)
            .map(|session| session.id.clone())
            .collect()
    }

    /// Release every tab `window_id` holds, as if that window had crashed.
    /// A starting window calls this for its own id: nothing it held in a
    /// previous run is still connected.
    pub fn release_window(&mut self, window_id: &str) -> Result<Vec<SessionId>, SessionError> {
        let roots = self.roots_owned_by(|owner| owner == window_id);
        let released = self.release_families(&roots, false)?;
        if !released.is_empty() {
            info!(window = %window_id, count = released.len(), "released tabs of a window that went away");
        }
        Ok(released)
    }

    /// Tell the gateway which window this connection belongs to. The reply
    /// lists the live windows, which releases tabs held by any other.
    pub fn announce(&mut self) -> Result<(), SessionError> {
        let window = self.window();
        let owners: BTreeSet<String> = self
            .replicator
            .store()
            .sessions()
            .filter_map(|session| session.owner_window_id.clone())
            .filter(|owner| *owner != window)
            .collect();
        self.announced_owners = Some(owners);
        let correlation_id = self.next_correlation_id();
        let hello = ClientPayload::Hello(WindowHello {
            window_id: self.window(),
        });
        self.link.deliver(ClientMessage::correlated(correlation_id, hello))
    }

    /// Let go of everything this window holds before it closes. Connected
    /// tabs are detached gracefully. Tabs still waiting on the gateway are
    /// released without waiting: a family that already has its multiplexer
    /// names becomes a detached candidate, one that does not is closed.
    pub fn relinquish_all(&mut self) -> Vec<SessionId> {
        let window = self.window();
        let owned = self.roots_owned_by(|owner| owner == window);
        let mut let_go = Vec::new();
        let mut leftover = Vec::new();
        for id in owned {
            match self.detach(&id) {
                Ok(true) => let_go.push(id),
                Ok(false) => leftover.push(id),
                Err(e) => {
                    debug!(session_id = %id, error = %e, "not detachable; releasing instead");
                    leftover.push(id);
                }
            }
        }
        match self.release_families(&leftover, true) {
            Ok(released) => {
                if !released.is_empty() {
                    info!(count = released.len(), "released unfinished tabs on shutdown");
                }
                let_go.extend(released);
            }
            Err(e) => warn!(error = %e, "could not release unfinished tabs on shutdown"),
        }
        let families: BTreeSet<SessionId> = self.pending.values().map(|op| op.family.clone()).collect();
        for family in families {
            self.abandon_family(&family);
        }
        let_go
    }

    /// Drop ownership of each root's family in one transaction. Pending
    /// requests are abandoned; `disconnect` also releases handles still held.
    fn release_families(&mut self, roots: &[SessionId], disconnect: bool) -> Result<Vec<SessionId>, SessionError> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        let plan: Vec<(SessionId, Vec<SessionId>, bool, Vec<String>)> = {
            let store = self.replicator.store();
            roots
                .iter()
                .map(|root| {
                    let family = store.family_of(root);
                    let members: Vec<&Session> = family
                        .iter()
                        .filter_map(|member| store.get(member))
                        .collect();
                    let recoverable = members
                        .iter()
                        .filter(|member| !member.is_container())
                        .all(|member| member.multiplexer_session_name.is_some());
                    let handles = members
                        .iter()
                        .filter_map(|member| member.connection_handle.clone())
                        .collect();
                    (root.clone(), family, recoverable, handles)
                })
                .collect()
        };
        for (root, _, _, handles) in &plan {
            self.abandon_family(root);
            if disconnect {
                for handle in handles {
                    self.disconnect(handle);
                }
            }
        }
        let now = now_unix_millis();
        self.replicator.batch(|store| {
            for (root, family, recoverable, _) in &plan {
                for member in family.iter().filter(|member| *member != root) {
                    store.update_session(member, SessionPatch::new().handle(None).correlation(None))?;
                }
                let state = if *recoverable {
                    LifecycleState::Detached
                } else {
                    LifecycleState::Closed
                };
                store.update_session(
                    root,
                    SessionPatch::new()
                        .handle(None)
                        .correlation(None)
                        .owner(None)
                        .state(state)
                        .touched(now),
                )?;
            }
            Ok(())
        })?;
        for (root, family, _, _) in &plan {
            for member in family {
                if let Some(name) = self
                    .replicator
                    .store()
                    .get(member)
                    .and_then(|session| session.multiplexer_session_name.clone())
                {
                    self.normalizer.release(&name, member);
                }
            }
            debug!(session_id = %root, "released");
        }
        Ok(plan.into_iter().map(|(root, _, _, _)| root).collect())
    }

    /// Ask the gateway for every multiplexer session it can see.
    pub fn request_listing(&mut self) -> Result<(), SessionError> {
        let correlation_id = self.next_correlation_id();
        self.link
            .deliver(ClientMessage::correlated(correlation_id, ClientPayload::ListSessions))
    }

    /// Fail every family whose request outlived the acknowledgment timeout.
    /// Nothing is retried.
    pub fn tick(&mut self, now: Instant) {
        let expired: BTreeSet<SessionId> = self
            .pending
            .values()
            .filter(|op| now.saturating_duration_since(op.issued_at) >= self.ack_timeout)
            .map(|op| op.family.clone())
            .collect();
        for family in expired {
            warn!(session_id = %family, waited_secs = self.ack_timeout.as_secs(), "acknowledgment timed out");
            let error = SessionError::Timeout {
                session_id: family.clone(),
                waited: self.ack_timeout,
            };
            self.fail_family(&family, error, None);
        }
    }

    /// Apply one message pushed by the gateway.
    pub fn handle_server(&mut self, message: ServerMessage) {
        let ServerMessage {
            correlation_id,
            payload,
        } = message;
        match payload {
            ServerPayload::Spawned(ack) => self.on_spawned(correlation_id, ack),
            ServerPayload::Error(reply) => self.on_error(correlation_id, reply),
            ServerPayload::Closed(closed) => self.on_closed(&closed.multiplexer_session_name),
            ServerPayload::Output(chunk) => self.on_output(chunk),
            ServerPayload::OwnershipRevoked(revoked) => self.on_revoked(revoked),
            ServerPayload::ProcessGone(gone) => self.on_process_gone(gone),
            ServerPayload::SessionList(list) => self.import_external(list),
            ServerPayload::LiveWindows(live) => self.on_live_windows(live),
            ServerPayload::WindowGone(gone) => self.on_window_gone(gone),
        }
    }

    /// Owners that were in the table at announce time and are not live held
    /// their tabs in a run that is over. Windows that connected since are
    /// not in the reply, so only those earlier owners are considered.
    fn on_live_windows(&mut self, live: LiveWindows) {
        let Some(suspects) = self.announced_owners.take() else {
            debug!("unsolicited live window list ignored");
            return;
        };
        // Owners that showed up after the hello went out are alive.
        let mut alive: Vec<String> = self
            .replicator
            .store()
            .sessions()
            .filter_map(|session| session.owner_window_id.clone())
            .filter(|owner| !suspects.contains(owner))
            .collect();
        alive.extend(live.window_ids);
        alive.push(self.window());
        if let Err(e) = self.release_orphans(&alive) {
            warn!(error = %e, "could not release tabs of gone windows");
        }
    }

    /// A sibling's connection dropped without it letting go of its tabs.
    fn on_window_gone(&mut self, gone: WindowGone) {
        if gone.window_id == self.replicator.window_id() {
            return;
        }
        if let Err(e) = self.release_window(&gone.window_id) {
            warn!(window = %gone.window_id, error = %e, "could not release tabs of a gone window");
        }
    }

    /// Correlation id first. An id this window already settled (bound,
    /// superseded or failed) matches nothing; an id it never saw falls back to
    /// the session name and then the tool type.
    fn match_ack(&self, correlation_id: Option<&str>, ack: &Spawned) -> Option<(String, MatchRule)> {
        if let Some(correlation_id) = correlation_id {
            if self.pending.contains_key(correlation_id) {
                return Some((correlation_id.to_string(), MatchRule::Correlation));
            }
            if self.superseded.iter().any(|old| old == correlation_id) {
                return None;
            }
        }
        let name = ack.multiplexer_session_name.as_str();
        let by_name = self
            .pending
            .values()
            .filter(|op| op.phase == Phase::Requested)
            .filter(|op| op.multiplexer_session_name.as_deref() == Some(name))
            .min_by_key(|op| op.issued_at);
        if let Some(op) = by_name {
            return Some((op.correlation_id.clone(), MatchRule::SessionName));
        }
        let tool_type = ack.tool_type.as_deref()?;
        self.pending
            .values()
            .filter(|op| op.phase == Phase::Requested && op.kind == OpKind::Spawn)
            .filter(|op| op.tool_type == tool_type)
            .min_by_key(|op| op.issued_at)
            .map(|op| (op.correlation_id.clone(), MatchRule::ToolType))
    }

    fn on_spawned(&mut self, correlation_id: Option<String>, ack: Spawned) {
        if let Some(bound) = self.replicator.store().find_by_handle(&ack.connection_handle) {
            debug!(
                correlation_id = correlation_id.as_deref().unwrap_or("-"),
                session_id = %bound.id,
                handle = %ack.connection_handle,
                "repeated acknowledgment for a bound handle ignored"
            );
            return;
        }
        let Some((key, rule)) = self.match_ack(correlation_id.as_deref(), &ack) else {
            self.release_stale(&ack, correlation_id.as_deref());
            return;
        };
        let Some((session_id, family)) = self
            .pending
            .get(&key)
            .map(|op| (op.session_id.clone(), op.family.clone()))
        else {
            return;
        };
        let waiting = self.replicator.store().get(&session_id).is_some_and(|session| {
            session.lifecycle_state == LifecycleState::Spawning
                && session.correlation_id.as_deref() == Some(key.as_str())
        });
        if !waiting {
            if let Some(op) = self.pending.remove(&key) {
                self.remember_superseded(op.correlation_id);
            }
            self.release_stale(&ack, Some(&key));
            return;
        }

        info!(
            %session_id,
            correlation_id = %key,
            rule = rule.label(),
            session = %ack.multiplexer_session_name,
            "acknowledgment matched"
        );
        if let Some(op) = self.pending.get_mut(&key) {
            op.phase = Phase::Acknowledged;
            op.ack = Some(ack);
        }
        let complete = self
            .pending
            .values()
            .filter(|op| op.family == family)
            .all(|op| op.phase == Phase::Acknowledged);
        if complete {
            self.bind_family(&family);
        } else {
            debug!(%session_id, %family, "holding acknowledgment for the rest of the split");
        }
    }

    /// A reply nobody is waiting for still holds a live handle: let it go.
    fn release_stale(&mut self, ack: &Spawned, correlation_id: Option<&str>) {
        let superseded = correlation_id.is_some_and(|id| self.superseded.iter().any(|old| old == id));
        warn!(
            correlation_id = correlation_id.unwrap_or("-"),
            superseded,
            session = %ack.multiplexer_session_name,
            handle = %ack.connection_handle,
            "discarding stale acknowledgment"
        );
        self.release_handle(&ack.connection_handle);
    }

    /// Disconnect a handle no tab is bound to. A repeated ack can carry the
    /// handle of a tab that is already live; that one stays connected.
    fn release_handle(&mut self, handle: &str) {
        if let Some(bound) = self.replicator.store().find_by_handle(handle) {
            debug!(%handle, session_id = %bound.id, "handle is bound; not releasing");
            return;
        }
        self.disconnect(handle);
    }

    fn bind_family(&mut self, family: &str) {
        let keys: Vec<String> = self
            .pending
            .values()
            .filter(|op| op.family == family)
            .map(|op| op.correlation_id.clone())
            .collect();
        let acks: Vec<(SessionId, Spawned)> = keys
            .iter()
            .filter_map(|key| self.pending.remove(key))
            .filter_map(|op| Some((op.session_id, op.ack?)))
            .collect();
        for key in keys {
            self.remember_superseded(key);
        }
        let root_is_container = self
            .replicator
            .store()
            .get(family)
            .is_some_and(Session::is_container);

        let bound = self.replicator.batch(|store| {
            for (session_id, ack) in &acks {
                store.update_session(
                    session_id,
                    SessionPatch::new()
                        .mux_name(ack.multiplexer_session_name.clone())
                        .handle(Some(ack.connection_handle.clone()))
                        .correlation(None)
                        .error(None)
                        .state(LifecycleState::Active),
                )?;
            }
            if root_is_container {
                store.update_session(
                    family,
                    SessionPatch::new().state(LifecycleState::Active).error(None),
                )?;
            }
            Ok(())
        });
        if let Err(e) = bound {
            warn!(session_id = %family, error = %e, "could not bind acknowledged family");
            for (_, ack) in &acks {
                self.release_handle(&ack.connection_handle);
            }
            self.mark_failed(family, &e, None);
            return;
        }
        info!(session_id = %family, panes = acks.len(), "bound");

        for (session_id, ack) in &acks {
            let name = &ack.multiplexer_session_name;
            let Some(geometry) = self.geometry.get(session_id).copied() else {
                continue;
            };
            if self.normalizer.panes(name).iter().any(|pane| pane == session_id) {
                continue;
            }
            // Spawned without a name: join the normalizer now that it is known.
            let normalized = self.normalizer.attach(name, session_id, &geometry);
            self.note_normalized(session_id, &geometry, normalized);
            if normalized.size != geometry.natural_size() {
                let resize = ClientMessage::new(ClientPayload::Resize(ResizeRequest {
                    connection_handle: ack.connection_handle.clone(),
                    cols: normalized.size.cols,
                    rows: normalized.size.rows,
                }));
                if let Err(e) = self.link.deliver(resize) {
                    warn!(%session_id, error = %e, "initial resize not sent");
                }
            }
        }
    }

    fn on_error(&mut self, correlation_id: Option<String>, reply: ErrorReply) {
        let Some(correlation_id) = correlation_id else {
            warn!(code = ?reply.code, reason = %reply.reason, "gateway error");
            self.effects.push(Effect::Notice {
                session_id: None,
                message: reply.reason,
            });
            return;
        };
        let Some(op) = self.pending.get(&correlation_id) else {
            debug!(%correlation_id, reason = %reply.reason, "error for a request nobody waits on");
            return;
        };
        let family = op.family.clone();
        let session_id = op.session_id.clone();
        let name = op.multiplexer_session_name.clone();
        let kind = op.kind;
        warn!(%session_id, %correlation_id, code = ?reply.code, reason = %reply.reason, "request failed");

        match reply.code {
            ErrorCode::AlreadyExists if kind == OpKind::Spawn => {
                // Nothing was created: take the tab back out.
                self.abandon_family(&family);
                let error = SessionError::AlreadyExists(name.unwrap_or(reply.reason));
                if let Err(e) = self.replicator.remove_session(&family) {
                    warn!(session_id = %family, error = %e, "could not remove rejected spawn");
                }
                self.effects.push(Effect::Notice {
                    session_id: None,
                    message: error.to_string(),
                });
            }
            ErrorCode::ProcessGone => {
                let error = SessionError::ProcessGone(name.unwrap_or(reply.reason));
                self.fail_family(&family, error, None);
            }
            _ => {
                let error = SessionError::InvalidState {
                    session_id,
                    detail: reply.reason,
                };
                self.fail_family(&family, error, None);
            }
        }
    }

    fn on_closed(&mut self, name: &str) {
        let (affected, roots) = {
            let store = self.replicator.store();
            let affected: Vec<SessionId> = store
                .find_by_mux_name(name)
                .into_iter()
                .map(|session| session.id.clone())
                .collect();
            let roots: BTreeSet<SessionId> = affected
                .iter()
                .filter_map(|id| store.family_of(id).first().cloned())
                .collect();
            (affected, roots)
        };
        if affected.is_empty() {
            debug!(session = %name, "closed reply for an unknown session");
            return;
        }
        for root in &roots {
            self.abandon_family(root);
        }
        for id in &affected {
            self.normalizer.release(name, id);
        }
        let closed = self.replicator.batch(|store| {
            for id in &affected {
                store.update_session(
                    id,
                    SessionPatch::new()
                        .state(LifecycleState::Closed)
                        .handle(None)
                        .correlation(None),
                )?;
            }
            for root in &roots {
                let family = store.family_of(root);
                if family.len() < 2 {
                    continue;
                }
                let all_closed = family
                    .iter()
                    .filter_map(|member| store.get(member))
                    .filter(|member| !member.is_container())
                    .all(|member| member.lifecycle_state == LifecycleState::Closed);
                if all_closed {
                    store.update_session(root, SessionPatch::new().state(LifecycleState::Closed))?;
                }
            }
            Ok(())
        });
        match closed {
            Ok(()) => info!(session = %name, tabs = affected.len(), "closed"),
            Err(e) => warn!(session = %name, error = %e, "could not record close"),
        }
    }

    fn on_output(&mut self, chunk: IoChunk) {
        match self.replicator.store().find_by_handle(&chunk.connection_handle) {
            Some(session) => {
                let session_id = session.id.clone();
                self.effects.push(Effect::Output {
                    session_id,
                    bytes: chunk.bytes,
                });
            }
            None => debug!(handle = %chunk.connection_handle, "output for unknown handle dropped"),
        }
    }

    fn on_revoked(&mut self, revoked: OwnershipRevoked) {
        let window = self.window();
        let (root_id, family, other_handles, names) = {
            let store = self.replicator.store();
            let Some(session) = store.find_by_handle(&revoked.connection_handle) else {
                debug!(handle = %revoked.connection_handle, "revocation for unknown handle");
                return;
            };
            if session.owner_window_id.as_deref() != Some(window.as_str()) {
                debug!(session_id = %session.id, "revocation for a tab this window no longer owns");
                return;
            }
            let family = store.family_of(&session.id);
            let Some(root_id) = family.first().cloned() else {
                return;
            };
            let mut other_handles = Vec::new();
            let mut names = Vec::new();
            for member in family.iter().filter_map(|member| store.get(member)) {
                if let Some(handle) = &member.connection_handle {
                    if *handle != revoked.connection_handle {
                        other_handles.push(handle.clone());
                    }
                }
                if let Some(name) = &member.multiplexer_session_name {
                    names.push((member.id.clone(), name.clone()));
                }
            }
            (root_id, family, other_handles, names)
        };

        info!(
            session_id = %root_id,
            session = %revoked.multiplexer_session_name,
            "ownership revoked; detaching locally"
        );
        self.abandon_family(&root_id);
        for handle in &other_handles {
            self.disconnect(handle);
        }
        let now = now_unix_millis();
        let detached = self.replicator.batch(|store| {
            for member in family.iter().filter(|member| **member != root_id) {
                store.update_session(member, SessionPatch::new().handle(None).correlation(None))?;
            }
            store.update_session(
                &root_id,
                SessionPatch::new()
                    .handle(None)
                    .correlation(None)
                    .owner(None)
                    .state(LifecycleState::Detached)
                    .touched(now),
            )?;
            Ok(())
        });
        if let Err(e) = detached {
            warn!(session_id = %root_id, error = %e, "could not detach revoked tab");
        }
        for (member, name) in &names {
            self.normalizer.release(name, member);
        }
        self.effects.push(Effect::Notice {
            session_id: Some(root_id),
            message: SessionError::OwnershipConflict(revoked.multiplexer_session_name).to_string(),
        });
    }

    fn on_process_gone(&mut self, gone: ProcessGone) {
        let window = self.window();
        let name = gone.multiplexer_session_name;
        let roots: BTreeSet<SessionId> = {
            let store = self.replicator.store();
            store
                .find_by_mux_name(&name)
                .into_iter()
                .filter(|session| match session.owner_window_id.as_deref() {
                    Some(owner) => owner == window,
                    None => true,
                })
                .filter_map(|session| store.family_of(&session.id).first().cloned())
                .collect()
        };
        if roots.is_empty() {
            debug!(session = %name, "process gone for a session this window does not hold");
            return;
        }
        warn!(session = %name, reason = %gone.reason, tabs = roots.len(), "multiplexer session gone");
        let error = SessionError::ProcessGone(name.clone());
        for root in roots {
            self.abandon_family(&root);
            self.mark_failed(&root, &error, Some(&name));
        }
    }

    /// Import multiplexer sessions this table does not know as detached tabs.
    fn import_external(&mut self, list: SessionList) {
        let fresh: Vec<String> = {
            let store = self.replicator.store();
            list.sessions
                .into_iter()
                .filter(|listed| !listed.owned)
                .map(|listed| listed.name)
                .filter(|name| store.find_by_mux_name(name).is_empty())
                .filter(|name| {
                    !self
                        .pending
                        .values()
                        .any(|op| op.multiplexer_session_name.as_deref() == Some(name.as_str()))
                })
                .collect()
        };
        if fresh.is_empty() {
            debug!("reconciliation found nothing new");
            return;
        }
        let now = now_unix_millis();
        let sessions: Vec<Session> = fresh
            .iter()
            .map(|name| {
                let mut session = Session::single(new_session_id(), EXTERNAL_TOOL_TYPE)
                    .with_mux_name(name.clone())
                    .with_display_name(name.clone())
                    .with_state(LifecycleState::Detached);
                session.last_active_at = Some(now);
                session
            })
            .collect();
        let session_ids: Vec<SessionId> = sessions.iter().map(|session| session.id.clone()).collect();
        let imported = self.replicator.batch(|store| {
            for session in sessions {
                store.add_session(session)?;
            }
            Ok(())
        });
        match imported {
            Ok(()) => {
                info!(count = session_ids.len(), "imported external multiplexer sessions");
                self.effects.push(Effect::Imported { session_ids });
            }
            Err(e) => warn!(error = %e, "could not import external sessions"),
        }
    }

    fn fail_family(&mut self, family: &str, error: SessionError, gone: Option<&str>) {
        self.abandon_family(family);
        self.mark_failed(family, &error, gone);
    }

    /// Move a family to `error`, dropping every handle it still holds.
    /// Handles on the `gone` multiplexer session are already dead backend-side.
    fn mark_failed(&mut self, family: &str, error: &SessionError, gone: Option<&str>) {
        let (members, live_handles, names) = {
            let store = self.replicator.store();
            let members = store.family_of(family);
            let mut live_handles = Vec::new();
            let mut names = Vec::new();
            for member in members.iter().filter_map(|member| store.get(member)) {
                let name = member.multiplexer_session_name.as_deref();
                if let Some(handle) = &member.connection_handle {
                    if name.is_none() || name != gone {
                        live_handles.push(handle.clone());
                    }
                }
                if let Some(name) = name {
                    names.push((member.id.clone(), name.to_string()));
                }
            }
            (members, live_handles, names)
        };
        let Some(root) = members.first().cloned() else {
            return;
        };
        for handle in &live_handles {
            self.disconnect(handle);
        }
        let message = error.to_string();
        let failed = self.replicator.batch(|store| {
            store.update_session(
                &root,
                SessionPatch::new()
                    .state(LifecycleState::Error)
                    .handle(None)
                    .correlation(None)
                    .error(Some(message.clone())),
            )?;
            for member in members.iter().skip(1) {
                store.update_session(
                    member,
                    SessionPatch::new()
                        .handle(None)
                        .correlation(None)
                        .error(Some(message.clone())),
                )?;
            }
            Ok(())
        });
        if let Err(e) = failed {
            warn!(session_id = %root, error = %e, "could not record failure");
        }
        for (member, name) in &names {
            self.normalizer.release(name, member);
        }
        warn!(session_id = %root, %message, "session failed");
        self.effects.push(Effect::Notice {
            session_id: Some(root),
            message,
        });
    }

    /// Forget every pending request of `family`, releasing acknowledged handles.
    fn abandon_family(&mut self, family: &str) {
        let keys: Vec<String> = self
            .pending
            .values()
            .filter(|op| op.family == family)
            .map(|op| op.correlation_id.clone())
            .collect();
        for key in keys {
            let Some(op) = self.pending.remove(&key) else {
                continue;
            };
            if let Some(ack) = &op.ack {
                self.release_handle(&ack.connection_handle);
            }
            debug!(session_id = %op.session_id, correlation_id = %op.correlation_id, "request superseded");
            self.remember_superseded(op.correlation_id);
        }
    }

    fn remember_superseded(&mut self, correlation_id: String) {
        if self.superseded.len() >= SUPERSEDED_HISTORY {
            self.superseded.pop_front();
        }
        self.superseded.push_back(correlation_id);
    }

    /// Graceful release; the multiplexer session keeps running.
    fn disconnect(&mut self, handle: &str) {
        let message = ClientMessage::new(ClientPayload::Disconnect(HandleRef {
            connection_handle: handle.to_string(),
        }));
        if let Err(e) = self.link.deliver(message) {
            warn!(%handle, error = %e, "disconnect not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::FontMetrics;
    use crate::protocol::{ClosedReply, ListedSession};
    use crate::replicator::LocalBus;
    use crate::store::{InvariantPolicy, SessionStore};

    fn orchestrator(window: &str) -> (Orchestrator, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let replicator = Replicator::new(
            window,
            SessionStore::with_policy(InvariantPolicy::Normalize),
            None,
            Box::new(LocalBus::new(16)),
        );
        (Orchestrator::new(replicator, Box::new(tx), DEFAULT_ACK_TIMEOUT), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn ack(correlation: Option<&str>, name: &str, handle: &str, tool: Option<&str>) -> ServerMessage {
        ServerMessage {
            correlation_id: correlation.map(str::to_string),
            payload: ServerPayload::Spawned(Spawned {
                multiplexer_session_name: name.into(),
                connection_handle: handle.into(),
                tool_type: tool.map(str::to_string),
            }),
        }
    }

    fn only_correlation(sent: &[ClientMessage]) -> String {
        assert_eq!(sent.len(), 1, "expected one request, got {sent:?}");
        sent[0].correlation_id.clone().expect("correlated request")
    }

    fn session<'a>(orch: &'a Orchestrator, id: &str) -> &'a Session {
        orch.replicator().store().get(id).expect("session exists")
    }

    fn spawn_active(orch: &mut Orchestrator, rx: &mut mpsc::UnboundedReceiver<ClientMessage>, name: &str) -> SessionId {
        let id = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        let correlation = only_correlation(&drain(rx));
        orch.handle_server(ack(Some(&correlation), name, &format!("h-{name}"), Some("bash")));
        assert_eq!(session(orch, &id).lifecycle_state, LifecycleState::Active);
        id
    }

    fn geometry(width_px: f64, height_px: f64, font_size: f64) -> PaneGeometry {
        PaneGeometry {
            width_px,
            height_px,
            metrics: FontMetrics {
                font_size,
                cell_width: font_size * 0.6,
                cell_height: font_size * 1.2,
            },
        }
    }

    // Ensures spawn issues a correlated request and the ack binds the tab.
    #[test]
    fn spawn_binds_on_correlated_ack() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        let sent = drain(&mut rx);
        let correlation = only_correlation(&sent);
        assert!(matches!(&sent[0].payload, ClientPayload::Spawn(req) if req.tool_type == "bash"));
        assert_eq!(session(&orch, &id).lifecycle_state, LifecycleState::Spawning);
        assert_eq!(orch.replicator().focus(), Some(id.as_str()));

        orch.handle_server(ack(Some(&correlation), "tabmux-bash-0001", "h-1", Some("bash")));
        let bound = session(&orch, &id);
        assert_eq!(bound.lifecycle_state, LifecycleState::Active);
        assert_eq!(bound.multiplexer_session_name.as_deref(), Some("tabmux-bash-0001"));
        assert_eq!(bound.connection_handle.as_deref(), Some("h-1"));
        assert!(bound.correlation_id.is_none());
        assert_eq!(orch.pending().count(), 0);
    }

    // Ensures acks fall back to the session name, then to the tool type.
    #[test]
    fn uncorrelated_ack_falls_back_to_name_then_tool() {
        let (mut orch, mut rx) = orchestrator("A");
        let mut named = SpawnOptions::new("htop");
        named.multiplexer_session_name = Some("work".into());
        let by_name = orch.spawn(named).expect("spawn named");
        let by_tool = orch.spawn(SpawnOptions::new("bash")).expect("spawn bash");
        drain(&mut rx);

        orch.handle_server(ack(None, "work", "h-1", None));
        assert_eq!(session(&orch, &by_name).lifecycle_state, LifecycleState::Active);

        orch.handle_server(ack(None, "tabmux-bash-77aa", "h-2", Some("bash")));
        let bound = session(&orch, &by_tool);
        assert_eq!(bound.lifecycle_state, LifecycleState::Active);
        assert_eq!(bound.multiplexer_session_name.as_deref(), Some("tabmux-bash-77aa"));
    }

    // Ensures a late ack for a superseded correlation id is discarded and released.
    #[test]
    fn late_ack_for_superseded_request_is_released() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        let first = only_correlation(&drain(&mut rx));

        // Detaching a spawning tab does nothing.
        assert!(!orch.detach(&id).expect("detach"));
        assert!(drain(&mut rx).is_empty());

        orch.tick(Instant::now() + DEFAULT_ACK_TIMEOUT + Duration::from_secs(1));
        assert_eq!(session(&orch, &id).lifecycle_state, LifecycleState::Error);
        orch.respawn(&id).expect("respawn");
        let second = only_correlation(&drain(&mut rx));
        assert_ne!(first, second);

        orch.handle_server(ack(Some(&first), "tabmux-bash-old", "h-old", Some("bash")));
        let sent = drain(&mut rx);
        assert_eq!(
            sent,
            vec![ClientMessage::new(ClientPayload::Disconnect(HandleRef {
                connection_handle: "h-old".into()
            }))]
        );
        assert_eq!(session(&orch, &id).lifecycle_state, LifecycleState::Spawning);

        orch.handle_server(ack(Some(&second), "tabmux-bash-new", "h-new", Some("bash")));
        assert_eq!(
            session(&orch, &id).multiplexer_session_name.as_deref(),
            Some("tabmux-bash-new")
        );
    }

    // Ensures detach sends only a graceful disconnect and clears ownership.
    #[test]
    fn detach_disconnects_and_never_closes() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = spawn_active(&mut orch, &mut rx, "keep");

        assert!(orch.detach(&id).expect("detach"));
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].payload, ClientPayload::Disconnect(h) if h.connection_handle == "h-keep"));

        let detached = session(&orch, &id);
        assert_eq!(detached.lifecycle_state, LifecycleState::Detached);
        assert!(detached.owner_window_id.is_none());
        assert!(detached.connection_handle.is_none());
        assert!(detached.last_active_at.is_some());
        assert_eq!(detached.multiplexer_session_name.as_deref(), Some("keep"));
        assert_eq!(detached.tool_type, "bash");
    }

    // Ensures a split binds only once both panes have acknowledged.
    #[test]
    fn split_binds_and_reattaches_as_a_unit() {
        let (mut orch, mut rx) = orchestrator("A");
        let mut tfe = SpawnOptions::new("tfe");
        tfe.multiplexer_session_name = Some("S".into());
        let container = orch
            .spawn_split(
                SplitOrientation::Vertical,
                PaneSource::Spawn(tfe),
                PaneSource::Attach {
                    tool_type: "bash".into(),
                    multiplexer_session_name: "S".into(),
                    geometry: None,
                },
            )
            .expect("split");
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].payload, ClientPayload::Spawn(_)));
        assert!(matches!(sent[1].payload, ClientPayload::Reconnect(_)));
        let family = orch.replicator().store().family_of(&container);
        let (p1, p2) = (family[1].clone(), family[2].clone());

        orch.handle_server(ack(sent[0].correlation_id.as_deref(), "S", "h-1", Some("tfe")));
        assert!(session(&orch, &p1).connection_handle.is_none());
        assert_eq!(session(&orch, &container).lifecycle_state, LifecycleState::Spawning);

        orch.handle_server(ack(sent[1].correlation_id.as_deref(), "S", "h-2", None));
        for id in [&container, &p1, &p2] {
            assert_eq!(session(&orch, id).lifecycle_state, LifecycleState::Active);
        }

        assert!(orch.detach(&p2).expect("detach pane"));
        let disconnects = drain(&mut rx);
        assert_eq!(disconnects.len(), 2);
        for id in [&container, &p1, &p2] {
            let member = session(&orch, id);
            assert_eq!(member.lifecycle_state, LifecycleState::Detached);
            assert!(member.owner_window_id.is_none());
        }

        let root = orch.reattach(&p1).expect("reattach pane");
        assert_eq!(root, container);
        let reconnects = drain(&mut rx);
        assert_eq!(reconnects.len(), 2);
        for message in &reconnects {
            assert!(matches!(&message.payload, ClientPayload::Reconnect(r) if r.multiplexer_session_name == "S"));
        }
        for id in [&container, &p1, &p2] {
            let member = session(&orch, id);
            assert_eq!(member.lifecycle_state, LifecycleState::Spawning);
            assert_eq!(member.owner_window_id.as_deref(), Some("A"));
        }
        assert_eq!(session(&orch, &p1).tool_type, "tfe");
        assert_eq!(session(&orch, &p2).tool_type, "bash");
    }

    // Ensures one pane failing puts the whole split into error and releases the sibling.
    #[test]
    fn failed_pane_fails_family_and_releases_sibling() {
        let (mut orch, mut rx) = orchestrator("A");
        let container = orch
            .spawn_split(
                SplitOrientation::Horizontal,
                PaneSource::Spawn(SpawnOptions::new("bash")),
                PaneSource::Spawn(SpawnOptions::new("python")),
            )
            .expect("split");
        let sent = drain(&mut rx);
        orch.handle_server(ack(sent[0].correlation_id.as_deref(), "one", "h-1", Some("bash")));
        orch.handle_server(ServerMessage::error(
            sent[1].correlation_id.clone(),
            ErrorCode::Internal,
            "tmux exploded",
        ));

        let released = drain(&mut rx);
        assert!(matches!(&released[..], [m] if matches!(&m.payload, ClientPayload::Disconnect(h) if h.connection_handle == "h-1")));
        for id in orch.replicator().store().family_of(&container) {
            let member = session(&orch, &id);
            assert_eq!(member.lifecycle_state, LifecycleState::Error);
            assert!(member.connection_handle.is_none());
        }
        assert!(orch
            .take_effects()
            .iter()
            .any(|effect| matches!(effect, Effect::Notice { message, .. } if message.contains("tmux exploded"))));
    }

    // Ensures a timeout moves the tab to error with a specific message.
    #[test]
    fn timeout_is_reported_and_not_retried() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        drain(&mut rx);

        orch.tick(Instant::now());
        assert_eq!(session(&orch, &id).lifecycle_state, LifecycleState::Spawning);

        orch.tick(Instant::now() + DEFAULT_ACK_TIMEOUT);
        let failed = session(&orch, &id);
        assert_eq!(failed.lifecycle_state, LifecycleState::Error);
        let message = failed.error_message.clone().expect("error message");
        assert!(message.contains("could not be reattached"), "got: {message}");
        assert!(drain(&mut rx).is_empty(), "no automatic retry");
    }

    // Ensures a rejected spawn leaves no tab behind.
    #[test]
    fn already_exists_rejection_removes_the_tab() {
        let (mut orch, mut rx) = orchestrator("A");
        let mut named = SpawnOptions::new("bash");
        named.multiplexer_session_name = Some("taken".into());
        let id = orch.spawn(named).expect("spawn");
        let correlation = only_correlation(&drain(&mut rx));

        orch.handle_server(ServerMessage::error(Some(correlation), ErrorCode::AlreadyExists, "taken"));
        assert!(!orch.replicator().store().contains(&id));
        assert!(orch
            .take_effects()
            .iter()
            .any(|effect| matches!(effect, Effect::Notice { message, .. } if message.contains("already exists"))));
    }

    // Ensures a revocation detaches the tab locally.
    #[test]
    fn revocation_detaches_owned_tab() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = spawn_active(&mut orch, &mut rx, "shared");
        orch.handle_server(ServerMessage::new(ServerPayload::OwnershipRevoked(OwnershipRevoked {
            connection_handle: "h-shared".into(),
            multiplexer_session_name: "shared".into(),
        })));
        let revoked = session(&orch, &id);
        assert_eq!(revoked.lifecycle_state, LifecycleState::Detached);
        assert!(revoked.owner_window_id.is_none());
        assert!(revoked.connection_handle.is_none());
        // The revoked handle is already gone server-side.
        assert!(drain(&mut rx).is_empty());
    }

    // Ensures processGone fails every tab this window holds on that name.
    #[test]
    fn process_gone_moves_sessions_to_error() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = spawn_active(&mut orch, &mut rx, "fragile");
        orch.handle_server(ServerMessage::new(ServerPayload::ProcessGone(ProcessGone {
            multiplexer_session_name: "fragile".into(),
            reason: "exited".into(),
        })));
        let gone = session(&orch, &id);
        assert_eq!(gone.lifecycle_state, LifecycleState::Error);
        assert!(gone.error_message.as_deref().is_some_and(|m| m.contains("process may have ended")));
        assert!(drain(&mut rx).is_empty(), "dead handles are not disconnected");
    }

    // Ensures close is destructive only through close requests and closed replies.
    #[test]
    fn close_sends_close_and_reply_marks_closed() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = spawn_active(&mut orch, &mut rx, "doomed");
        orch.close(&id).expect("close");
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].payload, ClientPayload::Close(req) if req.connection_handle.as_deref() == Some("h-doomed")));

        orch.handle_server(ServerMessage::new(ServerPayload::Closed(ClosedReply {
            multiplexer_session_name: "doomed".into(),
        })));
        assert_eq!(session(&orch, &id).lifecycle_state, LifecycleState::Closed);
        orch.forget(&id).expect("forget");
        assert!(!orch.replicator().store().contains(&id));
    }

    #[test]
    fn closing_unspawned_tab_is_local() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        drain(&mut rx);
        orch.close(&id).expect("close");
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session(&orch, &id).lifecycle_state, LifecycleState::Closed);
        assert_eq!(orch.pending().count(), 0);
    }

    #[test]
    fn output_is_routed_by_handle() {
        let (mut orch, mut rx) = orchestrator("A");
        let id = spawn_active(&mut orch, &mut rx, "out");
        orch.take_effects();
        orch.handle_server(ServerMessage::new(ServerPayload::Output(IoChunk {
            connection_handle: "h-out".into(),
            bytes: b"$ ".to_vec(),
        })));
        orch.handle_server(ServerMessage::new(ServerPayload::Output(IoChunk {
            connection_handle: "h-unknown".into(),
            bytes: b"lost".to_vec(),
        })));
        assert_eq!(
            orch.take_effects(),
            vec![Effect::Output {
                session_id: id,
                bytes: b"$ ".to_vec()
            }]
        );
    }

    // Ensures reconciliation imports only unknown, unowned multiplexer sessions.
    #[test]
    fn listing_imports_unknown_sessions_as_detached() {
        let (mut orch, mut rx) = orchestrator("A");
        spawn_active(&mut orch, &mut rx, "mine");
        orch.handle_server(ServerMessage::new(ServerPayload::SessionList(SessionList {
            sessions: vec![
                ListedSession { name: "mine".into(), owned: true },
                ListedSession { name: "busy".into(), owned: true },
                ListedSession { name: "stray".into(), owned: false },
            ],
        })));
        let imported: Vec<&Session> = orch
            .replicator()
            .store()
            .sessions()
            .filter(|session| session.tool_type == EXTERNAL_TOOL_TYPE)
            .collect();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].multiplexer_session_name.as_deref(), Some("stray"));
        assert!(imported[0].is_detached_candidate());
    }

    // Ensures tabs of a dead window become detached, never-spawned ones closed.
    #[test]
    fn orphans_of_dead_windows_are_released() {
        let (mut orch, _rx) = orchestrator("A");
        let live = Session::single("live", "bash")
            .with_owner(Some("gone"))
            .with_state(LifecycleState::Active)
            .with_mux_name("kept");
        let unspawned = Session::single("unspawned", "bash")
            .with_owner(Some("gone"))
            .with_state(LifecycleState::Spawning);
        let ours = Session::single("ours", "bash")
            .with_owner(Some("A"))
            .with_state(LifecycleState::Active)
            .with_mux_name("mine");
        orch.replicator_mut()
            .batch(|store| {
                store.add_session(live)?;
                store.add_session(unspawned)?;
                store.add_session(ours)
            })
            .expect("seed");

        let released = orch.release_orphans(&["A".to_string()]).expect("release");
        assert_eq!(released.len(), 2);
        assert!(session(&orch, "live").is_detached_candidate());
        assert_eq!(session(&orch, "unspawned").lifecycle_state, LifecycleState::Closed);
        assert_eq!(session(&orch, "ours").owner_window_id.as_deref(), Some("A"));
    }

    fn disconnected(sent: &[ClientMessage]) -> Vec<String> {
        sent.iter()
            .filter_map(|message| match &message.payload {
                ClientPayload::Disconnect(handle) => Some(handle.connection_handle.clone()),
                _ => None,
            })
            .collect()
    }

    // Ensures a repeated acknowledgment never rebinds, fails or disconnects
    // anything, while a settled correlation id carrying a fresh handle is
    // released.
    #[test]
    fn repeated_ack_leaves_bound_and_pending_tabs_alone() {
        let (mut orch, mut rx) = orchestrator("A");
        let first = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        let c1 = only_correlation(&drain(&mut rx));
        let original = ack(Some(&c1), "sess-a", "h-a", Some("bash"));
        orch.handle_server(original.clone());
        let second = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        drain(&mut rx);

        orch.handle_server(original);
        orch.handle_server(ack(None, "sess-a", "h-a", Some("bash")));
        assert!(drain(&mut rx).is_empty(), "the live handle stays connected");
        let bound = session(&orch, &first);
        assert_eq!(bound.lifecycle_state, LifecycleState::Active);
        assert_eq!(bound.connection_handle.as_deref(), Some("h-a"));
        let waiting = session(&orch, &second);
        assert_eq!(waiting.lifecycle_state, LifecycleState::Spawning);
        assert!(waiting.error_message.is_none());
        assert!(waiting.multiplexer_session_name.is_none());

        orch.handle_server(ack(Some(&c1), "sess-a", "h-dup", Some("bash")));
        assert_eq!(disconnected(&drain(&mut rx)), vec!["h-dup".to_string()]);
        assert_eq!(session(&orch, &second).lifecycle_state, LifecycleState::Spawning);
        assert_eq!(orch.pending().count(), 1);
    }

    // Ensures a closing window leaves nothing owned behind: connected and
    // named spawning tabs become detached, unnamed ones closed, and the late
    // ack of an abandoned spawn is released.
    #[test]
    fn relinquish_releases_spawning_tabs() {
        let (mut orch, mut rx) = orchestrator("A");
        let live = spawn_active(&mut orch, &mut rx, "live");
        let mut named = SpawnOptions::new("bash");
        named.multiplexer_session_name = Some("named".into());
        let waiting_named = orch.spawn(named).expect("spawn named");
        let late = only_correlation(&drain(&mut rx));
        let unnamed = orch.spawn(SpawnOptions::new("bash")).expect("spawn");
        drain(&mut rx);

        let released: BTreeSet<SessionId> = orch.relinquish_all().into_iter().collect();
        assert_eq!(
            released,
            BTreeSet::from([live.clone(), waiting_named.clone(), unnamed.clone()])
        );
        assert_eq!(disconnected(&drain(&mut rx)), vec!["h-live".to_string()]);
        assert!(session(&orch, &live).is_detached_candidate());
        assert!(session(&orch, &waiting_named).is_detached_candidate());
        let closed = session(&orch, &unnamed);
        assert_eq!(closed.lifecycle_state, LifecycleState::Closed);
        assert!(closed.owner_window_id.is_none());
        assert_eq!(orch.pending().count(), 0);

        orch.handle_server(ack(Some(&late), "named", "h-late", Some("bash")));
        assert_eq!(disconnected(&drain(&mut rx)), vec!["h-late".to_string()]);
        assert!(session(&orch, &waiting_named).is_detached_candidate());
    }

    // Ensures tabs of a sibling whose connection dropped become detached, and
    // the live window list only judges owners known when this window announced.
    #[test]
    fn gone_windows_release_their_tabs() {
        let (mut orch, mut rx) = orchestrator("A");
        let held = |id: &str, owner: &str| {
            Session::single(id, "bash")
                .with_owner(Some(owner))
                .with_state(LifecycleState::Active)
                .with_mux_name(format!("m-{id}"))
        };
        orch.replicator_mut()
            .batch(|store| {
                store.add_session(held("b1", "B"))?;
                store.add_session(held("c1", "C"))?;
                store.add_session(held("d1", "D"))
            })
            .expect("seed");
        orch.announce().expect("announce");
        let sent = drain(&mut rx);
        assert!(matches!(&sent[..], [m] if matches!(&m.payload, ClientPayload::Hello(h) if h.window_id == "A")));

        // E showed up after the announcement, so the reply cannot know it.
        orch.replicator_mut().add_session(held("e1", "E")).expect("late sibling");
        orch.handle_server(ServerMessage::new(ServerPayload::LiveWindows(LiveWindows {
            window_ids: vec!["A".into(), "C".into(), "D".into()],
        })));
        assert!(session(&orch, "b1").is_detached_candidate());
        assert_eq!(session(&orch, "c1").owner_window_id.as_deref(), Some("C"));
        assert_eq!(session(&orch, "e1").owner_window_id.as_deref(), Some("E"));

        orch.handle_server(ServerMessage::new(ServerPayload::WindowGone(WindowGone {
            window_id: "C".into(),
        })));
        assert!(session(&orch, "c1").is_detached_candidate());
        assert_eq!(session(&orch, "d1").lifecycle_state, LifecycleState::Active);
        assert!(drain(&mut rx).is_empty(), "a dead window's handles are not ours to release");
    }

    #[test]
    fn shared_session_panes_are_normalized_before_attach() {
        let (mut orch, mut rx) = orchestrator("A");
        let mut first = SpawnOptions::new("tfe");
        first.multiplexer_session_name = Some("S".into());
        first.geometry = Some(geometry(600.0, 480.0, 10.0));
        orch.spawn_split(
            SplitOrientation::Vertical,
            PaneSource::Spawn(first),
            PaneSource::Attach {
                tool_type: "bash".into(),
                multiplexer_session_name: "S".into(),
                geometry: Some(geometry(600.0, 480.0, 14.0)),
            },
        )
        .expect("split");

        let sent = drain(&mut rx);
        let sizes: Vec<Option<GridSize>> = sent
            .iter()
            .map(|message| match &message.payload {
                ClientPayload::Spawn(req) => req.size,
                ClientPayload::Reconnect(req) => req.size,
                other => panic!("unexpected request {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![Some(GridSize::new(100, 40)); 2]);
        assert!(orch
            .take_effects()
            .iter()
            .any(|effect| matches!(effect, Effect::Normalized { normalized, .. } if normalized.font_size < 14.0)));
    }

    #[cfg(feature = "fuzz-tests")]
    mod prop_tests {
        use super::*;
        use proptest::prelude::*;
        use tokio::sync::broadcast;

        #[derive(Debug, Clone)]
        enum Step {
            Spawn(usize),
            Split(usize),
            Answer(usize),
            Detach(usize, usize),
            Reattach(usize, usize),
            Close(usize, usize),
            Forget(usize, usize),
            Expire(usize),
            Gone(usize),
            Replay(usize, usize),
            Shutdown(usize),
        }

        fn step() -> impl Strategy<Value = Step> {
            let pick = (0usize..2, 0usize..8);
            prop_oneof![
                2 => (0usize..2).prop_map(Step::Spawn),
                2 => (0usize..2).prop_map(Step::Split),
                3 => (0usize..2).prop_map(Step::Answer),
                2 => pick.clone().prop_map(|(w, i)| Step::Detach(w, i)),
                2 => pick.clone().prop_map(|(w, i)| Step::Reattach(w, i)),
                1 => pick.clone().prop_map(|(w, i)| Step::Close(w, i)),
                2 => pick.clone().prop_map(|(w, i)| Step::Replay(w, i)),
                1 => pick.prop_map(|(w, i)| Step::Forget(w, i)),
                1 => (0usize..2).prop_map(Step::Shutdown),
                1 => (0usize..2).prop_map(Step::Expire),
                1 => (0usize..8).prop_map(Step::Gone),
            ]
        }

        /// Two windows on one bus with a scripted gateway that answers every
        /// queued request when told to.
        struct Pair {
            windows: Vec<Orchestrator>,
            links: Vec<mpsc::UnboundedReceiver<ClientMessage>>,
            feeds: Vec<broadcast::Receiver<String>>,
            queued: Vec<Vec<ClientMessage>>,
            /// Every ack delivered to each window, for replays.
            acks: Vec<Vec<ServerMessage>>,
            /// Disconnects sent for a handle the sender still had bound.
            bound_releases: Vec<String>,
            names_by_handle: HashMap<String, String>,
            next: u32,
        }

        impl Pair {
            fn new() -> Self {
                let bus = LocalBus::new(256);
                let mut pair = Pair {
                    windows: Vec::new(),
                    links: Vec::new(),
                    feeds: Vec::new(),
                    queued: vec![Vec::new(), Vec::new()],
                    acks: vec![Vec::new(), Vec::new()],
                    bound_releases: Vec::new(),
                    names_by_handle: HashMap::new(),
                    next: 0,
                };
                for window in ["A", "B"] {
                    let (tx, rx) = mpsc::unbounded_channel();
                    pair.feeds.push(bus.subscribe());
                    let replicator = Replicator::new(
                        window,
                        SessionStore::with_policy(InvariantPolicy::Normalize),
                        None,
                        Box::new(bus.clone()),
                    );
                    pair.windows
                        .push(Orchestrator::new(replicator, Box::new(tx), DEFAULT_ACK_TIMEOUT));
                    pair.links.push(rx);
                }
                pair
            }

            fn settle(&mut self, w: usize) {
                let sent = drain(&mut self.links[w]);
                let store = self.windows[w].replicator().store();
                for message in &sent {
                    if let ClientPayload::Disconnect(handle) = &message.payload {
                        if store.find_by_handle(&handle.connection_handle).is_some() {
                            self.bound_releases.push(handle.connection_handle.clone());
                        }
                    }
                }
                self.queued[w].extend(sent);
                for (window, feed) in self.windows.iter_mut().zip(self.feeds.iter_mut()) {
                    while let Ok(raw) = feed.try_recv() {
                        let _ = window.replicator_mut().receive(&raw);
                    }
                }
            }

            fn target(&self, w: usize, index: usize) -> Option<SessionId> {
                let ids: Vec<SessionId> = self.windows[w]
                    .replicator()
                    .store()
                    .sessions()
                    .filter(|session| !session.is_hidden_pane)
                    .map(|session| session.id.clone())
                    .collect();
                (!ids.is_empty()).then(|| ids[index % ids.len()].clone())
            }

            fn answer(&mut self, w: usize) {
                for request in std::mem::take(&mut self.queued[w]) {
                    let correlation_id = request.correlation_id.clone();
                    let payload = match request.payload {
                        ClientPayload::Spawn(req) => {
                            self.next += 1;
                            let name = req
                                .multiplexer_session_name
                                .unwrap_or_else(|| format!("gen-{}", self.next));
                            self.spawned(name, Some(req.tool_type))
                        }
                        ClientPayload::Reconnect(req) => {
                            self.next += 1;
                            self.spawned(req.multiplexer_session_name, None)
                        }
                        ClientPayload::Close(req) => {
                            let name = req.multiplexer_session_name.or_else(|| {
                                req.connection_handle
                                    .and_then(|handle| self.names_by_handle.get(&handle).cloned())
                            });
                            match name {
                                Some(name) => ServerPayload::Closed(ClosedReply {
                                    multiplexer_session_name: name,
                                }),
                                None => continue,
                            }
                        }
                        _ => continue,
                    };
                    let message = ServerMessage {
                        correlation_id,
                        payload,
                    };
                    if matches!(message.payload, ServerPayload::Spawned(_)) {
                        self.acks[w].push(message.clone());
                    }
                    self.windows[w].handle_server(message);
                    self.settle(w);
                }
                // Disconnects for stale acks need no answer.
                self.queued[w].clear();
            }

            fn spawned(&mut self, name: String, tool_type: Option<String>) -> ServerPayload {
                let handle = format!("h-{}", self.next);
                self.names_by_handle.insert(handle.clone(), name.clone());
                ServerPayload::Spawned(Spawned {
                    multiplexer_session_name: name,
                    connection_handle: handle,
                    tool_type,
                })
            }

            fn gone(&mut self, index: usize) {
                let names: BTreeSet<String> = self.windows[0]
                    .replicator()
                    .store()
                    .sessions()
                    .filter(|session| session.lifecycle_state != LifecycleState::Closed)
                    .filter_map(|session| session.multiplexer_session_name.clone())
                    .collect();
                let Some(name) = names.iter().nth(index % names.len().max(1)).cloned() else {
                    return;
                };
                for w in 0..2 {
                    self.windows[w].handle_server(ServerMessage::new(ServerPayload::ProcessGone(
                        ProcessGone {
                            multiplexer_session_name: name.clone(),
                            reason: "exited".into(),
                        },
                    )));
                    self.settle(w);
                }
            }

            fn replay(&mut self, w: usize, index: usize) {
                let Some(message) = self.acks[w].get(index % self.acks[w].len().max(1)).cloned() else {
                    return;
                };
                self.windows[w].handle_server(message);
                self.settle(w);
            }

            /// The window closes and comes back under the same id; whatever the
            /// gateway still owed the old connection is lost with it.
            fn shutdown(&mut self, w: usize) {
                self.windows[w].relinquish_all();
                self.settle(w);
                self.queued[w].clear();
            }

            fn run(&mut self, step: Step) {
                let w = match step {
                    Step::Replay(w, index) => return self.replay(w, index),
                    Step::Shutdown(w) => return self.shutdown(w),
                    Step::Spawn(w) | Step::Split(w) | Step::Answer(w) | Step::Expire(w) => w,
                    Step::Detach(w, _) | Step::Reattach(w, _) | Step::Close(w, _) | Step::Forget(w, _) => w,
                    Step::Gone(index) => return self.gone(index),
                };
                let target = match step {
                    Step::Detach(_, i) | Step::Reattach(_, i) | Step::Close(_, i) | Step::Forget(_, i) => {
                        match self.target(w, i) {
                            Some(id) => id,
                            None => return,
                        }
                    }
                    _ => String::new(),
                };
                let orch = &mut self.windows[w];
                match step {
                    Step::Spawn(_) => {
                        let _ = orch.spawn(SpawnOptions::new("bash"));
                    }
                    Step::Split(_) => {
                        let _ = orch.spawn_split(
                            SplitOrientation::Horizontal,
                            PaneSource::Spawn(SpawnOptions::new("tfe")),
                            PaneSource::Spawn(SpawnOptions::new("bash")),
                        );
                    }
                    Step::Answer(_) => return self.answer(w),
                    Step::Detach(..) => {
                        let _ = orch.detach(&target);
                    }
                    Step::Reattach(..) => {
                        let _ = orch.reattach(&target);
                    }
                    Step::Close(..) => {
                        let _ = orch.close(&target);
                    }
                    Step::Forget(..) => {
                        let _ = orch.forget(&target);
                    }
                    Step::Expire(_) => orch.tick(Instant::now() + DEFAULT_ACK_TIMEOUT + Duration::from_secs(1)),
                    Step::Gone(_) | Step::Replay(..) | Step::Shutdown(_) => {}
                }
                self.settle(w);
            }
        }

        proptest! {
            // Ensures any interleaving of intents, repeated acks and window
            // closes keeps both windows' tables identical, splits moving as a
            // unit, shared tabs detached and live handles connected.
            #[test]
            fn windows_converge_and_keep_table_invariants(steps in prop::collection::vec(step(), 1..40)) {
                let mut pair = Pair::new();
                for step in steps {
                    let closed = match step {
                        Step::Shutdown(w) => Some(["A", "B"][w]),
                        _ => None,
                    };
                    pair.run(step);
                    prop_assert!(pair.bound_releases.is_empty(), "released bound handles {:?}", pair.bound_releases);

                    let a = pair.windows[0].replicator().store();
                    let b = pair.windows[1].replicator().store();
                    prop_assert_eq!(a.table(), b.table());
                    prop_assert!(crate::store::invariants::check(a.table()).is_empty());
                    if let Some(window) = closed {
                        prop_assert!(a.sessions().all(|session| {
                            session.lifecycle_state == LifecycleState::Closed
                                || session.owner_window_id.as_deref() != Some(window)
                        }), "window {} still owns a live session after shutdown", window);
                    }

                    let in_b: BTreeSet<&str> = a.list_visible("B").iter().map(|s| s.id.as_str()).collect();
                    for shared in a.list_visible("A").into_iter().filter(|s| in_b.contains(s.id.as_str())) {
                        prop_assert_eq!(shared.lifecycle_state, LifecycleState::Detached);
                        prop_assert!(shared.owner_window_id.is_none());
                    }

                    let mut handles = BTreeSet::new();
                    for session in a.sessions() {
                        if session.owner_window_id.is_none() {
                            prop_assert!(!matches!(
                                session.lifecycle_state,
                                LifecycleState::Active | LifecycleState::Spawning
                            ));
                        }
                        if let Some(handle) = &session.connection_handle {
                            prop_assert!(handles.insert(handle.clone()), "handle {} bound twice", handle);
                        }
                        if let Some(layout) = session.split_layout.as_ref().filter(|_| session.is_container()) {
                            for pane_id in layout.pane_ids() {
                                let pane = a.get(pane_id);
                                prop_assert!(pane.is_some());
                                let pane = pane.unwrap();
                                prop_assert_eq!(&pane.owner_window_id, &session.owner_window_id);
                                prop_assert_eq!(pane.lifecycle_state, session.lifecycle_state);
                            }
                        }
                    }
                }
            }
        }
    }
}
