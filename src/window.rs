//! One UI window's cooperative event loop.
//!
//! The window task owns the orchestrator (and through it the replicator and
//! store). Everything that touches them arrives on one `select!` loop:
//! commands from the UI, gateway pushes, broadcasts from sibling windows and a
//! periodic tick for acknowledgment timeouts. Store mutations therefore run in
//! call order and never block on I/O.

use crate::client::GatewayClient;
use crate::error::SessionError;
use crate::model::{Session, SessionId, SplitOrientation, WindowId};
use crate::normalizer::{Normalized, PaneGeometry};
use crate::orchestrator::{Effect, Orchestrator, PaneSource, SpawnOptions, DEFAULT_ACK_TIMEOUT};
use crate::protocol::ServerMessage;
use crate::replicator::{BroadcastChannel, Received, Replicator};
use crate::store::{InvariantPolicy, SessionStore, TableFile};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Bootstrap inputs for a window.
pub struct WindowConfig {
    pub window_id: WindowId,
    pub ack_timeout: Duration,
    pub tick_interval: Duration,
    /// Persisted table shared by every window of this user.
    pub table_file: Option<TableFile>,
    pub policy: InvariantPolicy,
    /// Ask the gateway for unknown multiplexer sessions at startup.
    pub reconcile_on_start: bool,
}

impl WindowConfig {
    pub fn new(window_id: impl Into<WindowId>) -> Self {
        Self {
            window_id: window_id.into(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            tick_interval: Duration::from_millis(500),
            table_file: None,
            policy: InvariantPolicy::default(),
            reconcile_on_start: false,
        }
    }
}

/// What the UI sees of this window right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub window_id: WindowId,
    pub revision: u64,
    pub focus: Option<SessionId>,
    /// `listVisible` order: owned tabs, then detached candidates.
    pub visible: Vec<Session>,
}

/// Pushed to the UI as the window's state evolves.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowEvent {
    TableChanged { revision: u64 },
    Output { session_id: SessionId, bytes: Vec<u8> },
    Notice { session_id: Option<SessionId>, message: String },
    Normalized { session_id: SessionId, normalized: Normalized },
    Imported { session_ids: Vec<SessionId> },
    /// The gateway connection ended; live tabs can no longer do I/O.
    LinkLost,
}

impl From<Effect> for WindowEvent {
    fn from(effect: Effect) -> Self {
        match effect {
            Effect::Output { session_id, bytes } => Self::Output { session_id, bytes },
            Effect::Notice { session_id, message } => Self::Notice { session_id, message },
            Effect::Normalized {
                session_id,
                normalized,
            } => Self::Normalized {
                session_id,
                normalized,
            },
            Effect::Imported { session_ids } => Self::Imported { session_ids },
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum WindowCommand {
    Spawn(SpawnOptions, Reply<SessionId>),
    SpawnSplit(SplitOrientation, PaneSource, PaneSource, Reply<SessionId>),
    Reattach(SessionId, Reply<SessionId>),
    Respawn(SessionId, Reply<SessionId>),
    Detach(SessionId, Reply<bool>),
    Close(SessionId, Reply<()>),
    Forget(SessionId, Reply<()>),
    Input(SessionId, Vec<u8>, Reply<()>),
    Resize(SessionId, PaneGeometry, Reply<()>),
    Focus(SessionId, Reply<()>),
    Reconcile(Reply<()>),
    Snapshot(oneshot::Sender<WindowSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running window task.
#[derive(Clone)]
pub struct WindowHandle {
    window_id: WindowId,
    commands: mpsc::Sender<WindowCommand>,
}

/// Event stream returned by [`spawn_window`].
pub type WindowEvents = mpsc::UnboundedReceiver<WindowEvent>;

impl WindowHandle {
    pub fn window_id(&self) -> &str {
        &self.window_id
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> WindowCommand) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| SessionError::Link("window has shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| SessionError::Link("window dropped the request".into()))?
    }

    pub async fn spawn(&self, options: SpawnOptions) -> Result<SessionId, SessionError> {
        self.call(|reply| WindowCommand::Spawn(options, reply)).await
    }

    pub async fn spawn_split(
        &self,
        orientation: SplitOrientation,
        first: PaneSource,
        second: PaneSource,
    ) -> Result<SessionId, SessionError> {
        self.call(|reply| WindowCommand::SpawnSplit(orientation, first, second, reply))
            .await
    }

    pub async fn reattach(&self, id: &str) -> Result<SessionId, SessionError> {
        self.call(|reply| WindowCommand::Reattach(id.to_string(), reply)).await
    }

    pub async fn respawn(&self, id: &str) -> Result<SessionId, SessionError> {
        self.call(|reply| WindowCommand::Respawn(id.to_string(), reply)).await
    }

    pub async fn detach(&self, id: &str) -> Result<bool, SessionError> {
        self.call(|reply| WindowCommand::Detach(id.to_string(), reply)).await
    }

    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        self.call(|reply| WindowCommand::Close(id.to_string(), reply)).await
    }

    pub async fn forget(&self, id: &str) -> Result<(), SessionError> {
        self.call(|reply| WindowCommand::Forget(id.to_string(), reply)).await
    }

    pub async fn send_input(&self, id: &str, bytes: impl Into<Vec<u8>>) -> Result<(), SessionError> {
        let bytes = bytes.into();
        self.call(|reply| WindowCommand::Input(id.to_string(), bytes, reply))
            .await
    }

    pub async fn resize(&self, id: &str, geometry: PaneGeometry) -> Result<(), SessionError> {
        self.call(|reply| WindowCommand::Resize(id.to_string(), geometry, reply))
            .await
    }

    pub async fn focus(&self, id: &str) -> Result<(), SessionError> {
        self.call(|reply| WindowCommand::Focus(id.to_string(), reply)).await
    }

    /// Import multiplexer sessions no tab knows about yet.
    pub async fn reconcile(&self) -> Result<(), SessionError> {
        self.call(WindowCommand::Reconcile).await
    }

    pub async fn snapshot(&self) -> Result<WindowSnapshot, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(WindowCommand::Snapshot(reply_tx))
            .await
            .map_err(|_| SessionError::Link("window has shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| SessionError::Link("window dropped the request".into()))
    }

    /// Close the window cleanly: every tab it owns is detached (never
    /// closed) so other windows can pick it up, including tabs still waiting
    /// for the gateway.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(WindowCommand::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Build the window's state and run its loop in the background.
///
/// `channel` publishes this window's snapshots; `incoming` receives every
/// window's snapshots (this one's own echoes are ignored).
pub fn spawn_window(
    config: WindowConfig,
    client: GatewayClient,
    channel: Box<dyn BroadcastChannel>,
    incoming: broadcast::Receiver<String>,
) -> Result<(WindowHandle, WindowEvents, JoinHandle<()>), SessionError> {
    let store = SessionStore::with_policy(config.policy);
    let replicator = match config.table_file {
        Some(file) => Replicator::load(config.window_id.clone(), store, file, channel)?,
        None => Replicator::new(config.window_id.clone(), store, None, channel),
    };
    let (link, server) = client.split();
    let mut orchestrator = Orchestrator::new(replicator, Box::new(link), config.ack_timeout);
    // Anything this id held before starting died with the previous run. The
    // gateway's reply to the announcement releases what dead siblings held.
    orchestrator.release_window(&config.window_id)?;
    orchestrator.announce()?;
    if config.reconcile_on_start {
        orchestrator.request_listing()?;
    }

    let (command_tx, command_rx) = mpsc::channel::<WindowCommand>(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<WindowEvent>();
    let window = WindowLoop {
        orchestrator,
        events: event_tx,
        last_revision: 0,
    };
    let task = tokio::spawn(window.run(command_rx, server, incoming, config.tick_interval));
    info!(window = %config.window_id, "window started");
    Ok((
        WindowHandle {
            window_id: config.window_id,
            commands: command_tx,
        },
        event_rx,
        task,
    ))
}

fn snapshot_of(orchestrator: &Orchestrator) -> WindowSnapshot {
    let replicator = orchestrator.replicator();
    let window_id = replicator.window_id().to_string();
    WindowSnapshot {
        visible: replicator
            .store()
            .list_visible(&window_id)
            .into_iter()
            .cloned()
            .collect(),
        focus: replicator.focus().map(str::to_string),
        revision: replicator.revision(),
        window_id,
    }
}

struct WindowLoop {
    orchestrator: Orchestrator,
    events: mpsc::UnboundedSender<WindowEvent>,
    last_revision: u64,
}

impl WindowLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<WindowCommand>,
        mut server: mpsc::UnboundedReceiver<ServerMessage>,
        mut incoming: broadcast::Receiver<String>,
        tick_interval: Duration,
    ) {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut link_open = true;
        let mut bus_open = true;
        self.flush();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WindowCommand::Shutdown(done)) => {
                        self.detach_all();
                        self.flush();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.detach_all();
                        break;
                    }
                },
                message = server.recv(), if link_open => match message {
                    Some(message) => self.orchestrator.handle_server(message),
                    None => {
                        warn!(window = %self.orchestrator.replicator().window_id(), "gateway link lost");
                        link_open = false;
                        let _ = self.events.send(WindowEvent::LinkLost);
                    }
                },
                raw = incoming.recv(), if bus_open => match raw {
                    Ok(raw) => self.apply_broadcast(&raw),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The next snapshot carries the whole table again.
                        warn!(skipped, "broadcast receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => bus_open = false,
                },
                _ = ticker.tick() => self.orchestrator.tick(Instant::now()),
            }
            self.flush();
        }
        info!(window = %self.orchestrator.replicator().window_id(), "window stopped");
    }

    fn handle_command(&mut self, command: WindowCommand) {
        let orch = &mut self.orchestrator;
        match command {
            WindowCommand::Spawn(options, reply) => {
                let _ = reply.send(orch.spawn(options));
            }
            WindowCommand::SpawnSplit(orientation, first, second, reply) => {
                let _ = reply.send(orch.spawn_split(orientation, first, second));
            }
            WindowCommand::Reattach(id, reply) => {
                let _ = reply.send(orch.reattach(&id));
            }
            WindowCommand::Respawn(id, reply) => {
                let _ = reply.send(orch.respawn(&id));
            }
            WindowCommand::Detach(id, reply) => {
                let _ = reply.send(orch.detach(&id));
            }
            WindowCommand::Close(id, reply) => {
                let _ = reply.send(orch.close(&id));
            }
            WindowCommand::Forget(id, reply) => {
                let _ = reply.send(orch.forget(&id));
            }
            WindowCommand::Input(id, bytes, reply) => {
                let _ = reply.send(orch.send_input(&id, bytes));
            }
            WindowCommand::Resize(id, geometry, reply) => {
                let _ = reply.send(orch.resize(&id, geometry));
            }
            WindowCommand::Focus(id, reply) => {
                let _ = reply.send(orch.replicator_mut().set_focus(&id));
            }
            WindowCommand::Reconcile(reply) => {
                let _ = reply.send(orch.request_listing());
            }
            WindowCommand::Snapshot(reply) => {
                let _ = reply.send(snapshot_of(orch));
            }
            WindowCommand::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn apply_broadcast(&mut self, raw: &str) {
        match self.orchestrator.replicator_mut().receive(raw) {
            Ok(Received::OwnEcho) => {}
            Ok(Received::Applied { from, repaired }) => {
                debug!(%from, repaired = repaired.len(), "sibling snapshot applied");
            }
            // Already logged; the local table is untouched.
            Err(_) => {}
        }
    }

    /// Let go of every tab this window holds; nothing is killed.
    fn detach_all(&mut self) {
        let released = self.orchestrator.relinquish_all();
        debug!(count = released.len(), "window let go of its tabs");
    }

    /// Push effects and table changes to the UI.
    fn flush(&mut self) {
        for effect in self.orchestrator.take_effects() {
            let _ = self.events.send(effect.into());
        }
        let revision = self.orchestrator.replicator().revision();
        if revision != self.last_revision {
            self.last_revision = revision;
            let _ = self.events.send(WindowEvent::TableChanged { revision });
        }
    }
}
