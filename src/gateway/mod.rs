//! Connection gateway: the backend windows connect to.
//!
//! Connections speak newline-delimited JSON (`protocol`). A single actor task
//! owns the [`SessionRegistry`]; connection tasks, attachment forwarders and
//! multiplexer calls only post events to it. Slow multiplexer work (create,
//! attach, kill, list) runs in spawned tasks whose completions come back as
//! events, so one stuck tmux call never stalls routing for everyone else.

pub mod registry;

use crate::error::MuxError;
use crate::protocol::{
    decode_line, encode_line, ClientMessage, ClientPayload, CloseRequest, ClosedReply, ErrorCode,
    GridSize, IoChunk, LiveWindows, OwnershipRevoked, ProcessGone, ReconnectRequest,
    ResizeRequest, ServerMessage, ServerPayload, SessionList, SpawnRequest, Spawned, WindowGone,
    WindowHello,
};
use crate::tmux::naming::{generate_session_name, is_valid_session_name};
use crate::tmux::{AttachEvent, AttachInput, Attachment, Multiplexer};
use registry::{ConnectionId, OutputRoute, RegistryError, SessionRegistry};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use registry::OutputBuffer;

/// Runtime knobs for the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Per-session cap on output buffered while nobody owns it.
    pub output_buffer_bytes: usize,
    /// Period of the registry/multiplexer reconciliation pass; `None` disables it.
    pub reconcile_interval: Option<Duration>,
    /// Prefix for generated multiplexer session names.
    pub session_prefix: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            output_buffer_bytes: 256 * 1024,
            reconcile_interval: Some(Duration::from_secs(30)),
            session_prefix: "tabmux".to_string(),
        }
    }
}

/// Running gateway spawned by [`spawn_gateway`].
pub struct GatewayHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every attachment. Multiplexer sessions survive.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "gateway task ended abnormally");
        }
    }
}

/// Bind `listen` and run the gateway in the background.
pub async fn spawn_gateway(
    listen: &str,
    mux: Arc<dyn Multiplexer>,
    settings: GatewaySettings,
) -> std::io::Result<GatewayHandle> {
    let listener = TcpListener::bind(listen).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(serve(listener, mux, settings, shutdown_rx));
    Ok(GatewayHandle {
        local_addr,
        shutdown: shutdown_tx,
        task,
    })
}

/// Serve connections on `listener` until `shutdown` flips (or its sender drops).
pub async fn serve(
    listener: TcpListener,
    mux: Arc<dyn Multiplexer>,
    settings: GatewaySettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let mut reconcile = settings.reconcile_interval.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut actor = GatewayActor::new(mux, settings, event_tx.clone());
    let mut next_connection: ConnectionId = 1;
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "gateway listening"),
        Err(e) => warn!(error = %e, "gateway listening on unknown address"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection = next_connection;
                    next_connection += 1;
                    debug!(connection, %peer, "accepted connection");
                    spawn_connection(connection, stream, event_tx.clone());
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(event) = event_rx.recv() => actor.handle(event),
            _ = tick(&mut reconcile) => actor.start_reconcile(),
            _ = shutdown.changed() => break,
        }
    }
    info!(sessions = actor.registry.len(), "gateway stopping; multiplexer sessions stay alive");
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Per-connection reader and writer tasks.
fn spawn_connection(connection: ConnectionId, stream: TcpStream, events: mpsc::UnboundedSender<Event>) {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let _ = events.send(Event::Connected {
        connection,
        outbound: outbound_tx,
    });

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!(connection, error = %e, "failed to encode server message");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                debug!(connection, error = %e, "connection write failed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let event = match decode_line::<ClientMessage>(&line) {
                        Ok(message) => Event::Request {
                            connection,
                            message,
                        },
                        Err(e) => Event::Malformed {
                            connection,
                            detail: e.to_string(),
                        },
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(connection, error = %e, "connection read failed");
                    break;
                }
            }
        }
        let _ = events.send(Event::Disconnected { connection });
    });
}

/// Forward one attachment's events into the actor, tagged with its generation.
fn spawn_forwarder(
    name: String,
    generation: u64,
    mut attach_events: mpsc::Receiver<AttachEvent>,
    events: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let reason = loop {
            match attach_events.recv().await {
                Some(AttachEvent::Output(bytes)) => {
                    let _ = events.send(Event::Output {
                        name: name.clone(),
                        generation,
                        bytes,
                    });
                }
                Some(AttachEvent::Exited(reason)) => break reason,
                None => break "attachment closed".to_string(),
            }
        };
        let _ = events.send(Event::AttachmentExited {
            name,
            generation,
            reason,
        });
    });
}

/// Failure reported back to a requesting window.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Failure {
    code: ErrorCode,
    reason: String,
}

impl Failure {
    fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl From<MuxError> for Failure {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::SessionMissing(name) => Self::new(
                ErrorCode::ProcessGone,
                format!("multiplexer session {name} is gone; process may have ended"),
            ),
            other => Self::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

impl From<RegistryError> for Failure {
    fn from(e: RegistryError) -> Self {
        let code = match e {
            RegistryError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            RegistryError::NotFound(_) | RegistryError::NotOwner(_) => ErrorCode::NotFound,
        };
        Self::new(code, e.to_string())
    }
}

/// A connection waiting for an attachment to `name` to come up.
#[derive(Debug, Clone)]
struct Waiter {
    connection: ConnectionId,
    correlation_id: Option<String>,
    tool_type: Option<String>,
    size: Option<GridSize>,
}

enum Event {
    Connected {
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Request {
        connection: ConnectionId,
        message: ClientMessage,
    },
    Malformed {
        connection: ConnectionId,
        detail: String,
    },
    Disconnected {
        connection: ConnectionId,
    },
    Output {
        name: String,
        generation: u64,
        bytes: Vec<u8>,
    },
    AttachmentExited {
        name: String,
        generation: u64,
        reason: String,
    },
    Attached {
        name: String,
        result: Result<Attachment, Failure>,
    },
    Closed {
        connection: ConnectionId,
        correlation_id: Option<String>,
        name: String,
        result: Result<(), Failure>,
    },
    Listed {
        connection: ConnectionId,
        correlation_id: Option<String>,
        result: Result<Vec<String>, Failure>,
    },
    ExitChecked {
        name: String,
        generation: u64,
        reason: String,
        still_exists: Result<bool, Failure>,
    },
    Reconciled {
        result: Result<Vec<String>, Failure>,
    },
}

struct GatewayActor {
    registry: SessionRegistry,
    mux: Arc<dyn Multiplexer>,
    settings: GatewaySettings,
    events: mpsc::UnboundedSender<Event>,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerMessage>>,
    /// Window id announced on each connection by `hello`.
    windows: HashMap<ConnectionId, String>,
    /// Connections queued behind an in-flight spawn or attach, per name.
    waiters: HashMap<String, Vec<Waiter>>,
    /// Names with a kill in flight; their attachment exit is expected.
    closing: HashSet<String>,
    reconciling: bool,
}

impl GatewayActor {
    fn new(mux: Arc<dyn Multiplexer>, settings: GatewaySettings, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            registry: SessionRegistry::new(settings.output_buffer_bytes),
            mux,
            settings,
            events,
            connections: HashMap::new(),
            windows: HashMap::new(),
            waiters: HashMap::new(),
            closing: HashSet::new(),
            reconciling: false,
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Connected {
                connection,
                outbound,
            } => {
                self.connections.insert(connection, outbound);
            }
            Event::Request {
                connection,
                message,
            } => self.handle_request(connection, message),
            Event::Malformed { connection, detail } => {
                warn!(connection, %detail, "dropping malformed request");
                self.send(
                    connection,
                    ServerMessage::error(None, ErrorCode::InvalidRequest, detail),
                );
            }
            Event::Disconnected { connection } => {
                self.connections.remove(&connection);
                let released = self.registry.release_connection(connection);
                info!(connection, released = released.len(), "connection closed");
                self.forget_window(connection);
            }
            Event::Output {
                name,
                generation,
                bytes,
            } => self.route_output(&name, generation, bytes),
            Event::AttachmentExited {
                name,
                generation,
                reason,
            } => self.check_exit(name, generation, reason),
            Event::Attached { name, result } => self.finish_attach(name, result),
            Event::Closed {
                connection,
                correlation_id,
                name,
                result,
            } => self.finish_close(connection, correlation_id, name, result),
            Event::Listed {
                connection,
                correlation_id,
                result,
            } => {
                let message = match result {
                    Ok(names) => ServerMessage {
                        correlation_id,
                        payload: ServerPayload::SessionList(SessionList {
                            sessions: self.registry.listing(&names),
                        }),
                    },
                    Err(failure) => ServerMessage::error(correlation_id, failure.code, failure.reason),
                };
                self.send(connection, message);
            }
            Event::ExitChecked {
                name,
                generation,
                reason,
                still_exists,
            } => self.finish_exit(name, generation, reason, still_exists),
            Event::Reconciled { result } => self.finish_reconcile(result),
        }
    }

    fn handle_request(&mut self, connection: ConnectionId, message: ClientMessage) {
        let correlation_id = message.correlation_id;
        match message.payload {
            ClientPayload::Spawn(request) => self.spawn(connection, correlation_id, request),
            ClientPayload::Reconnect(request) => self.reconnect(connection, correlation_id, request),
            ClientPayload::Disconnect(handle) => {
                // Fire-and-forget: release ownership only, never touch the process.
                match self.registry.release(&handle.connection_handle, connection) {
                    Ok(released) => info!(
                        connection,
                        session = %released.name,
                        handle = %released.handle,
                        "disconnected"
                    ),
                    Err(e) => debug!(connection, error = %e, "disconnect for unknown handle"),
                }
            }
            ClientPayload::Close(request) => self.close(connection, correlation_id, request),
            ClientPayload::Input(chunk) => {
                if let Err(failure) = self.forward_input(connection, &chunk.connection_handle, AttachInput::Keys(chunk.bytes)) {
                    self.send(
                        connection,
                        ServerMessage::error(correlation_id, failure.code, failure.reason),
                    );
                }
            }
            ClientPayload::Resize(ResizeRequest {
                connection_handle,
                cols,
                rows,
            }) => {
                let input = AttachInput::Resize(GridSize::new(cols, rows));
                if let Err(failure) = self.forward_input(connection, &connection_handle, input) {
                    self.send(
                        connection,
                        ServerMessage::error(correlation_id, failure.code, failure.reason),
                    );
                }
            }
            ClientPayload::Hello(hello) => self.greet(connection, correlation_id, hello),
            ClientPayload::ListSessions => {
                let mux = Arc::clone(&self.mux);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = mux.list_sessions().await.map_err(Failure::from);
                    let _ = events.send(Event::Listed {
                        connection,
                        correlation_id,
                        result,
                    });
                });
            }
        }
    }

    fn spawn(&mut self, connection: ConnectionId, correlation_id: Option<String>, request: SpawnRequest) {
        let name = match request.multiplexer_session_name.as_deref() {
            Some(name) if !is_valid_session_name(name) => {
                self.send(
                    connection,
                    ServerMessage::error(
                        correlation_id,
                        ErrorCode::InvalidRequest,
                        format!("invalid multiplexer session name {name:?}"),
                    ),
                );
                return;
            }
            Some(name) => name.to_string(),
            None => generate_session_name(&self.settings.session_prefix, &request.tool_type),
        };
        if self.waiters.contains_key(&name) {
            self.send(
                connection,
                ServerMessage::error(
                    correlation_id,
                    ErrorCode::AlreadyExists,
                    format!("multiplexer session {name} already exists"),
                ),
            );
            return;
        }
        if let Err(e) = self.registry.reserve(&name) {
            info!(connection, session = %name, "spawn rejected: name in use");
            let failure = Failure::from(e);
            self.send(
                connection,
                ServerMessage::error(correlation_id, failure.code, failure.reason),
            );
            return;
        }

        info!(connection, session = %name, tool = %request.tool_type, "spawning");
        self.waiters.insert(
            name.clone(),
            vec![Waiter {
                connection,
                correlation_id,
                tool_type: Some(request.tool_type.clone()),
                size: request.size,
            }],
        );
        let mux = Arc::clone(&self.mux);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = async {
                if mux.attach_exists(&name).await? {
                    return Err(Failure::new(
                        ErrorCode::AlreadyExists,
                        format!("multiplexer session {name} already exists"),
                    ));
                }
                mux.create(&name, request.command.as_deref(), request.working_dir.as_deref())
                    .await?;
                Ok(mux.attach(&name, request.size).await?)
            }
            .await;
            let _ = events.send(Event::Attached { name, result });
        });
    }

    fn reconnect(&mut self, connection: ConnectionId, correlation_id: Option<String>, request: ReconnectRequest) {
        let name = request.multiplexer_session_name;
        let waiter = Waiter {
            connection,
            correlation_id,
            tool_type: None,
            size: request.size,
        };
        if self.registry.contains(&name) {
            self.bind(&name, waiter);
            return;
        }
        if let Some(queue) = self.waiters.get_mut(&name) {
            debug!(connection, session = %name, "queued behind in-flight attach");
            queue.push(waiter);
            return;
        }

        info!(connection, session = %name, "attaching for reconnect");
        self.waiters.insert(name.clone(), vec![waiter]);
        let mux = Arc::clone(&self.mux);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = mux.attach(&name, request.size).await.map_err(Failure::from);
            let _ = events.send(Event::Attached { name, result });
        });
    }

    fn finish_attach(&mut self, name: String, result: Result<Attachment, Failure>) {
        let waiters = self.waiters.remove(&name).unwrap_or_default();
        match result {
            Ok(attachment) => {
                let (generation, replaced) =
                    self.registry
                        .insert(&name, attachment.pid, attachment.input);
                if let Some(replaced) = replaced {
                    warn!(session = %name, "replaced a stale attachment");
                    self.revoke_all(&replaced.name, replaced.owner, replaced.handles);
                }
                spawn_forwarder(name.clone(), generation, attachment.events, self.events.clone());
                for waiter in waiters {
                    self.bind(&name, waiter);
                }
            }
            Err(failure) => {
                self.registry.unreserve(&name);
                warn!(session = %name, reason = %failure.reason, "attach failed");
                for waiter in waiters {
                    self.send(
                        waiter.connection,
                        ServerMessage::error(waiter.correlation_id, failure.code, failure.reason.clone()),
                    );
                }
            }
        }
    }

    /// Claim `name` for a waiting connection and answer it.
    fn bind(&mut self, name: &str, waiter: Waiter) {
        if !self.connections.contains_key(&waiter.connection) {
            debug!(session = %name, connection = waiter.connection, "requester left before attach finished");
            return;
        }
        let claim = match self.registry.claim(name, waiter.connection) {
            Ok(claim) => claim,
            Err(e) => {
                let failure = Failure::from(e);
                self.send(
                    waiter.connection,
                    ServerMessage::error(waiter.correlation_id, failure.code, failure.reason),
                );
                return;
            }
        };
        for revocation in &claim.revoked {
            self.send(
                revocation.connection,
                ServerMessage::new(ServerPayload::OwnershipRevoked(OwnershipRevoked {
                    connection_handle: revocation.handle.clone(),
                    multiplexer_session_name: name.to_string(),
                })),
            );
        }
        info!(
            session = %name,
            connection = waiter.connection,
            handle = %claim.handle,
            "bound"
        );
        self.send(
            waiter.connection,
            ServerMessage {
                correlation_id: waiter.correlation_id,
                payload: ServerPayload::Spawned(Spawned {
                    multiplexer_session_name: name.to_string(),
                    connection_handle: claim.handle.clone(),
                    tool_type: waiter.tool_type,
                }),
            },
        );
        for bytes in claim.backlog {
            self.send(
                waiter.connection,
                ServerMessage::new(ServerPayload::Output(IoChunk {
                    connection_handle: claim.handle.clone(),
                    bytes,
                })),
            );
        }
        if let Some(size) = waiter.size {
            if let Err(failure) = self.forward_input(waiter.connection, &claim.handle, AttachInput::Resize(size)) {
                debug!(session = %name, reason = %failure.reason, "initial resize not applied");
            }
        }
    }

    fn close(&mut self, connection: ConnectionId, correlation_id: Option<String>, request: CloseRequest) {
        let name = match (request.connection_handle, request.multiplexer_session_name) {
            (Some(handle), _) => match self.registry.resolve(&handle, connection) {
                Ok(entry) => entry.name.clone(),
                Err(e) => {
                    let failure = Failure::from(e);
                    self.send(
                        connection,
                        ServerMessage::error(correlation_id, failure.code, failure.reason),
                    );
                    return;
                }
            },
            (None, Some(name)) => name,
            (None, None) => {
                self.send(
                    connection,
                    ServerMessage::error(
                        correlation_id,
                        ErrorCode::InvalidRequest,
                        "close needs a connection handle or a multiplexer session name",
                    ),
                );
                return;
            }
        };

        info!(connection, session = %name, "closing multiplexer session");
        self.closing.insert(name.clone());
        let mux = Arc::clone(&self.mux);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match mux.kill(&name).await {
                Ok(()) | Err(MuxError::SessionMissing(_)) => Ok(()),
                Err(e) => Err(Failure::from(e)),
            };
            let _ = events.send(Event::Closed {
                connection,
                correlation_id,
                name,
                result,
            });
        });
    }

    fn finish_close(
        &mut self,
        connection: ConnectionId,
        correlation_id: Option<String>,
        name: String,
        result: Result<(), Failure>,
    ) {
        self.closing.remove(&name);
        if let Err(failure) = result {
            warn!(session = %name, reason = %failure.reason, "close failed");
            self.send(
                connection,
                ServerMessage::error(correlation_id, failure.code, failure.reason),
            );
            return;
        }
        self.registry.remove(&name);
        info!(session = %name, "closed");
        let reply = ClosedReply {
            multiplexer_session_name: name,
        };
        // Other windows learn about the close too; only the requester is correlated.
        let others: Vec<ConnectionId> = self
            .connections
            .keys()
            .copied()
            .filter(|id| *id != connection)
            .collect();
        for other in others {
            self.send(other, ServerMessage::new(ServerPayload::Closed(reply.clone())));
        }
        self.send(
            connection,
            ServerMessage {
                correlation_id,
                payload: ServerPayload::Closed(reply),
            },
        );
    }

    fn forward_input(&self, connection: ConnectionId, handle: &str, input: AttachInput) -> Result<(), Failure> {
        let sender = self.registry.input_for(handle, connection)?;
        sender.try_send(input).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(%handle, "attachment input queue full, dropping input");
                Failure::new(ErrorCode::Internal, "input queue full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                Failure::new(ErrorCode::ProcessGone, "attachment is no longer running")
            }
        })
    }

    fn route_output(&mut self, name: &str, generation: u64, bytes: Vec<u8>) {
        match self.registry.route_output(name, generation, bytes.clone()) {
            OutputRoute::Deliver {
                connection,
                handles,
            } => {
                for handle in handles {
                    self.send(
                        connection,
                        ServerMessage::new(ServerPayload::Output(IoChunk {
                            connection_handle: handle,
                            bytes: bytes.clone(),
                        })),
                    );
                }
            }
            OutputRoute::Buffered { .. } => {}
            OutputRoute::Unknown => debug!(session = %name, generation, "output from retired attachment"),
        }
    }

    fn check_exit(&mut self, name: String, generation: u64, reason: String) {
        if self
            .registry
            .get(&name)
            .map_or(true, |entry| entry.generation != generation)
        {
            return;
        }
        let mux = Arc::clone(&self.mux);
        let events = self.events.clone();
        tokio::spawn(async move {
            let still_exists = mux.attach_exists(&name).await.map_err(Failure::from);
            let _ = events.send(Event::ExitChecked {
                name,
                generation,
                reason,
                still_exists,
            });
        });
    }

    fn finish_exit(&mut self, name: String, generation: u64, reason: String, still_exists: Result<bool, Failure>) {
        let Some(removed) = self.registry.remove_generation(&name, generation) else {
            return;
        };
        if self.closing.remove(&name) {
            return;
        }
        match still_exists {
            Ok(false) => {
                warn!(session = %name, %reason, "multiplexer session is gone");
                self.broadcast_process_gone(&name, &reason);
            }
            other => {
                if let Err(failure) = other {
                    warn!(session = %name, reason = %failure.reason, "could not confirm session after attachment exit");
                }
                info!(session = %name, %reason, "attachment ended; session still alive");
                self.revoke_all(&name, removed.owner, removed.handles);
            }
        }
    }

    fn start_reconcile(&mut self) {
        if self.reconciling {
            return;
        }
        self.reconciling = true;
        let mux = Arc::clone(&self.mux);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = mux.list_sessions().await.map_err(Failure::from);
            let _ = events.send(Event::Reconciled { result });
        });
    }

    fn finish_reconcile(&mut self, result: Result<Vec<String>, Failure>) {
        self.reconciling = false;
        let live = match result {
            Ok(live) => live,
            Err(failure) => {
                warn!(reason = %failure.reason, "reconciliation skipped");
                return;
            }
        };
        let removed = self.registry.prune_missing(&live);
        let unknown = live
            .iter()
            .filter(|name| !self.registry.contains(name))
            .count();
        debug!(
            live = live.len(),
            pruned = removed.len(),
            unattached = unknown,
            "reconciled registry"
        );
        for entry in removed {
            if self.closing.remove(&entry.name) {
                continue;
            }
            self.broadcast_process_gone(&entry.name, "multiplexer session vanished");
        }
    }

    fn live_windows(&self) -> Vec<String> {
        let unique: BTreeSet<&String> = self.windows.values().collect();
        unique.into_iter().cloned().collect()
    }

    fn greet(&mut self, connection: ConnectionId, correlation_id: Option<String>, hello: WindowHello) {
        info!(connection, window = %hello.window_id, "window connected");
        self.windows.insert(connection, hello.window_id);
        let reply = ServerMessage {
            correlation_id,
            payload: ServerPayload::LiveWindows(LiveWindows {
                window_ids: self.live_windows(),
            }),
        };
        self.send(connection, reply);
    }

    /// Tell everyone still connected that a window is gone, unless another
    /// connection speaks for the same window.
    fn forget_window(&mut self, connection: ConnectionId) {
        let Some(window_id) = self.windows.remove(&connection) else {
            return;
        };
        if self.windows.values().any(|other| *other == window_id) {
            return;
        }
        info!(connection, window = %window_id, "window gone");
        let payload = ServerPayload::WindowGone(WindowGone { window_id });
        for other in self.connections.keys() {
            self.send(*other, ServerMessage::new(payload.clone()));
        }
    }

    fn revoke_all(&self, name: &str, owner: Option<ConnectionId>, handles: Vec<String>) {
        let Some(owner) = owner else {
            return;
        };
        for handle in handles {
            self.send(
                owner,
                ServerMessage::new(ServerPayload::OwnershipRevoked(OwnershipRevoked {
                    connection_handle: handle,
                    multiplexer_session_name: name.to_string(),
                })),
            );
        }
    }

    /// Every window may hold sessions bound to `name`, attached or not.
    fn broadcast_process_gone(&self, name: &str, reason: &str) {
        let payload = ServerPayload::ProcessGone(ProcessGone {
            multiplexer_session_name: name.to_string(),
            reason: reason.to_string(),
        });
        for connection in self.connections.keys() {
            self.send(*connection, ServerMessage::new(payload.clone()));
        }
    }

    fn send(&self, connection: ConnectionId, message: ServerMessage) {
        if let Some(outbound) = self.connections.get(&connection) {
            if outbound.send(message).is_err() {
                debug!(connection, "dropping message for closed connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandleRef, ListedSession};
    use crate::testsupport::FakeMultiplexer;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::time::timeout;

    struct TestClient {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.expect("connect");
            let (read, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                writer,
            }
        }

        async fn send(&mut self, message: ClientMessage) {
            let line = encode_line(&message).expect("encode");
            self.writer.write_all(line.as_bytes()).await.expect("write");
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.expect("write");
        }

        async fn recv(&mut self) -> ServerMessage {
            let line = timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("reply in time")
                .expect("read")
                .expect("open connection");
            decode_line(&line).expect("decode")
        }

        async fn spawn(&mut self, correlation: &str, name: &str) -> String {
            self.send(ClientMessage::correlated(
                correlation,
                ClientPayload::Spawn(SpawnRequest {
                    tool_type: "bash".into(),
                    multiplexer_session_name: Some(name.into()),
                    ..SpawnRequest::default()
                }),
            ))
            .await;
            match self.recv().await.payload {
                ServerPayload::Spawned(spawned) => spawned.connection_handle,
                other => panic!("expected spawned, got {other:?}"),
            }
        }
    }

    async fn start(mux: Arc<FakeMultiplexer>) -> GatewayHandle {
        let settings = GatewaySettings {
            output_buffer_bytes: 64,
            reconcile_interval: None,
            session_prefix: "tabmux".into(),
        };
        spawn_gateway("127.0.0.1:0", mux, settings)
            .await
            .expect("bind gateway")
    }

    // Ensures spawn creates the session and echoes the correlation id.
    #[tokio::test]
    async fn spawn_replies_with_name_and_handle() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(Arc::clone(&mux)).await;
        let mut client = TestClient::connect(gateway.local_addr()).await;

        client
            .send(ClientMessage::correlated(
                "c1",
                ClientPayload::Spawn(SpawnRequest {
                    tool_type: "bash".into(),
                    ..SpawnRequest::default()
                }),
            ))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply.correlation_id.as_deref(), Some("c1"));
        let ServerPayload::Spawned(spawned) = reply.payload else {
            panic!("expected spawned");
        };
        assert!(spawned.multiplexer_session_name.starts_with("tabmux-bash-"));
        assert_eq!(spawned.tool_type.as_deref(), Some("bash"));
        assert!(mux.has_session(&spawned.multiplexer_session_name));
        gateway.shutdown().await;
    }

    // Ensures a spawn against a live name is rejected with AlreadyExists.
    #[tokio::test]
    async fn spawn_against_existing_name_is_rejected() {
        let mux = Arc::new(FakeMultiplexer::new());
        mux.add_external("work");
        let gateway = start(Arc::clone(&mux)).await;
        let mut client = TestClient::connect(gateway.local_addr()).await;

        client
            .send(ClientMessage::correlated(
                "c1",
                ClientPayload::Spawn(SpawnRequest {
                    tool_type: "bash".into(),
                    multiplexer_session_name: Some("work".into()),
                    ..SpawnRequest::default()
                }),
            ))
            .await;
        match client.recv().await.payload {
            ServerPayload::Error(reply) => assert_eq!(reply.code, ErrorCode::AlreadyExists),
            other => panic!("expected error, got {other:?}"),
        }
        gateway.shutdown().await;
    }

    // Ensures reconnect from a second connection revokes the first owner.
    #[tokio::test]
    async fn reconnect_transfers_ownership_and_revokes() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(Arc::clone(&mux)).await;
        let mut window_a = TestClient::connect(gateway.local_addr()).await;
        let mut window_b = TestClient::connect(gateway.local_addr()).await;

        let handle_a = window_a.spawn("c1", "shared").await;
        window_b
            .send(ClientMessage::correlated(
                "c2",
                ClientPayload::Reconnect(ReconnectRequest {
                    multiplexer_session_name: "shared".into(),
                    size: None,
                }),
            ))
            .await;
        let handle_b = match window_b.recv().await.payload {
            ServerPayload::Spawned(spawned) => spawned.connection_handle,
            other => panic!("expected spawned, got {other:?}"),
        };
        assert_ne!(handle_a, handle_b);

        match window_a.recv().await.payload {
            ServerPayload::OwnershipRevoked(revoked) => {
                assert_eq!(revoked.connection_handle, handle_a);
                assert_eq!(revoked.multiplexer_session_name, "shared");
            }
            other => panic!("expected revocation, got {other:?}"),
        }

        // Output now reaches only the new owner.
        mux.emit_output("shared", b"hello");
        match window_b.recv().await.payload {
            ServerPayload::Output(chunk) => {
                assert_eq!(chunk.connection_handle, handle_b);
                assert_eq!(chunk.bytes, b"hello");
            }
            other => panic!("expected output, got {other:?}"),
        }
        gateway.shutdown().await;
    }

    // Ensures disconnect never kills and output produced meanwhile is flushed.
    #[tokio::test]
    async fn disconnect_keeps_session_and_buffers_output() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(Arc::clone(&mux)).await;
        let mut client = TestClient::connect(gateway.local_addr()).await;

        let handle = client.spawn("c1", "keep").await;
        client
            .send(ClientMessage::new(ClientPayload::Disconnect(HandleRef {
                connection_handle: handle,
            })))
            .await;
        // Round-trip a list request so the disconnect is processed first.
        client.send(ClientMessage::correlated("l1", ClientPayload::ListSessions)).await;
        match client.recv().await.payload {
            ServerPayload::SessionList(list) => assert_eq!(
                list.sessions,
                vec![ListedSession {
                    name: "keep".into(),
                    owned: false
                }]
            ),
            other => panic!("expected list, got {other:?}"),
        }
        assert!(mux.has_session("keep"));
        assert_eq!(mux.kill_count(), 0);

        mux.emit_output("keep", b"while away");
        // Let the forwarder hand the chunk to the registry before reclaiming.
        tokio::time::sleep(Duration::from_millis(100)).await;
        client
            .send(ClientMessage::correlated(
                "c2",
                ClientPayload::Reconnect(ReconnectRequest {
                    multiplexer_session_name: "keep".into(),
                    size: None,
                }),
            ))
            .await;
        let handle = match client.recv().await.payload {
            ServerPayload::Spawned(spawned) => spawned.connection_handle,
            other => panic!("expected spawned, got {other:?}"),
        };
        match client.recv().await.payload {
            ServerPayload::Output(chunk) => {
                assert_eq!(chunk.connection_handle, handle);
                assert_eq!(chunk.bytes, b"while away");
            }
            other => panic!("expected flushed output, got {other:?}"),
        }
        gateway.shutdown().await;
    }

    // Ensures close kills the multiplexer session and replies closed.
    #[tokio::test]
    async fn close_kills_and_replies() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(Arc::clone(&mux)).await;
        let mut client = TestClient::connect(gateway.local_addr()).await;

        let handle = client.spawn("c1", "doomed").await;
        client
            .send(ClientMessage::correlated(
                "x1",
                ClientPayload::Close(CloseRequest {
                    connection_handle: Some(handle),
                    multiplexer_session_name: None,
                }),
            ))
            .await;
        loop {
            let reply = client.recv().await;
            match reply.payload {
                ServerPayload::Closed(closed) => {
                    assert_eq!(reply.correlation_id.as_deref(), Some("x1"));
                    assert_eq!(closed.multiplexer_session_name, "doomed");
                    break;
                }
                // The attachment may report the exit before the kill completes.
                ServerPayload::ProcessGone(_) => continue,
                other => panic!("expected closed, got {other:?}"),
            }
        }
        assert!(!mux.has_session("doomed"));
        assert_eq!(mux.kill_count(), 1);
        gateway.shutdown().await;
    }

    // Ensures a vanished session is pushed as processGone to connected windows.
    #[tokio::test]
    async fn vanished_session_is_reported() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(Arc::clone(&mux)).await;
        let mut client = TestClient::connect(gateway.local_addr()).await;

        client.spawn("c1", "fragile").await;
        mux.vanish("fragile");
        match client.recv().await.payload {
            ServerPayload::ProcessGone(gone) => {
                assert_eq!(gone.multiplexer_session_name, "fragile");
            }
            other => panic!("expected processGone, got {other:?}"),
        }
        gateway.shutdown().await;
    }

    // Ensures garbage lines get an invalidRequest reply instead of killing the connection.
    #[tokio::test]
    async fn malformed_line_gets_error_reply() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(mux).await;
        let mut client = TestClient::connect(gateway.local_addr()).await;

        client.send_raw("{not json}\n").await;
        match client.recv().await.payload {
            ServerPayload::Error(reply) => assert_eq!(reply.code, ErrorCode::InvalidRequest),
            other => panic!("expected error, got {other:?}"),
        }
        client.send(ClientMessage::correlated("l1", ClientPayload::ListSessions)).await;
        assert!(matches!(
            client.recv().await.payload,
            ServerPayload::SessionList(_)
        ));
        gateway.shutdown().await;
    }

    // Ensures input is forwarded to the attachment of the owning handle.
    #[tokio::test]
    async fn input_reaches_attachment() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(Arc::clone(&mux)).await;
        let mut client = TestClient::connect(gateway.local_addr()).await;

        let handle = client.spawn("c1", "typed").await;
        client
            .send(ClientMessage::new(ClientPayload::Input(IoChunk {
                connection_handle: handle,
                bytes: b"ls\r".to_vec(),
            })))
            .await;
        let received = timeout(Duration::from_secs(5), mux.next_input("typed"))
            .await
            .expect("input in time");
        assert_eq!(received, Some(AttachInput::Keys(b"ls\r".to_vec())));
        gateway.shutdown().await;
    }

    // Ensures hello is answered with the live windows and a dropped window is
    // announced to the ones still connected.
    #[tokio::test]
    async fn window_presence_is_tracked_per_connection() {
        let mux = Arc::new(FakeMultiplexer::new());
        let gateway = start(mux).await;
        let hello = |id: &str| {
            ClientMessage::correlated(
                format!("hello-{id}"),
                ClientPayload::Hello(WindowHello {
                    window_id: id.into(),
                }),
            )
        };

        let mut a = TestClient::connect(gateway.local_addr()).await;
        a.send(hello("A")).await;
        match a.recv().await.payload {
            ServerPayload::LiveWindows(live) => assert_eq!(live.window_ids, vec!["A".to_string()]),
            other => panic!("expected live windows, got {other:?}"),
        }
        let mut b = TestClient::connect(gateway.local_addr()).await;
        b.send(hello("B")).await;
        let reply = b.recv().await;
        assert_eq!(reply.correlation_id.as_deref(), Some("hello-B"));
        match reply.payload {
            ServerPayload::LiveWindows(live) => {
                assert_eq!(live.window_ids, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected live windows, got {other:?}"),
        }

        drop(a);
        match b.recv().await.payload {
            ServerPayload::WindowGone(gone) => assert_eq!(gone.window_id, "A"),
            other => panic!("expected windowGone, got {other:?}"),
        }
        gateway.shutdown().await;
    }
}
