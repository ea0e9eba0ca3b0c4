//! Shared harness for the cross-window integration tests.
//!
//! `MemoryMux` stands in for tmux behind the public `Multiplexer` trait, so a
//! real gateway, real TCP clients and real window loops run end to end
//! without a tmux server.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tabmux::client::GatewayClient;
use tabmux::error::MuxError;
use tabmux::gateway::{spawn_gateway, GatewayHandle, GatewaySettings};
use tabmux::model::Session;
use tabmux::protocol::GridSize;
use tabmux::replicator::LocalBus;
use tabmux::store::InvariantPolicy;
use tabmux::tmux::{AttachEvent, AttachInput, Attachment, Multiplexer, PaneState};
use tabmux::window::{spawn_window, WindowConfig, WindowEvents, WindowHandle, WindowSnapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// How long `wait_for` polls before failing the test.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MemoryState {
    sessions: BTreeSet<String>,
    attached: HashMap<String, Vec<mpsc::Sender<AttachEvent>>>,
    kills: usize,
}

/// In-memory multiplexer: sessions are names, attachments are channels.
#[derive(Default)]
pub struct MemoryMux {
    state: Mutex<MemoryState>,
}

impl MemoryMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory mux lock")
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.state().sessions.contains(name)
    }

    pub fn kill_count(&self) -> usize {
        self.state().kills
    }

    /// The session's process exits on its own.
    pub fn vanish(&self, name: &str) {
        let mut state = self.state();
        state.sessions.remove(name);
        for sender in state.attached.remove(name).unwrap_or_default() {
            let _ = sender.try_send(AttachEvent::Exited("process exited".into()));
        }
    }

    pub fn emit_output(&self, name: &str, bytes: &[u8]) {
        if let Some(senders) = self.state().attached.get(name) {
            for sender in senders {
                let _ = sender.try_send(AttachEvent::Output(bytes.to_vec()));
            }
        }
    }
}

#[async_trait]
impl Multiplexer for MemoryMux {
    async fn create(
        &self,
        name: &str,
        _command: Option<&str>,
        _working_dir: Option<&str>,
    ) -> Result<String, MuxError> {
        if !self.state().sessions.insert(name.to_string()) {
            return Err(MuxError::CommandFailed {
                command: "new-session".into(),
                detail: format!("duplicate session: {name}"),
            });
        }
        Ok(name.to_string())
    }

    async fn attach_exists(&self, name: &str) -> Result<bool, MuxError> {
        Ok(self.has_session(name))
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        Ok(self.state().sessions.iter().cloned().collect())
    }

    async fn send_command(&self, name: &str, _control: &str) -> Result<String, MuxError> {
        if !self.has_session(name) {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        Ok(String::new())
    }

    async fn kill(&self, name: &str) -> Result<(), MuxError> {
        let mut state = self.state();
        if !state.sessions.remove(name) {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        state.kills += 1;
        for sender in state.attached.remove(name).unwrap_or_default() {
            let _ = sender.try_send(AttachEvent::Exited("session killed".into()));
        }
        Ok(())
    }

    async fn query_pane_state(&self, name: &str) -> Result<PaneState, MuxError> {
        if !self.has_session(name) {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        Ok(PaneState {
            window_count: 1,
            ..PaneState::default()
        })
    }

    async fn attach(&self, name: &str, _size: Option<GridSize>) -> Result<Attachment, MuxError> {
        let (input_tx, mut input_rx) = mpsc::channel::<AttachInput>(64);
        let (event_tx, event_rx) = mpsc::channel::<AttachEvent>(64);
        {
            let mut state = self.state();
            if !state.sessions.contains(name) {
                return Err(MuxError::SessionMissing(name.to_string()));
            }
            state.attached.entry(name.to_string()).or_default().push(event_tx);
        }
        tokio::spawn(async move { while input_rx.recv().await.is_some() {} });
        Ok(Attachment {
            pid: None,
            input: input_tx,
            events: event_rx,
        })
    }
}

/// Gateway on an ephemeral port with background reconciliation off.
pub async fn start_gateway(mux: Arc<MemoryMux>) -> GatewayHandle {
    let settings = GatewaySettings {
        reconcile_interval: None,
        ..GatewaySettings::default()
    };
    spawn_gateway("127.0.0.1:0", mux, settings)
        .await
        .expect("gateway binds an ephemeral port")
}

/// A window connected to the gateway at `addr` and to the shared `bus`.
pub async fn open_window(addr: SocketAddr, window_id: &str, bus: &LocalBus) -> (WindowHandle, WindowEvents) {
    let (handle, events, _task) = open_window_task(addr, window_id, bus).await;
    (handle, events)
}

/// Like [`open_window`], keeping the task so a test can kill the window
/// without letting it shut down cleanly.
pub async fn open_window_task(
    addr: SocketAddr,
    window_id: &str,
    bus: &LocalBus,
) -> (WindowHandle, WindowEvents, JoinHandle<()>) {
    let client = GatewayClient::connect(&addr.to_string())
        .await
        .expect("window connects to gateway");
    let mut config = WindowConfig::new(window_id);
    config.tick_interval = Duration::from_millis(50);
    config.policy = InvariantPolicy::Normalize;
    spawn_window(config, client, Box::new(bus.clone()), bus.subscribe()).expect("window starts")
}

/// Poll `window` until `done` holds, failing the test after [`WAIT_LIMIT`].
pub async fn wait_for<F>(window: &WindowHandle, what: &str, done: F) -> WindowSnapshot
where
    F: Fn(&WindowSnapshot) -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let snapshot = window.snapshot().await.expect("window is running");
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "window {} never reached: {what}\nlast snapshot: {snapshot:#?}",
            window.window_id()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// The visible tab `id`, if any.
pub fn tab<'a>(snapshot: &'a WindowSnapshot, id: &str) -> Option<&'a Session> {
    snapshot.visible.iter().find(|session| session.id == id)
}
