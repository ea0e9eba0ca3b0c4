//! Shared test fixtures.
//!
//! `TestTempDir` backs persistence and config tests; `FakeMultiplexer` stands
//! in for tmux so the gateway and end-to-end tests run without a server.

use crate::error::MuxError;
use crate::protocol::GridSize;
use crate::tmux::{AttachEvent, AttachInput, Attachment, Multiplexer, PaneState};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory fixture with best-effort cleanup.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    /// Create a unique temporary directory with a readable prefix.
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!("tabmux-{prefix}-{millis}-{suffix}"));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    /// Root directory path for this fixture.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a child path under the fixture root.
    pub fn child(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    /// Write UTF-8 text to a child path, creating parent directories as needed.
    pub fn write_text(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.child(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent directories for fixture");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

type InputLog = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<AttachInput>>>;

struct InputRecorder {
    sender: mpsc::UnboundedSender<AttachInput>,
    log: InputLog,
}

impl InputRecorder {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            log: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

#[derive(Default)]
struct FakeState {
    sessions: BTreeSet<String>,
    /// Live attachment event senders per session.
    attached: HashMap<String, Vec<mpsc::Sender<AttachEvent>>>,
    inputs: HashMap<String, InputRecorder>,
    commands: Vec<(String, String)>,
    kills: usize,
    next_pid: u32,
}

impl FakeState {
    fn recorder(&mut self, name: &str) -> &InputRecorder {
        self.inputs
            .entry(name.to_string())
            .or_insert_with(InputRecorder::new)
    }

    /// Tell every attachment of `name` that its client ended.
    fn end_attachments(&mut self, name: &str, reason: &str) {
        for sender in self.attached.remove(name).unwrap_or_default() {
            let _ = sender.try_send(AttachEvent::Exited(reason.to_string()));
        }
    }
}

/// In-memory multiplexer with scriptable output and failures.
#[derive(Default)]
pub struct FakeMultiplexer {
    state: Mutex<FakeState>,
}

impl FakeMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake multiplexer lock")
    }

    /// A session created outside tabmux (or by an earlier run).
    pub fn add_external(&self, name: &str) {
        self.state().sessions.insert(name.to_string());
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.state().sessions.contains(name)
    }

    pub fn kill_count(&self) -> usize {
        self.state().kills
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.state().commands.clone()
    }

    /// Push output to every attachment of `name`.
    pub fn emit_output(&self, name: &str, bytes: &[u8]) {
        let mut state = self.state();
        if let Some(senders) = state.attached.get_mut(name) {
            senders.retain(|sender| !sender.is_closed());
            for sender in senders.iter() {
                let _ = sender.try_send(AttachEvent::Output(bytes.to_vec()));
            }
        }
    }

    /// The session dies on its own (its process exited).
    pub fn vanish(&self, name: &str) {
        let mut state = self.state();
        state.sessions.remove(name);
        state.end_attachments(name, "session vanished");
    }

    /// Next input any attachment of `name` forwarded, in order.
    pub async fn next_input(&self, name: &str) -> Option<AttachInput> {
        let log = Arc::clone(&self.state().recorder(name).log);
        let mut receiver = log.lock().await;
        receiver.recv().await
    }
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn create(
        &self,
        name: &str,
        _command: Option<&str>,
        _working_dir: Option<&str>,
    ) -> Result<String, MuxError> {
        let mut state = self.state();
        if !state.sessions.insert(name.to_string()) {
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

    async fn send_command(&self, name: &str, control: &str) -> Result<String, MuxError> {
        let mut state = self.state();
        if !state.sessions.contains(name) {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        state.commands.push((name.to_string(), control.to_string()));
        Ok(String::new())
    }

    async fn kill(&self, name: &str) -> Result<(), MuxError> {
        let mut state = self.state();
        if !state.sessions.remove(name) {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        state.kills += 1;
        state.end_attachments(name, "session killed");
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
        let (pid, recorder) = {
            let mut state = self.state();
            if !state.sessions.contains(name) {
                return Err(MuxError::SessionMissing(name.to_string()));
            }
            state.next_pid += 1;
            let pid = 4000 + state.next_pid;
            state
                .attached
                .entry(name.to_string())
                .or_default()
                .push(event_tx);
            (pid, state.recorder(name).sender.clone())
        };
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                if recorder.send(input).is_err() {
                    break;
                }
            }
        });
        Ok(Attachment {
            pid: Some(pid),
            input: input_tx,
            events: event_rx,
        })
    }
}
