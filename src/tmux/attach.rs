//! Long-running control-mode client bound to one multiplexer session.
//!
//! `tmux -C attach-session` speaks a line protocol over plain pipes, so the
//! gateway can stream pane output and inject keystrokes without owning a
//! pseudo-terminal. Stopping this client (closing its stdin) detaches it; the
//! multiplexer session and the processes inside it keep running.

use crate::error::MuxError;
use crate::protocol::GridSize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Most bytes encoded into a single `send-keys -H` command.
const SEND_KEYS_CHUNK: usize = 256;
/// Buffered events between the client task and its consumer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Input forwarded to the attached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachInput {
    Keys(Vec<u8>),
    Resize(GridSize),
}

/// Events produced by the attached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachEvent {
    Output(Vec<u8>),
    /// The client ended; carries the multiplexer's reason when one was given.
    Exited(String),
}

/// Live attachment handed to the gateway.
///
/// Dropping `input` stops the client gracefully.
#[derive(Debug)]
pub struct Attachment {
    pub pid: Option<u32>,
    pub input: mpsc::Sender<AttachInput>,
    pub events: mpsc::Receiver<AttachEvent>,
}

/// One parsed control-mode line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlLine {
    Output(Vec<u8>),
    Exit(String),
    Other,
}

/// Start a control-mode client for `name`.
pub(crate) async fn spawn_control_client(program: &str, name: &str) -> Result<Attachment, MuxError> {
    let mut cmd = Command::new(program);
    // Backstop only: this kills the client process, never the session.
    cmd.kill_on_drop(true);
    // tmux refuses to nest clients when `$TMUX` is inherited.
    cmd.env_remove("TMUX")
        .args(["-C", "attach-session", "-t", &format!("={name}")])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().map_err(|source| MuxError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let pid = child.id();
    let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(MuxError::CommandFailed {
            command: format!("{program} -C attach-session"),
            detail: "control client pipes unavailable".into(),
        });
    };

    let (input_tx, mut input_rx) = mpsc::channel::<AttachInput>(EVENT_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel::<AttachEvent>(EVENT_CHANNEL_CAPACITY);
    let session = name.to_string();

    tokio::spawn(async move {
        // Pane output is raw bytes, not necessarily UTF-8.
        let mut lines = BufReader::new(stdout).split(b'\n');
        let exit_reason = loop {
            tokio::select! {
                line = lines.next_segment() => match line {
                    Ok(Some(line)) => match parse_control_line(&line) {
                        ControlLine::Output(bytes) => {
                            if event_tx.send(AttachEvent::Output(bytes)).await.is_err() {
                                break None;
                            }
                        }
                        ControlLine::Exit(reason) => break Some(reason),
                        ControlLine::Other => {}
                    },
                    Ok(None) => break Some("control client closed".to_string()),
                    Err(e) => break Some(format!("control client read failed: {e}")),
                },
                input = input_rx.recv() => {
                    let Some(input) = input else {
                        debug!(session = %session, "detaching control client");
                        let _ = stdin.write_all(b"detach-client\n").await;
                        break None;
                    };
                    let commands = match input {
                        AttachInput::Keys(bytes) => encode_send_keys(&bytes),
                        AttachInput::Resize(size) => vec![encode_resize(size)],
                    };
                    for command in commands {
                        if let Err(e) = stdin.write_all(command.as_bytes()).await {
                            warn!(session = %session, error = %e, "control client write failed");
                        }
                    }
                }
            }
        };
        drop(stdin);
        let _ = child.wait().await;
        if let Some(reason) = exit_reason {
            debug!(session = %session, %reason, "control client exited");
            let _ = event_tx.send(AttachEvent::Exited(reason)).await;
        }
    });

    Ok(Attachment {
        pid,
        input: input_tx,
        events: event_rx,
    })
}

/// Classify one line of control-mode output.
pub(crate) fn parse_control_line(line: &[u8]) -> ControlLine {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if let Some(rest) = line.strip_prefix(b"%output ") {
        // `%output %<pane> <escaped data>`; data may be absent for empty writes.
        let data = match rest.iter().position(|b| *b == b' ') {
            Some(split) => &rest[split + 1..],
            None => &[],
        };
        return ControlLine::Output(unescape_output(data));
    }
    if line == &b"%exit"[..] {
        return ControlLine::Exit(String::new());
    }
    if let Some(reason) = line.strip_prefix(b"%exit ") {
        return ControlLine::Exit(String::from_utf8_lossy(reason).trim().to_string());
    }
    ControlLine::Other
}

/// Decode control-mode escaping: bytes below 32 and `\` arrive as `\ooo`.
pub(crate) fn unescape_output(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 3 < raw.len() && is_octal_triplet(&raw[i + 1..i + 4]) {
            let value = (raw[i + 1] - b'0') as u16 * 64
                + (raw[i + 2] - b'0') as u16 * 8
                + (raw[i + 3] - b'0') as u16;
            out.push(value as u8);
            i += 4;
            continue;
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

fn is_octal_triplet(bytes: &[u8]) -> bool {
    bytes.len() == 3 && bytes.iter().all(|b| (b'0'..=b'7').contains(b))
}

/// Encode raw input as hex `send-keys` commands for the attached pane.
pub(crate) fn encode_send_keys(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(SEND_KEYS_CHUNK)
        .map(|chunk| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            format!("send-keys -H {}\n", hex.join(" "))
        })
        .collect()
}

fn encode_resize(size: GridSize) -> String {
    format!("refresh-client -C {}x{}\n", size.cols, size.rows)
}
