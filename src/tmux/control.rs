//! tmux CLI implementation of [`Multiplexer`].

use super::attach::{spawn_control_client, AttachInput, Attachment};
use super::command::{ensure_success, run_process, ExecOutput};
use super::{Multiplexer, PaneState, MANAGED_OPTION};
use crate::error::MuxError;
use crate::protocol::GridSize;
use async_trait::async_trait;
use tracing::{debug, warn};

const PANE_STATE_FORMAT: &str = "#{pane_marked}\t#{window_zoomed_flag}\t#{session_windows}";

/// Drives a tmux server through its command line.
#[derive(Debug, Clone)]
pub struct TmuxControl {
    program: String,
}

impl TmuxControl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: Vec<String>) -> Result<ExecOutput, MuxError> {
        debug!(program = %self.program, ?args, "running multiplexer command");
        run_process(&self.program, &args).await
    }

    async fn run_ok(&self, args: Vec<String>) -> Result<ExecOutput, MuxError> {
        let output = self.run(args.clone()).await?;
        ensure_success(output, &self.program, &args)
    }
}

impl Default for TmuxControl {
    fn default() -> Self {
        Self::new("tmux")
    }
}

/// Exact-match session target.
fn session_target(name: &str) -> String {
    format!("={name}")
}

/// Exact-match target for the session's current window/pane.
fn pane_target(name: &str) -> String {
    format!("={name}:")
}

fn is_no_server(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no server running") || lower.contains("error connecting to")
}

fn is_missing_session(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("can't find session") || lower.contains("session not found") || is_no_server(&lower)
}

/// Build `new-session` arguments for a detached session.
pub(crate) fn new_session_args(name: &str, command: Option<&str>, working_dir: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "new-session".to_string(),
        "-d".to_string(),
        "-s".to_string(),
        name.to_string(),
    ];
    if let Some(dir) = working_dir.filter(|dir| !dir.trim().is_empty()) {
        args.push("-c".into());
        args.push(dir.to_string());
    }
    if let Some(command) = command.filter(|command| !command.trim().is_empty()) {
        args.push(command.to_string());
    }
    args
}

/// Split an opaque control string and aim it at `name`.
///
/// The first word is the tmux command; `-t <target>` is inserted after it.
/// Quoting is not interpreted: arguments are whitespace separated.
pub(crate) fn targeted_command_args(name: &str, control: &str) -> Option<Vec<String>> {
    let mut words = control.split_whitespace();
    let verb = words.next()?;
    let mut args = vec![verb.to_string(), "-t".to_string(), pane_target(name)];
    args.extend(words.map(str::to_string));
    Some(args)
}

pub(crate) fn parse_pane_state(raw: &str) -> Result<PaneState, String> {
    let line = raw.lines().next().unwrap_or("").trim_end();
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 3 {
        return Err(format!("unexpected pane state output: {line:?}"));
    }
    let flag = |value: &str| value.trim() == "1";
    let window_count = fields[2]
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid window count {:?}: {e}", fields[2]))?;
    Ok(PaneState {
        marked: flag(fields[0]),
        zoomed: flag(fields[1]),
        window_count,
    })
}

#[async_trait]
impl Multiplexer for TmuxControl {
    async fn create(
        &self,
        name: &str,
        command: Option<&str>,
        working_dir: Option<&str>,
    ) -> Result<String, MuxError> {
        self.run_ok(new_session_args(name, command, working_dir))
            .await?;
        let mark = vec![
            "set-option".to_string(),
            "-t".to_string(),
            session_target(name),
            MANAGED_OPTION.to_string(),
            "1".to_string(),
        ];
        if let Err(e) = self.run_ok(mark).await {
            warn!(session = %name, error = %e, "failed to mark session as managed");
        }
        Ok(name.to_string())
    }

    async fn attach_exists(&self, name: &str) -> Result<bool, MuxError> {
        let output = self
            .run(vec!["has-session".into(), "-t".into(), session_target(name)])
            .await?;
        Ok(output.exit_code == 0)
    }

    async fn list_sessions(&self) -> Result<Vec<String>, MuxError> {
        let args = vec![
            "list-sessions".to_string(),
            "-F".to_string(),
            "#{session_name}".to_string(),
        ];
        let output = self.run(args.clone()).await?;
        if output.exit_code != 0 && is_no_server(&output.stderr) {
            return Ok(Vec::new());
        }
        let output = ensure_success(output, &self.program, &args)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn send_command(&self, name: &str, control: &str) -> Result<String, MuxError> {
        let args = targeted_command_args(name, control).ok_or_else(|| MuxError::CommandFailed {
            command: self.program.clone(),
            detail: "empty control command".into(),
        })?;
        Ok(self.run_ok(args).await?.stdout)
    }

    async fn kill(&self, name: &str) -> Result<(), MuxError> {
        let args = vec!["kill-session".to_string(), "-t".to_string(), session_target(name)];
        let output = self.run(args.clone()).await?;
        if output.exit_code != 0 && is_missing_session(&output.stderr) {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        ensure_success(output, &self.program, &args)?;
        Ok(())
    }

    async fn query_pane_state(&self, name: &str) -> Result<PaneState, MuxError> {
        let args = vec![
            "display-message".to_string(),
            "-p".to_string(),
            "-t".to_string(),
            pane_target(name),
            PANE_STATE_FORMAT.to_string(),
        ];
        let output = self.run(args.clone()).await?;
        if output.exit_code != 0 && is_missing_session(&output.stderr) {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        let output = ensure_success(output, &self.program, &args)?;
        parse_pane_state(&output.stdout).map_err(|detail| MuxError::CommandFailed {
            command: "display-message".into(),
            detail,
        })
    }

    async fn attach(&self, name: &str, size: Option<GridSize>) -> Result<Attachment, MuxError> {
        if !self.attach_exists(name).await? {
            return Err(MuxError::SessionMissing(name.to_string()));
        }
        let attachment = spawn_control_client(&self.program, name).await?;
        if let Some(size) = size {
            // The client task owns the pipe; a closed channel shows up as Exited.
            let _ = attachment.input.send(AttachInput::Resize(size)).await;
        }
        Ok(attachment)
    }
}
