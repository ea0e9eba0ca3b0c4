//! Process execution helpers for the multiplexer CLI.

use crate::error::MuxError;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Captured result of one CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Upper bound for a single control command; these are short-lived queries.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn and wait for a process with captured output.
pub(crate) async fn run_process(program: &str, args: &[String]) -> Result<ExecOutput, MuxError> {
    let mut cmd = Command::new(program);
    // Dropping the future (caller cancelled) must not leave the CLI running.
    cmd.kill_on_drop(true);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|source| MuxError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let output = match timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(MuxError::CommandFailed {
                command: describe(program, args),
                detail: format!("no response after {}s", COMMAND_TIMEOUT.as_secs()),
            })
        }
    };

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Convert non-zero exit status into a contextual error.
pub(crate) fn ensure_success(
    output: ExecOutput,
    program: &str,
    args: &[String],
) -> Result<ExecOutput, MuxError> {
    if output.exit_code == 0 {
        return Ok(output);
    }
    let mut detail = if output.stderr.trim().is_empty() {
        output.stdout.trim().to_string()
    } else {
        output.stderr.trim().to_string()
    };
    if detail.is_empty() {
        detail = format!("command exited with {}", output.exit_code);
    }
    Err(MuxError::CommandFailed {
        command: describe(program, args),
        detail,
    })
}

/// Render `program arg...` for error messages.
pub(crate) fn describe(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

/// Shell-safe single-quote escaping (only used for display).
pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".into()
    } else if s
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | '=' | ':'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
