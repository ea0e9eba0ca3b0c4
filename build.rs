//! Stamps the binary with the commit and build time printed by
//! `tabmux --version`.
//!
//! Both can be pinned from the environment for reproducible builds. A tree
//! with uncommitted changes gets a `-dirty` suffix on the hash.

use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

const HASH_VAR: &str = "TABMUX_BUILD_GIT_HASH";
const TIME_VAR: &str = "TABMUX_BUILD_TIMESTAMP";

fn main() {
    for var in [HASH_VAR, TIME_VAR] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    watch_git_head();

    let hash = pinned(HASH_VAR)
        .or_else(commit_hash)
        .unwrap_or_else(|| "unknown".to_string());
    let time = pinned(TIME_VAR).or_else(utc_now).unwrap_or_else(unix_seconds);
    println!("cargo:rustc-env={HASH_VAR}={hash}");
    println!("cargo:rustc-env={TIME_VAR}={time}");
}

fn pinned(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn watch_git_head() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    let reference = std::fs::read_to_string(".git/HEAD")
        .ok()
        .and_then(|head| head.trim().strip_prefix("ref: ").map(str::to_string));
    if let Some(reference) = reference {
        println!("cargo:rerun-if-changed=.git/{reference}");
    }
}

fn commit_hash() -> Option<String> {
    let hash = stdout_of("git", &["rev-parse", "--short=12", "HEAD"])?;
    let dirty = stdout_of("git", &["status", "--porcelain", "--untracked-files=no"]).is_some();
    Some(if dirty { format!("{hash}-dirty") } else { hash })
}

fn utc_now() -> Option<String> {
    stdout_of("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
}

fn unix_seconds() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("unix:{secs}")
}

/// Trimmed stdout of a successful command; `None` when it fails or prints nothing.
fn stdout_of(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
