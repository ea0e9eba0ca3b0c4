//! Unified error types for the session engine, the gateway, and config.

use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// Failures surfaced by the session store, replicator, and orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation on an unknown session id. Logged and treated as a no-op.
    NotFound(String),
    /// A spawn collided with a live multiplexer session name.
    AlreadyExists(String),
    /// Another window took over the multiplexer session.
    OwnershipConflict(String),
    /// No backend acknowledgment arrived in time.
    Timeout { session_id: String, waited: Duration },
    /// A sibling broadcast could not be decoded.
    MalformedBroadcast(String),
    /// The external multiplexer session vanished.
    ProcessGone(String),
    /// A table invariant would be (or was) violated.
    InvariantViolation(String),
    /// The operation is not valid for the session's current lifecycle state.
    InvalidState { session_id: String, detail: String },
    /// Persisted store could not be read or written.
    Persist(String),
    /// The gateway link or broadcast channel rejected a message.
    Link(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "session {id} not found"),
            Self::AlreadyExists(name) => {
                write!(f, "multiplexer session {name} already exists")
            }
            Self::OwnershipConflict(name) => {
                write!(f, "multiplexer session {name} is now owned by another window")
            }
            Self::Timeout { session_id, waited } => write!(
                f,
                "session {session_id} could not be reattached: no response after {}s",
                waited.as_secs()
            ),
            Self::MalformedBroadcast(reason) => write!(f, "malformed broadcast: {reason}"),
            Self::ProcessGone(name) => write!(
                f,
                "multiplexer session {name} is gone; process may have ended"
            ),
            Self::InvariantViolation(detail) => write!(f, "invariant violation: {detail}"),
            Self::InvalidState { session_id, detail } => {
                write!(f, "session {session_id}: {detail}")
            }
            Self::Persist(detail) => write!(f, "persist: {detail}"),
            Self::Link(detail) => write!(f, "link: {detail}"),
        }
    }
}

impl std::error::Error for SessionError {}

// ---------------------------------------------------------------------------
// MuxError
// ---------------------------------------------------------------------------

/// Errors from the external multiplexer control interface.
#[derive(Debug)]
pub enum MuxError {
    /// The multiplexer program could not be started at all.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The program ran and reported a failure.
    CommandFailed { command: String, detail: String },
    /// The named multiplexer session does not exist.
    SessionMissing(String),
    Io(std::io::Error),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { program, source } => write!(f, "failed to run {program}: {source}"),
            Self::CommandFailed { command, detail } => write!(f, "{command}: {detail}"),
            Self::SessionMissing(name) => write!(f, "multiplexer session {name} does not exist"),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for MuxError {}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// Errors decoding gateway wire frames.
#[derive(Debug)]
pub enum ProtocolError {
    Json(serde_json::Error),
    Base64(base64::DecodeError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "json: {e}"),
            Self::Base64(e) => write!(f, "base64: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Base64(e)
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}
