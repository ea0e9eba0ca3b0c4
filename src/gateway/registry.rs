//! Session registry: which connection owns which multiplexer session.
//!
//! Only the gateway actor holds a `SessionRegistry`, so every mutation goes
//! through one writer. Nothing here performs I/O; callers act on the returned
//! outcomes (send revocations, flush backlog, forward input).

use crate::protocol::ListedSession;
use crate::tmux::naming::random_hex;
use crate::tmux::AttachInput;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Gateway-local identifier of one accepted connection.
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The name is live or a spawn for it is in flight.
    AlreadyExists(String),
    NotFound(String),
    /// The handle exists but belongs to another connection.
    NotOwner(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists(name) => write!(f, "multiplexer session {name} already exists"),
            Self::NotFound(what) => write!(f, "{what} is not registered"),
            Self::NotOwner(handle) => {
                write!(f, "connection handle {handle} is owned by another connection")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Bounded FIFO of output produced while nobody owns the session.
///
/// When full, the oldest chunks are discarded first.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    limit: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Append `chunk`, returning how many bytes were trimmed to stay bounded.
    pub fn push(&mut self, chunk: Vec<u8>) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        let mut trimmed = 0;
        let chunk = if chunk.len() > self.limit {
            trimmed += chunk.len() - self.limit;
            chunk[chunk.len() - self.limit..].to_vec()
        } else {
            chunk
        };
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.bytes > self.limit {
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            self.bytes -= front.len();
            trimmed += front.len();
        }
        trimmed
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.bytes = 0;
        self.chunks.drain(..).collect()
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// One attached multiplexer session.
#[derive(Debug)]
pub struct RegistryEntry {
    pub name: String,
    pub owner: Option<ConnectionId>,
    /// Live handles held by `owner`. Panes of one split may hold several.
    pub handles: BTreeSet<String>,
    pub pid: Option<u32>,
    /// Distinguishes successive attachments made under the same name.
    pub generation: u64,
    input: mpsc::Sender<AttachInput>,
    buffer: OutputBuffer,
}

/// A handle taken away from a previous owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    pub connection: ConnectionId,
    pub handle: String,
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub handle: String,
    pub revoked: Vec<Revocation>,
    /// Output buffered while the session had no owner, oldest first.
    pub backlog: Vec<Vec<u8>>,
}

/// Where a chunk of output should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRoute {
    Deliver {
        connection: ConnectionId,
        handles: Vec<String>,
    },
    Buffered { trimmed: usize },
    Unknown,
}

/// A released handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub name: String,
    pub handle: String,
    /// True when this was the owner's last handle.
    pub now_unowned: bool,
}

/// Entry removed by close or process exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub name: String,
    pub owner: Option<ConnectionId>,
    pub handles: Vec<String>,
}

/// Single-writer map from multiplexer session name to ownership state.
#[derive(Debug)]
pub struct SessionRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    reserved: HashSet<String>,
    handle_index: HashMap<String, String>,
    buffer_limit: usize,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            reserved: HashSet::new(),
            handle_index: HashMap::new(),
            buffer_limit: buffer_limit.max(1),
            next_generation: 1,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Hold `name` for an in-flight spawn so a concurrent spawn is rejected.
    pub fn reserve(&mut self, name: &str) -> Result<(), RegistryError> {
        if self.entries.contains_key(name) || self.reserved.contains(name) {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }
        self.reserved.insert(name.to_string());
        Ok(())
    }

    pub fn unreserve(&mut self, name: &str) {
        self.reserved.remove(name);
    }

    /// Register a fresh attachment with no owner yet; returns its generation.
    ///
    /// An existing entry under the same name is replaced and its handles are
    /// returned through `Removed` so the caller can notify the old owner.
    pub fn insert(
        &mut self,
        name: &str,
        pid: Option<u32>,
        input: mpsc::Sender<AttachInput>,
    ) -> (u64, Option<Removed>) {
        self.reserved.remove(name);
        let replaced = self.remove(name);
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(
            name.to_string(),
            RegistryEntry {
                name: name.to_string(),
                owner: None,
                handles: BTreeSet::new(),
                pid,
                generation,
                input,
                buffer: OutputBuffer::new(self.buffer_limit),
            },
        );
        debug!(session = %name, generation, ?pid, "registered attachment");
        (generation, replaced)
    }

    /// Give `connection` a new handle on `name`.
    ///
    /// A claim from a different connection than the current owner transfers
    /// ownership and revokes every handle the previous owner held.
    pub fn claim(&mut self, name: &str, connection: ConnectionId) -> Result<Claim, RegistryError> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(format!("multiplexer session {name}")))?;

        let mut revoked = Vec::new();
        if let Some(previous) = entry.owner.filter(|owner| *owner != connection) {
            for handle in std::mem::take(&mut entry.handles) {
                self.handle_index.remove(&handle);
                revoked.push(Revocation {
                    connection: previous,
                    handle,
                });
            }
            info!(
                session = %name,
                from = previous,
                to = connection,
                revoked = revoked.len(),
                "ownership transferred"
            );
        }

        let handle = format!("h-{}", random_hex(12));
        entry.owner = Some(connection);
        entry.handles.insert(handle.clone());
        self.handle_index.insert(handle.clone(), name.to_string());
        let backlog = entry.buffer.drain();
        if !backlog.is_empty() {
            debug!(session = %name, chunks = backlog.len(), "flushing buffered output to new owner");
        }
        Ok(Claim {
            handle,
            revoked,
            backlog,
        })
    }

    /// Resolve `handle` for `connection`, rejecting handles it does not own.
    pub fn resolve(&self, handle: &str, connection: ConnectionId) -> Result<&RegistryEntry, RegistryError> {
        let name = self
            .handle_index
            .get(handle)
            .ok_or_else(|| RegistryError::NotFound(format!("connection handle {handle}")))?;
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(format!("multiplexer session {name}")))?;
        if entry.owner != Some(connection) {
            return Err(RegistryError::NotOwner(handle.to_string()));
        }
        Ok(entry)
    }

    /// Input sender for a handle owned by `connection`.
    pub fn input_for(
        &self,
        handle: &str,
        connection: ConnectionId,
    ) -> Result<mpsc::Sender<AttachInput>, RegistryError> {
        Ok(self.resolve(handle, connection)?.input.clone())
    }

    /// Graceful release of one handle. The attachment stays registered.
    pub fn release(&mut self, handle: &str, connection: ConnectionId) -> Result<Released, RegistryError> {
        let name = self.resolve(handle, connection)?.name.clone();
        self.handle_index.remove(handle);
        let Some(entry) = self.entries.get_mut(&name) else {
            return Err(RegistryError::NotFound(format!("multiplexer session {name}")));
        };
        entry.handles.remove(handle);
        let now_unowned = entry.handles.is_empty();
        if now_unowned {
            entry.owner = None;
        }
        debug!(session = %name, %handle, now_unowned, "released handle");
        Ok(Released {
            name,
            handle: handle.to_string(),
            now_unowned,
        })
    }

    /// Release everything a closed connection held.
    pub fn release_connection(&mut self, connection: ConnectionId) -> Vec<Released> {
        let owned: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.owner == Some(connection))
            .flat_map(|entry| entry.handles.iter().cloned())
            .collect();
        owned
            .iter()
            .filter_map(|handle| self.release(handle, connection).ok())
            .collect()
    }

    /// Decide where output from attachment `generation` of `name` goes.
    pub fn route_output(&mut self, name: &str, generation: u64, bytes: Vec<u8>) -> OutputRoute {
        let Some(entry) = self.entries.get_mut(name) else {
            return OutputRoute::Unknown;
        };
        if entry.generation != generation {
            return OutputRoute::Unknown;
        }
        match entry.owner {
            Some(connection) if !entry.handles.is_empty() => OutputRoute::Deliver {
                connection,
                handles: entry.handles.iter().cloned().collect(),
            },
            _ => {
                let trimmed = entry.buffer.push(bytes);
                if trimmed > 0 {
                    warn!(
                        session = %name,
                        trimmed,
                        buffered = entry.buffer.len_bytes(),
                        "output buffer full, dropped oldest bytes"
                    );
                }
                OutputRoute::Buffered { trimmed }
            }
        }
    }

    /// Drop the entry for `name`, forgetting all its handles.
    pub fn remove(&mut self, name: &str) -> Option<Removed> {
        let entry = self.entries.remove(name)?;
        for handle in &entry.handles {
            self.handle_index.remove(handle);
        }
        Some(Removed {
            name: entry.name,
            owner: entry.owner,
            handles: entry.handles.into_iter().collect(),
        })
    }

    /// Remove only if `generation` is still the live attachment.
    pub fn remove_generation(&mut self, name: &str, generation: u64) -> Option<Removed> {
        if self.entries.get(name)?.generation != generation {
            return None;
        }
        self.remove(name)
    }

    /// Multiplexer names joined with registry ownership.
    pub fn listing(&self, live_names: &[String]) -> Vec<ListedSession> {
        live_names
            .iter()
            .map(|name| ListedSession {
                name: name.clone(),
                owned: self.reserved.contains(name)
                    || self
                        .entries
                        .get(name)
                        .is_some_and(|entry| entry.owner.is_some()),
            })
            .collect()
    }

    /// Drop entries whose multiplexer session is no longer listed.
    pub fn prune_missing(&mut self, live_names: &[String]) -> Vec<Removed> {
        let live: HashSet<&str> = live_names.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .entries
            .keys()
            .filter(|name| !live.contains(name.as_str()))
            .cloned()
            .collect();
        stale.iter().filter_map(|name| self.remove(name)).collect()
    }
}
