//! Per-window session table with invariant enforcement.
//!
//! Every mutation runs against a scratch copy of the table and is committed
//! only when the result passes the invariant checks, so a caller never sees
//! a half-applied change (in particular, a split container whose panes have
//! not followed an ownership change).

use crate::error::SessionError;
use crate::model::{LifecycleState, Session, SessionId, SessionPatch, SessionTable};
use tracing::{debug, error, warn};

pub mod invariants;
pub mod persist;

pub use invariants::{InvariantPolicy, Violation, ViolationKind};
pub use persist::TableFile;

/// In-memory session table for one window.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    table: SessionTable,
    policy: InvariantPolicy,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_policy(InvariantPolicy::default())
    }

    pub fn with_policy(policy: InvariantPolicy) -> Self {
        Self {
            table: SessionTable::new(),
            policy,
        }
    }

    pub fn policy(&self) -> InvariantPolicy {
        self.policy
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.table.sessions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.sessions.contains_key(id)
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// All sessions in tab order, hidden panes included.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.table.iter_ordered()
    }

    /// Insert a single session. Containers must go through [`Self::add_split`].
    pub fn add_session(&mut self, session: Session) -> Result<(), SessionError> {
        if session.is_container() || session.is_hidden_pane {
            return Err(SessionError::InvariantViolation(format!(
                "{} must be added together with its split family",
                session.id
            )));
        }
        self.transact(|table| {
            insert_new(table, session)?;
            Ok(())
        })
    }

    /// Insert a container and both of its panes as one operation.
    pub fn add_split(&mut self, container: Session, panes: [Session; 2]) -> Result<(), SessionError> {
        if !container.is_container() {
            return Err(SessionError::InvariantViolation(format!(
                "{} is not a split container",
                container.id
            )));
        }
        self.transact(|table| {
            insert_new(table, container)?;
            for mut pane in panes {
                pane.is_hidden_pane = true;
                insert_new(table, pane)?;
            }
            Ok(())
        })
    }

    /// Apply `patch` to one session, propagating family-wide fields.
    ///
    /// - An ownership change on a container or on one of its panes moves the
    ///   whole family to the new owner.
    /// - A lifecycle change on a container is mirrored on its panes; moving a
    ///   container to `detached` also clears the panes' connection handles.
    ///
    /// Returns the ids that changed, target first.
    pub fn update_session(
        &mut self,
        id: &str,
        patch: SessionPatch,
    ) -> Result<Vec<SessionId>, SessionError> {
        let Some(current) = self.table.sessions.get(id) else {
            debug!(session_id = id, "update on unknown session ignored");
            return Err(SessionError::NotFound(id.to_string()));
        };
        if let (Some(existing), Some(requested)) = (
            current.multiplexer_session_name.as_deref(),
            patch.multiplexer_session_name.as_deref(),
        ) {
            if existing != requested {
                return Err(SessionError::InvariantViolation(format!(
                    "{id} is bound to multiplexer session {existing}; cannot rebind to {requested}"
                )));
            }
        }

        let family = self.family_of(id);
        let container_id = family
            .first()
            .filter(|first| self.get(first).is_some_and(Session::is_container))
            .cloned();
        let patched_container = container_id.as_deref() == Some(id);

        let mut changed = vec![id.to_string()];
        self.transact(|table| {
            if let Some(session) = table.sessions.get_mut(id) {
                patch.apply_to(session);
            }
            let mut relatives = SessionPatch::new();
            if let Some(owner) = &patch.owner_window_id {
                relatives.owner_window_id = Some(owner.clone());
            }
            if patched_container {
                if let Some(state) = patch.lifecycle_state {
                    relatives.lifecycle_state = Some(state);
                    if state == LifecycleState::Detached {
                        relatives.connection_handle = Some(None);
                        relatives.last_active_at = patch.last_active_at;
                    }
                }
            }
            if relatives.is_empty() {
                return Ok(());
            }
            for member in family.iter().filter(|member| member.as_str() != id) {
                if let Some(session) = table.sessions.get_mut(member) {
                    relatives.apply_to(session);
                    changed.push(member.clone());
                }
            }
            Ok(())
        })?;
        Ok(changed)
    }

    /// Remove a session.
    ///
    /// Removing a container removes its panes. Removing one pane collapses the
    /// split: the container goes away and the surviving pane becomes a
    /// top-level tab in the container's slot. Returns the removed sessions.
    pub fn remove_session(&mut self, id: &str) -> Result<Vec<Session>, SessionError> {
        let Some(target) = self.table.sessions.get(id) else {
            debug!(session_id = id, "remove on unknown session ignored");
            return Err(SessionError::NotFound(id.to_string()));
        };
        let parent = self.container_of(id).map(|container| container.id.clone());
        let is_container = target.is_container();

        let mut removed = Vec::new();
        self.transact(|table| {
            if is_container {
                let panes: Vec<String> = table.sessions[id]
                    .split_layout
                    .as_ref()
                    .map(|layout| layout.pane_ids().map(str::to_string).collect())
                    .unwrap_or_default();
                for member in std::iter::once(id.to_string()).chain(panes) {
                    if let Some(session) = table.sessions.remove(&member) {
                        removed.push(session);
                    }
                    table.order.retain(|entry| *entry != member);
                }
                return Ok(());
            }
            if let Some(session) = table.sessions.remove(id) {
                removed.push(session);
            }
            table.order.retain(|entry| entry != id);
            if let Some(parent) = &parent {
                if let Some(container) = table.sessions.get(parent) {
                    removed.push(container.clone());
                }
                invariants::dissolve_container(table, parent);
            }
            Ok(())
        })?;
        Ok(removed)
    }

    /// Tabs shown by `window_id`: its own, then detached candidates
    /// (most recently detached first).
    pub fn list_visible(&self, window_id: &str) -> Vec<&Session> {
        let mut owned = Vec::new();
        let mut detached = Vec::new();
        for session in self.table.iter_ordered() {
            if !session.is_visible_in(window_id) {
                continue;
            }
            if session.owner_window_id.as_deref() == Some(window_id) {
                owned.push(session);
            } else {
                detached.push(session);
            }
        }
        detached.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        owned.extend(detached);
        owned
    }

    /// The container whose layout references `pane_id`.
    pub fn container_of(&self, pane_id: &str) -> Option<&Session> {
        self.table.sessions.values().find(|session| {
            session.is_container()
                && session
                    .split_layout
                    .as_ref()
                    .is_some_and(|layout| layout.references(pane_id))
        })
    }

    /// The split family containing `id`: container first, then panes in layout
    /// order. A single tab is its own family. Empty for unknown ids.
    pub fn family_of(&self, id: &str) -> Vec<SessionId> {
        let Some(session) = self.get(id) else {
            return Vec::new();
        };
        let root = if session.is_container() {
            session
        } else {
            match self.container_of(id) {
                Some(container) => container,
                None => return vec![id.to_string()],
            }
        };
        let mut family = vec![root.id.clone()];
        if let Some(layout) = &root.split_layout {
            family.extend(
                layout
                    .pane_ids()
                    .filter(|pane| self.contains(pane))
                    .map(str::to_string),
            );
        }
        family
    }

    /// Non-closed sessions bound to a multiplexer session name.
    pub fn find_by_mux_name(&self, name: &str) -> Vec<&Session> {
        self.table
            .iter_ordered()
            .filter(|session| {
                session.multiplexer_session_name.as_deref() == Some(name)
                    && session.lifecycle_state != LifecycleState::Closed
            })
            .collect()
    }

    pub fn find_by_handle(&self, handle: &str) -> Option<&Session> {
        self.table
            .sessions
            .values()
            .find(|session| session.connection_handle.as_deref() == Some(handle))
    }

    /// Replace the whole table with one sourced outside this store.
    ///
    /// Violations are handled per [`InvariantPolicy`]: the table is refused
    /// (and the current one kept), or repaired and what was repaired returned.
    pub fn replace_table(&mut self, mut table: SessionTable) -> Result<Vec<Violation>, SessionError> {
        table.normalize_order();
        let found = invariants::check(&table);
        if !found.is_empty() {
            if self.policy == InvariantPolicy::Reject {
                let details: Vec<String> = found.iter().map(ToString::to_string).collect();
                error!(violations = found.len(), "refused session table: {}", details.join("; "));
                return Err(SessionError::InvariantViolation(details.join("; ")));
            }
            invariants::normalize(&mut table);
        }
        self.table = table;
        Ok(found)
    }

    /// Run `op` on a scratch copy and commit only if invariants still hold.
    fn transact<F>(&mut self, op: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut SessionTable) -> Result<(), SessionError>,
    {
        let mut scratch = self.table.clone();
        op(&mut scratch)?;
        scratch.normalize_order();
        let found = invariants::check(&scratch);
        if let Some(first) = found.first() {
            warn!(violation = %first, "rejected session mutation");
            return Err(SessionError::InvariantViolation(first.to_string()));
        }
        self.table = scratch;
        Ok(())
    }
}

fn insert_new(table: &mut SessionTable, session: Session) -> Result<(), SessionError> {
    if session.id.trim().is_empty() {
        return Err(SessionError::InvariantViolation(
            "session id cannot be empty".into(),
        ));
    }
    if table.sessions.contains_key(&session.id) {
        return Err(SessionError::InvariantViolation(format!(
            "session id {} is already in use",
            session.id
        )));
    }
    if let Some(name) = session.multiplexer_session_name.as_deref() {
        let clash = table.sessions.values().any(|other| {
            other.multiplexer_session_name.as_deref() == Some(name)
                && other.lifecycle_state != LifecycleState::Closed
        });
        if clash && !session.is_hidden_pane {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }
    }
    table.order.push(session.id.clone());
    table.sessions.insert(session.id.clone(), session);
    Ok(())
}
