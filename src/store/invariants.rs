//! Table-wide invariant checks and defensive normalization.
//!
//! Local mutations that would break an invariant are rejected before they are
//! committed. Tables that arrive from outside this window (a sibling broadcast
//! or the persisted file) are checked here and either refused or repaired,
//! depending on [`InvariantPolicy`]. Neither path ever crashes the window.

use crate::model::{LifecycleState, SessionTable};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// What to do when an externally sourced table breaks an invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantPolicy {
    /// Refuse the whole table and log an error. Default for debug builds.
    Reject,
    /// Repair the table and log a warning. Default for release builds.
    Normalize,
}

impl Default for InvariantPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Reject
        } else {
            Self::Normalize
        }
    }
}

/// One broken rule, attributed to the session that breaks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub session_id: String,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Detached and unowned, yet still holding a connection handle.
    DetachedWithHandle,
    /// Container without a layout, or a layout that fails validation.
    BadLayout(String),
    /// Layout references a session id that is not in the table.
    MissingPane(String),
    /// Layout references a session that is not flagged as a hidden pane.
    PaneNotHidden(String),
    /// Layout references a pane owned by a different window.
    PaneOwnerMismatch(String),
    /// Hidden pane that no container references.
    OrphanPane,
    /// Shares a multiplexer session name with an unrelated session.
    DuplicateMuxName { name: String, other: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.session_id;
        match &self.kind {
            ViolationKind::DetachedWithHandle => {
                write!(f, "{id} is detached but still holds a connection handle")
            }
            ViolationKind::BadLayout(detail) => write!(f, "{id} has a bad split layout: {detail}"),
            ViolationKind::MissingPane(pane) => write!(f, "{id} references missing pane {pane}"),
            ViolationKind::PaneNotHidden(pane) => {
                write!(f, "{id} references pane {pane} which is not hidden")
            }
            ViolationKind::PaneOwnerMismatch(pane) => {
                write!(f, "{id} references pane {pane} owned by a different window")
            }
            ViolationKind::OrphanPane => write!(f, "{id} is a hidden pane with no container"),
            ViolationKind::DuplicateMuxName { name, other } => {
                write!(f, "{id} shares multiplexer session {name} with unrelated {other}")
            }
        }
    }
}

/// Map pane id to the container that references it.
pub(crate) fn pane_parents(table: &SessionTable) -> BTreeMap<String, String> {
    let mut parents = BTreeMap::new();
    for session in table.sessions.values() {
        if let Some(layout) = session.split_layout.as_ref().filter(|_| session.is_container()) {
            for pane_id in layout.pane_ids() {
                parents
                    .entry(pane_id.to_string())
                    .or_insert_with(|| session.id.clone());
            }
        }
    }
    parents
}

/// True when `a` and `b` are the same tab or belong to one split family.
fn same_family(parents: &BTreeMap<String, String>, a: &str, b: &str) -> bool {
    let root_a = parents.get(a).map(String::as_str).unwrap_or(a);
    let root_b = parents.get(b).map(String::as_str).unwrap_or(b);
    root_a == root_b
}

/// Collect every invariant violation in the table.
pub fn check(table: &SessionTable) -> Vec<Violation> {
    let mut out = Vec::new();
    let parents = pane_parents(table);

    for session in table.iter_ordered() {
        if session.is_detached_candidate() && session.connection_handle.is_some() {
            out.push(Violation {
                session_id: session.id.clone(),
                kind: ViolationKind::DetachedWithHandle,
            });
        }

        if session.is_container() {
            let Some(layout) = session.split_layout.as_ref() else {
                out.push(Violation {
                    session_id: session.id.clone(),
                    kind: ViolationKind::BadLayout("missing layout".into()),
                });
                continue;
            };
            if let Err(detail) = layout.validate() {
                out.push(Violation {
                    session_id: session.id.clone(),
                    kind: ViolationKind::BadLayout(detail),
                });
                continue;
            }
            for pane_id in layout.pane_ids() {
                let kind = match table.sessions.get(pane_id) {
                    None => Some(ViolationKind::MissingPane(pane_id.to_string())),
                    Some(pane) if !pane.is_hidden_pane => {
                        Some(ViolationKind::PaneNotHidden(pane_id.to_string()))
                    }
                    Some(pane) if pane.owner_window_id != session.owner_window_id => {
                        Some(ViolationKind::PaneOwnerMismatch(pane_id.to_string()))
                    }
                    Some(_) => None,
                };
                if let Some(kind) = kind {
                    out.push(Violation {
                        session_id: session.id.clone(),
                        kind,
                    });
                }
            }
        } else if session.is_hidden_pane && !parents.contains_key(&session.id) {
            out.push(Violation {
                session_id: session.id.clone(),
                kind: ViolationKind::OrphanPane,
            });
        }
    }

    let mut first_by_name: BTreeMap<&str, &str> = BTreeMap::new();
    for session in table.iter_ordered() {
        let Some(name) = session.multiplexer_session_name.as_deref() else {
            continue;
        };
        if session.lifecycle_state == LifecycleState::Closed {
            continue;
        }
        match first_by_name.get(name) {
            Some(other) if !same_family(&parents, other, &session.id) => out.push(Violation {
                session_id: session.id.clone(),
                kind: ViolationKind::DuplicateMuxName {
                    name: name.to_string(),
                    other: other.to_string(),
                },
            }),
            Some(_) => {}
            None => {
                first_by_name.insert(name, &session.id);
            }
        }
    }
    out
}

/// Repair `table` in place. Returns the violations that were repaired.
///
/// Repairs, in order:
/// - a broken container is dissolved: its record is dropped and every pane it
///   referenced that still exists becomes a top-level tab in its slot;
/// - orphan hidden panes are unhidden;
/// - detached sessions lose stale connection handles;
/// - a later session duplicating an unrelated multiplexer name loses the
///   binding and moves to `error`.
pub fn normalize(table: &mut SessionTable) -> Vec<Violation> {
    table.normalize_order();
    let found = check(table);
    if found.is_empty() {
        return found;
    }

    let broken_containers: BTreeSet<String> = found
        .iter()
        .filter(|v| {
            matches!(
                v.kind,
                ViolationKind::BadLayout(_)
                    | ViolationKind::MissingPane(_)
                    | ViolationKind::PaneNotHidden(_)
                    | ViolationKind::PaneOwnerMismatch(_)
            )
        })
        .map(|v| v.session_id.clone())
        .collect();
    for container_id in &broken_containers {
        dissolve_container(table, container_id);
    }

    // Dissolving can expose new orphans, so re-check before the remaining passes.
    for violation in check(table) {
        match violation.kind {
            ViolationKind::OrphanPane => {
                if let Some(session) = table.sessions.get_mut(&violation.session_id) {
                    session.is_hidden_pane = false;
                }
            }
            ViolationKind::DetachedWithHandle => {
                if let Some(session) = table.sessions.get_mut(&violation.session_id) {
                    session.connection_handle = None;
                }
            }
            ViolationKind::DuplicateMuxName { name, other } => {
                if let Some(session) = table.sessions.get_mut(&violation.session_id) {
                    session.multiplexer_session_name = None;
                    session.connection_handle = None;
                    session.lifecycle_state = LifecycleState::Error;
                    session.error_message = Some(format!(
                        "multiplexer session {name} is already bound to {other}"
                    ));
                }
            }
            _ => {}
        }
    }

    for violation in &found {
        warn!(%violation, "normalized session table");
    }
    found
}

/// Drop a container record and promote its surviving panes in its tab slot.
pub(crate) fn dissolve_container(table: &mut SessionTable, container_id: &str) {
    let Some(container) = table.sessions.remove(container_id) else {
        return;
    };
    let panes: Vec<String> = container
        .split_layout
        .as_ref()
        .map(|layout| {
            layout
                .pane_ids()
                .filter(|id| table.sessions.contains_key(*id))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for pane_id in &panes {
        if let Some(pane) = table.sessions.get_mut(pane_id) {
            pane.is_hidden_pane = false;
        }
    }
    let slot = table.order.iter().position(|id| id == container_id);
    table.order.retain(|id| id != container_id && !panes.contains(id));
    let at = slot.unwrap_or(table.order.len()).min(table.order.len());
    for (offset, pane_id) in panes.into_iter().enumerate() {
        table.order.insert(at + offset, pane_id);
    }
}
