//! Presence service: per-document rooms and the connection index.
//!
//! DESIGN
//! ======
//! A room maps participant id → presence entry, so a participant occupies at
//! most one slot per document no matter how many times they reconnect. The
//! newest connection wins the slot. A reverse index maps every bound
//! connection to its (participant, document) pair so a dropped socket can be
//! cleaned up without scanning rooms.
//!
//! Rooms live in a `DashMap` keyed by document id. Each mutation runs under
//! that document's shard lock, which serializes operations on one document
//! without a global critical section. Index updates happen while the room
//! lock is held. Lock order is always rooms → bindings; binding refs are
//! dropped before any room is locked.
//!
//! Callers deliver from inside the `notify` / `with_peers` callbacks so that
//! fan-out for one document leaves in the order the mutations were applied.
//! Callbacks must not call back into the registry.
//!
//! LIFECYCLE
//! =========
//! A room is created by the first join and removed, in the same locked step,
//! by the operation that empties it.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::event::{ActiveUser, ConnectionId, DocumentId, ParticipantId};

// =============================================================================
// TYPES
// =============================================================================

/// A participant's occupancy record within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub user_id: ParticipantId,
    pub user_name: String,
    /// Join order within the room. Kept across reconnects.
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    user_id: ParticipantId,
    document_id: DocumentId,
}

#[derive(Debug, Default)]
struct Room {
    entries: HashMap<ParticipantId, PresenceEntry>,
    next_seq: u64,
}

impl Room {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut entries: Vec<&PresenceEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        PresenceSnapshot {
            users: entries
                .iter()
                .map(|e| ActiveUser { user_id: e.user_id.clone(), user_name: e.user_name.clone() })
                .collect(),
            connections: entries.iter().map(|e| e.connection_id).collect(),
        }
    }
}

/// Room membership as of one mutation: the de-duplicated participant list and
/// the connection currently representing each of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub users: Vec<ActiveUser>,
    pub connections: Vec<ConnectionId>,
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<DocumentId, Room>,
    bindings: DashMap<ConnectionId, Binding>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `user_id`'s entry and bind `connection_id` to it.
    ///
    /// A connection rejoining the same document under another participant id
    /// gives up its old entry. A connection whose entry is taken over by this
    /// join loses its binding. `notify` runs with the new snapshot before the
    /// room lock is released.
    pub fn join(
        &self,
        document_id: &str,
        user_id: &str,
        user_name: &str,
        connection_id: ConnectionId,
        notify: impl FnOnce(&PresenceSnapshot),
    ) -> PresenceSnapshot {
        let mut room = self.rooms.entry(document_id.to_owned()).or_default();

        let renamed_from = self
            .bindings
            .get(&connection_id)
            .filter(|b| b.document_id == document_id && b.user_id != user_id)
            .map(|b| b.user_id.clone());
        if let Some(old_user_id) = renamed_from {
            if room
                .entries
                .get(&old_user_id)
                .is_some_and(|e| e.connection_id == connection_id)
            {
                room.entries.remove(&old_user_id);
            }
        }

        let previous = room.entries.get(user_id).map(|e| (e.seq, e.connection_id));
        let seq = if let Some((seq, _)) = previous {
            seq
        } else {
            room.next_seq += 1;
            room.next_seq
        };
        room.entries.insert(
            user_id.to_owned(),
            PresenceEntry {
                connection_id,
                user_id: user_id.to_owned(),
                user_name: user_name.to_owned(),
                seq,
            },
        );
        if let Some((_, superseded)) = previous.filter(|(_, owner)| *owner != connection_id) {
            self.unbind_if_matches(superseded, user_id, document_id);
        }
        self.bindings.insert(
            connection_id,
            Binding { user_id: user_id.to_owned(), document_id: document_id.to_owned() },
        );

        let snapshot = room.snapshot();
        notify(&snapshot);
        snapshot
    }

    /// Remove `user_id` from the room. `None` if the room or entry is absent.
    ///
    /// Bindings that pointed at this participant/document pair, whether held
    /// by the caller or by the connection that owned the entry, are dropped.
    /// `notify` runs under the room lock, only when an entry was removed.
    pub fn leave(
        &self,
        document_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
        notify: impl FnOnce(&PresenceSnapshot),
    ) -> Option<PresenceSnapshot> {
        let mut snapshot = None;
        self.rooms.remove_if_mut(document_id, |_, room| {
            let Some(entry) = room.entries.remove(user_id) else {
                return false;
            };
            self.unbind_if_matches(connection_id, user_id, document_id);
            self.unbind_if_matches(entry.connection_id, user_id, document_id);
            let current = room.snapshot();
            notify(&current);
            let empty = current.users.is_empty();
            snapshot = Some(current);
            empty
        });
        snapshot
    }

    /// Clean up after a dropped connection.
    ///
    /// Returns the document and its remaining presence if this connection
    /// still owned a room entry. A connection whose entry was taken over by a
    /// newer connection only loses its binding. `notify` runs under the room
    /// lock, only when an entry was removed.
    pub fn on_disconnect(
        &self,
        connection_id: ConnectionId,
        notify: impl FnOnce(&PresenceSnapshot),
    ) -> Option<(DocumentId, PresenceSnapshot)> {
        let binding = self.bindings.get(&connection_id).map(|b| b.value().clone())?;

        let mut snapshot = None;
        self.rooms.remove_if_mut(&binding.document_id, |_, room| {
            let owned = room
                .entries
                .get(&binding.user_id)
                .is_some_and(|e| e.connection_id == connection_id);
            if owned {
                room.entries.remove(&binding.user_id);
            }
            self.unbind_if_matches(connection_id, &binding.user_id, &binding.document_id);
            if !owned {
                return false;
            }
            let current = room.snapshot();
            notify(&current);
            let empty = current.users.is_empty();
            snapshot = Some(current);
            empty
        });

        // Room already gone: the binding is stale either way.
        self.unbind_if_matches(connection_id, &binding.user_id, &binding.document_id);

        snapshot.map(|s| (binding.document_id, s))
    }

    /// Document the connection is currently bound to.
    #[must_use]
    pub fn bound_document(&self, connection_id: ConnectionId) -> Option<DocumentId> {
        self.bindings
            .get(&connection_id)
            .map(|b| b.document_id.clone())
    }

    /// Run `f` with the room's other members if `connection_id` is bound to
    /// the document. The room is held exclusively while `f` runs, so relays
    /// on one document are applied and delivered in a single order.
    pub fn with_peers<R>(
        &self,
        document_id: &str,
        connection_id: ConnectionId,
        f: impl FnOnce(&[ConnectionId]) -> R,
    ) -> Option<R> {
        let room = self.rooms.get_mut(document_id)?;
        let bound = self
            .bindings
            .get(&connection_id)
            .is_some_and(|b| b.document_id == document_id);
        if !bound {
            return None;
        }
        let peers: Vec<ConnectionId> = room
            .snapshot()
            .connections
            .into_iter()
            .filter(|member| *member != connection_id)
            .collect();
        Some(f(&peers))
    }

    /// De-duplicated participant list for a room; empty for unknown rooms.
    #[must_use]
    pub fn presence(&self, document_id: &str) -> Vec<ActiveUser> {
        self.rooms
            .get(document_id)
            .map(|room| room.snapshot().users)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn unbind_if_matches(&self, connection_id: ConnectionId, user_id: &str, document_id: &str) {
        self.bindings
            .remove_if(&connection_id, |_, b| b.user_id == user_id && b.document_id == document_id);
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
