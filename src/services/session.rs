//! Session manager: join/leave/edit/cursor orchestration and fan-out.
//!
//! ARCHITECTURE
//! ============
//! The manager is the only component with externally observable behavior.
//! It wires the room registry (who is where), the save coalescer (when
//! content reaches storage), and the connection hub (delivery).
//!
//! A connection is either unbound or bound to exactly one document. Joining
//! binds it, leaving or disconnecting unbinds it. Joining a second document
//! leaves the first one.
//!
//! DESIGN
//! ======
//! - Recipients are computed here, as room members minus the sender where
//!   the event must not echo. The hub just delivers to that list.
//! - Fan-out happens inside the registry callbacks, under the document's
//!   room lock. Peers see presence and content in the order it was applied,
//!   and the last content relayed is the last content recorded for storage.
//! - Only the document load on join awaits. Presence mutations and fan-out
//!   are synchronous, so a slow join never stalls traffic in any room.
//! - Edits are broadcast before and independently of persistence. Storage
//!   lags live state by at most the quiet period plus one write.
//! - No merging: the last content received wins.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::event::{
    ActiveUser, ActiveUsers, ConnectionId, ContentChange, ContentUpdated, CursorMove, CursorMoved, DocumentLoaded,
    ErrorCode, JoinDocument, LeaveDocument, ServerEvent,
};
use crate::services::coalescer::SaveCoalescer;
use crate::services::document::{DocumentError, DocumentStore};
use crate::services::hub::ConnectionHub;
use crate::services::presence::{PresenceSnapshot, RoomRegistry};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("documentId must not be empty")]
    InvalidDocumentId,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidDocumentId => "E_INVALID_DOCUMENT_ID",
            Self::Document(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::InvalidDocumentId => false,
            Self::Document(e) => e.retryable(),
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn DocumentStore>,
    registry: Arc<RoomRegistry>,
    coalescer: SaveCoalescer,
    hub: Arc<ConnectionHub>,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, save_debounce: Duration) -> Self {
        Self {
            coalescer: SaveCoalescer::new(Arc::clone(&store), save_debounce),
            store,
            registry: Arc::new(RoomRegistry::new()),
            hub: Arc::new(ConnectionHub::new()),
        }
    }

    #[must_use]
    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Documents with a save still waiting on the quiet window or in flight.
    #[must_use]
    pub fn pending_saves(&self) -> usize {
        self.coalescer.pending_count()
    }

    // =========================================================================
    // JOIN / LEAVE
    // =========================================================================

    /// Load the document, bind the connection, and announce the new presence.
    ///
    /// The joiner receives `document-loaded` first, then every member of the
    /// room (joiner included) receives `active-users`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocumentId` for an empty id and `Document` when the
    /// load fails. Nothing is bound or broadcast in either case.
    pub async fn join(&self, connection_id: ConnectionId, req: JoinDocument) -> Result<(), SessionError> {
        if req.document_id.is_empty() {
            return Err(SessionError::InvalidDocumentId);
        }

        let record = self.store.load(&req.document_id).await?;

        if let Some(previous) = self.registry.bound_document(connection_id) {
            if previous != req.document_id {
                debug!(%connection_id, document_id = %previous, "leaving previous document before join");
                self.disconnect(connection_id);
            }
        }

        let mut loaded = DocumentLoaded::from(record);
        let snapshot = self.registry.join(
            &req.document_id,
            &req.user_id,
            &req.user_name,
            connection_id,
            |snapshot| {
                // Storage lags live edits by up to one quiet period.
                if let Some(content) = self.coalescer.latest_content(&req.document_id) {
                    loaded.content = content;
                }
                self.hub.send(connection_id, &ServerEvent::DocumentLoaded(loaded));
                self.announce_presence(snapshot);
            },
        );
        info!(
            document_id = %req.document_id,
            %connection_id,
            user_id = %req.user_id,
            participants = snapshot.users.len(),
            "participant joined document"
        );
        Ok(())
    }

    /// Remove a participant and tell the remaining members.
    pub fn leave(&self, connection_id: ConnectionId, req: LeaveDocument) {
        let Some(snapshot) = self
            .registry
            .leave(&req.document_id, &req.user_id, connection_id, |snapshot| {
                self.announce_presence(snapshot);
            })
        else {
            debug!(document_id = %req.document_id, %connection_id, user_id = %req.user_id, "leave for absent participant ignored");
            return;
        };
        info!(
            document_id = %req.document_id,
            %connection_id,
            user_id = %req.user_id,
            remaining = snapshot.users.len(),
            "participant left document"
        );
    }

    /// Transport-level close. Unknown or already-cleaned connections are a no-op.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let Some((document_id, snapshot)) = self
            .registry
            .on_disconnect(connection_id, |snapshot| self.announce_presence(snapshot))
        else {
            return;
        };
        info!(%document_id, %connection_id, remaining = snapshot.users.len(), "participant disconnected");
    }

    // =========================================================================
    // EDIT / CURSOR
    // =========================================================================

    /// Record new content for debounced storage and relay it to the other
    /// members immediately.
    pub fn change_content(&self, connection_id: ConnectionId, change: ContentChange) {
        let ContentChange { document_id, user_id, content, cursor_position } = change;
        let relayed = self.registry.with_peers(&document_id, connection_id, |peers| {
            self.coalescer.record_edit(&document_id, content.clone());
            let event = ServerEvent::ContentUpdated(ContentUpdated { user_id, content, cursor_position });
            self.hub.send_many(peers, &event)
        });

        match relayed {
            Some(delivered) => debug!(%document_id, %connection_id, delivered, "content relayed"),
            None => debug!(%document_id, %connection_id, "content-change from unbound connection ignored"),
        }
    }

    /// Relay a cursor position to the other members. Nothing is retained.
    pub fn move_cursor(&self, connection_id: ConnectionId, mv: CursorMove) {
        let CursorMove { document_id, user_id, user_name, position, selection } = mv;
        self.registry.with_peers(&document_id, connection_id, |peers| {
            let event = ServerEvent::CursorMoved(CursorMoved { user_id, user_name, position, selection });
            self.hub.send_many(peers, &event);
        });
    }

    /// Presence list for a document, for read-only inspection.
    #[must_use]
    pub fn active_users(&self, document_id: &str) -> Vec<ActiveUser> {
        self.registry.presence(document_id)
    }

    /// Store every pending save immediately. Used on graceful shutdown.
    pub async fn flush_pending(&self) {
        self.coalescer.flush_all().await;
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn announce_presence(&self, snapshot: &PresenceSnapshot) {
        if snapshot.connections.is_empty() {
            return;
        }
        let event = ServerEvent::ActiveUsers(ActiveUsers { users: snapshot.users.clone() });
        let delivered = self.hub.send_many(&snapshot.connections, &event);
        if delivered < snapshot.connections.len() {
            warn!(
                expected = snapshot.connections.len(),
                delivered, "active-users not delivered to every member"
            );
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
