//! Event: the wire vocabulary between editors and the session server.
//!
//! ARCHITECTURE
//! ============
//! Every message on the socket is a JSON object of the shape
//! `{"event": "<name>", "data": {...}}`. Clients send `ClientEvent`s, the
//! session layer emits `ServerEvent`s, and the transport serializes them
//! without inspecting `data`.
//!
//! DESIGN
//! ======
//! - Event names are kebab-case, payload fields are camelCase.
//! - Cursor positions and selections are opaque JSON: the server relays them
//!   and never interprets them.
//! - Optional payload fields are omitted from the wire when absent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Opaque document key. Rooms, presence, and pending saves are keyed by it.
pub type DocumentId = String;

/// Client-supplied participant identity (`userId` on the wire).
pub type ParticipantId = String;

/// Server-assigned identity of one live socket.
pub type ConnectionId = Uuid;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured `error` events.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ErrorCode for EventError {
    fn error_code(&self) -> &'static str {
        "E_INVALID_EVENT"
    }
}

// =============================================================================
// CLIENT EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinDocument(JoinDocument),
    LeaveDocument(LeaveDocument),
    ContentChange(ContentChange),
    CursorMove(CursorMove),
}

impl ClientEvent {
    /// Parse one inbound text message.
    ///
    /// # Errors
    ///
    /// Returns `EventError::Malformed` for invalid JSON, unknown event names,
    /// or payloads missing required fields.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinDocument(_) => "join-document",
            Self::LeaveDocument(_) => "leave-document",
            Self::ContentChange(_) => "content-change",
            Self::CursorMove(_) => "cursor-move",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDocument {
    pub document_id: DocumentId,
    pub user_id: ParticipantId,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveDocument {
    pub document_id: DocumentId,
    pub user_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChange {
    pub document_id: DocumentId,
    pub user_id: ParticipantId,
    /// Full document text after the edit. Last write wins.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMove {
    pub document_id: DocumentId,
    pub user_id: ParticipantId,
    pub user_name: String,
    pub position: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<serde_json::Value>,
}

// =============================================================================
// SERVER EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Unicast to a joiner: the document as it stands right now.
    DocumentLoaded(DocumentLoaded),
    /// Room-wide presence list, one entry per participant.
    ActiveUsers(ActiveUsers),
    ContentUpdated(ContentUpdated),
    CursorMoved(CursorMoved),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLoaded {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub user_id: ParticipantId,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUsers {
    pub users: Vec<ActiveUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUpdated {
    pub user_id: ParticipantId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMoved {
    pub user_id: ParticipantId,
    pub user_name: String,
    pub position: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl ServerEvent {
    /// Create an error event from a plain message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent { message: message.into(), code: None, retryable: false })
    }

    /// Create a structured error event from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error(ErrorEvent {
            message: err.to_string(),
            code: Some(err.error_code().to_owned()),
            retryable: err.retryable(),
        })
    }

    /// Wire name, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DocumentLoaded(_) => "document-loaded",
            Self::ActiveUsers(_) => "active-users",
            Self::ContentUpdated(_) => "content-updated",
            Self::CursorMoved(_) => "cursor-moved",
            Self::Error(_) => "error",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
