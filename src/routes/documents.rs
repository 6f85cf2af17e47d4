//! Document routes: read-only presence lookup.

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;

use crate::event::{ActiveUser, DocumentId};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub document_id: DocumentId,
    pub users: Vec<ActiveUser>,
}

/// `GET /api/documents/{id}/presence` lists who is in the document's room now.
pub async fn presence(State(state): State<AppState>, Path(id): Path<String>) -> Json<PresenceResponse> {
    let users = state.sessions.active_users(&id);
    Json(PresenceResponse { document_id: id, users })
}
