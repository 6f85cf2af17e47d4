//! Document service: the storage port used by collaboration sessions.
//!
//! DESIGN
//! ======
//! Sessions need exactly two things from storage: the current document when
//! a client joins, and a place to overwrite content when a debounced save
//! fires. `DocumentStore` is that seam. `PgDocumentStore` is the production
//! adapter; tests swap in an in-memory store.
//!
//! Document CRUD and metadata live outside this server. A store write for an
//! id that no longer exists surfaces as `NotFound`.

use sqlx::PgPool;

use crate::event::{DocumentId, DocumentLoaded, ErrorCode};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for DocumentError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_DOCUMENT_NOT_FOUND",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Row returned from document loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
}

impl From<DocumentRecord> for DocumentLoaded {
    fn from(record: DocumentRecord) -> Self {
        Self { id: record.id, title: record.title, content: record.content }
    }
}

// =============================================================================
// PORT
// =============================================================================

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the current persisted document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `Database` for storage failures.
    async fn load(&self, document_id: &str) -> Result<DocumentRecord, DocumentError>;

    /// Overwrite the persisted content of a document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `Database` for storage failures.
    async fn store(&self, document_id: &str, content: &str) -> Result<(), DocumentError>;
}

// =============================================================================
// POSTGRES ADAPTER
// =============================================================================

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DocumentStore for PgDocumentStore {
    async fn load(&self, document_id: &str) -> Result<DocumentRecord, DocumentError> {
        // Ids are compared as text so a malformed id is a miss, not a cast error.
        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT id::text, title, content FROM documents WHERE id::text = $1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, title, content)) = row else {
            return Err(DocumentError::NotFound(document_id.to_owned()));
        };
        Ok(DocumentRecord { id, title, content })
    }

    async fn store(&self, document_id: &str, content: &str) -> Result<(), DocumentError> {
        let result = sqlx::query("UPDATE documents SET content = $2, updated_at = now() WHERE id::text = $1")
            .bind(document_id)
            .bind(content)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DocumentError::NotFound(document_id.to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;
