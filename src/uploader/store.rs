//! Trait abstraction for the document store to enable testing

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failures reported by a document store
///
/// `Conflict` is the only outcome worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Document changed underneath us (HTTP 409)
    #[error("conflict on document {0}")]
    Conflict(String),

    /// Not allowed to write (HTTP 401/403)
    #[error("forbidden (HTTP {status})")]
    Forbidden { status: u16 },

    /// Document does not exist (HTTP 404)
    #[error("document not found: {0}")]
    NotFound(String),

    /// Any other HTTP failure
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Document refused before it was sent
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Connection level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Server answered something we could not understand
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Query options passed to a view, values already JSON encoded
pub type ViewOptions = Vec<(String, String)>;

/// Document store operations used by the uploader
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id
    async fn get_doc(&self, doc_id: &str) -> Result<Value, StoreError>;

    /// Write a document under `doc_id`, returning its new revision
    async fn put_doc(&self, doc_id: &str, doc: &Value) -> Result<String, StoreError>;

    /// Create a new document, returning the id the server allocated
    async fn save_doc(&self, doc: &Value) -> Result<String, StoreError>;

    /// Run the update handler `design/update_name` against `doc_id`
    async fn update_put(
        &self,
        design: &str,
        update_name: &str,
        doc_id: &str,
        payload: &Value,
    ) -> Result<String, StoreError>;

    /// Query the view `design/view_name`
    async fn view(
        &self,
        design: &str,
        view_name: &str,
        options: &ViewOptions,
    ) -> Result<Value, StoreError>;
}
