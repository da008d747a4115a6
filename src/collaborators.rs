//! Interfaces to the services this crate consumes but does not implement.
//!
//! Every collaborator is optional. The memory tiers treat a missing or failing
//! collaborator as "no external result" and fall back to local behavior.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Document kind under which episodic patterns are indexed.
pub const EPISODIC_DOCUMENT_KIND: &str = "episodic_pattern";

/// Text generation used for insight extraction.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion for a single prompt.
    async fn generate_response(&self, prompt: &str) -> Result<String>;
}

/// Metadata attached to an indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Producer of the document; episodic patterns use [`EPISODIC_DOCUMENT_KIND`]
    pub kind: String,
    pub pattern_type: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
}

/// A document in the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    /// Text that gets embedded
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// A search hit, with similarity in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document: VectorDocument,
    pub score: f64,
}

/// Semantic search over indexed documents.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Return up to `k` documents ranked by similarity to `query`.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;

    /// Index documents.
    async fn add_documents(&self, documents: Vec<VectorDocument>) -> Result<()>;
}

/// Durable key/blob storage for session insights and user profiles.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, blob: String) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Redaction applied to user-provided values before they are stored.
#[async_trait]
pub trait Sanitizer: Send + Sync {
    async fn sanitize(&self, value: Value) -> Result<Value>;
}
