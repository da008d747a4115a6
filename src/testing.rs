//! Collaborator doubles shared by the unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::collaborators::{
    LlmProvider, Sanitizer, SearchHit, SessionStore, VectorDocument, VectorStore,
};
use crate::error::{Error, Result};
use crate::relevance::keyword_similarity;
use crate::store::InMemorySessionStore;

/// Session store whose every call fails.
pub struct FailingSessionStore;

#[async_trait]
impl SessionStore for FailingSessionStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::collaborator("session_store", "connection refused"))
    }

    async fn set(&self, _key: &str, _blob: String) -> Result<()> {
        Err(Error::collaborator("session_store", "connection refused"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(Error::collaborator("session_store", "connection refused"))
    }
}

/// Shared in-memory store whose first reads fail and whose first write can
/// be slowed down.
pub struct FlakySessionStore {
    inner: InMemorySessionStore,
    failing_gets: AtomicUsize,
    slow_sets: AtomicUsize,
    set_delay: Duration,
}

impl FlakySessionStore {
    pub fn new(inner: InMemorySessionStore) -> Self {
        Self {
            inner,
            failing_gets: AtomicUsize::new(0),
            slow_sets: AtomicUsize::new(0),
            set_delay: Duration::ZERO,
        }
    }

    /// Fail the next `count` reads.
    pub fn failing_gets(self, count: usize) -> Self {
        self.failing_gets.store(count, Ordering::SeqCst);
        self
    }

    /// Delay the next write by `delay`.
    pub fn slow_first_set(mut self, delay: Duration) -> Self {
        self.slow_sets.store(1, Ordering::SeqCst);
        self.set_delay = delay;
        self
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SessionStore for FlakySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if Self::take(&self.failing_gets) {
            return Err(Error::collaborator("session_store", "read timed out"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, blob: String) -> Result<()> {
        if Self::take(&self.slow_sets) {
            tokio::time::sleep(self.set_delay).await;
        }
        self.inner.set(key, blob).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

/// LLM that answers every prompt with the same text.
pub struct MockLlm {
    response: String,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn generate_response(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.response.clone())
    }
}

pub struct FailingLlm;

#[async_trait]
impl LlmProvider for FailingLlm {
    async fn generate_response(&self, _prompt: &str) -> Result<String> {
        Err(Error::collaborator("llm", "rate limited"))
    }
}

/// In-memory vector store scored by keyword overlap.
#[derive(Default)]
pub struct KeywordVectorStore {
    documents: RwLock<Vec<VectorDocument>>,
}

impl KeywordVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait]
impl VectorStore for KeywordVectorStore {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let documents = self.documents.read().await;
        let mut hits: Vec<SearchHit> = documents
            .iter()
            .map(|document| SearchHit {
                score: keyword_similarity(query, &document.text),
                document: document.clone(),
            })
            .filter(|hit| hit.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn add_documents(&self, documents: Vec<VectorDocument>) -> Result<()> {
        self.documents.write().await.extend(documents);
        Ok(())
    }
}

pub struct FailingVectorStore;

#[async_trait]
impl VectorStore for FailingVectorStore {
    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<SearchHit>> {
        Err(Error::collaborator("vector_store", "index unavailable"))
    }

    async fn add_documents(&self, _documents: Vec<VectorDocument>) -> Result<()> {
        Err(Error::collaborator("vector_store", "index unavailable"))
    }
}

/// Vector store that panics on search.
pub struct PanickingVectorStore;

#[async_trait]
impl VectorStore for PanickingVectorStore {
    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<SearchHit>> {
        panic!("vector store exploded");
    }

    async fn add_documents(&self, _documents: Vec<VectorDocument>) -> Result<()> {
        Ok(())
    }
}

/// Vector store that never answers within any reasonable deadline.
pub struct SlowVectorStore {
    pub delay: Duration,
}

#[async_trait]
impl VectorStore for SlowVectorStore {
    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<SearchHit>> {
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }

    async fn add_documents(&self, _documents: Vec<VectorDocument>) -> Result<()> {
        Ok(())
    }
}

/// Replaces every occurrence of a secret in string values.
pub struct RedactingSanitizer {
    pub secret: String,
}

#[async_trait]
impl Sanitizer for RedactingSanitizer {
    async fn sanitize(&self, value: Value) -> Result<Value> {
        Ok(redact(value, &self.secret))
    }
}

fn redact(value: Value, secret: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(secret, "[REDACTED]")),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| redact(v, secret)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, redact(v, secret)))
                .collect(),
        ),
        other => other,
    }
}

pub struct FailingSanitizer;

#[async_trait]
impl Sanitizer for FailingSanitizer {
    async fn sanitize(&self, _value: Value) -> Result<Value> {
        Err(Error::collaborator("sanitizer", "policy engine offline"))
    }
}
