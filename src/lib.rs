//! # layered-memory
//!
//! Layered conversational memory for troubleshooting assistants.
//!
//! ## Core Components
//!
//! - **Working memory**: bounded, importance-ranked recent turns per session
//! - **Session memory**: insights of one session, with pattern detection
//! - **User memory**: long-lived user profiles
//! - **Episodic memory**: patterns shared across sessions
//! - **Memory manager**: concurrent context retrieval and background consolidation
//!
//! External services (LLM, vector store, durable store, sanitizer) are
//! consumed through the traits in [`collaborators`]. All of them are optional.
//!
//! ## Example
//!
//! ```rust,ignore
//! use layered_memory::{MemoryManager, SqliteSessionStore};
//! use std::sync::Arc;
//!
//! let manager = MemoryManager::builder()
//!     .session_store(Arc::new(SqliteSessionStore::open("memory.db")?))
//!     .build()?;
//!
//! let context = manager.retrieve_context("session-1", "dns lookups time out").await?;
//! println!("domain: {}", context.domain_context.primary_domain);
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod relevance;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use collaborators::{
    DocumentMetadata, LlmProvider, Sanitizer, SearchHit, SessionStore, VectorDocument,
    VectorStore, EPISODIC_DOCUMENT_KIND,
};
pub use config::{
    EpisodicConfig, MemoryConfig, RetrievalConfig, SessionMemoryConfig, WorkingMemoryConfig,
};
pub use error::{Error, Result};
pub use manager::{
    user_id_for, Complexity, ConsolidationState, ConversationContext, HealthReport, HealthStatus,
    InsightSource, ManagerStats, MemoryManager, MemoryManagerBuilder, RankedInsight, RankedItem,
    TroubleshootingResult, SOLUTION_EFFECTIVENESS,
};
pub use memory::{
    CommunicationStyle, DomainContext, EpisodicMemory, EpisodicPattern, Insight, InsightPayload,
    InsightType, InteractionRecord, MemoryContent, MemoryItem, Pattern, PatternData,
    PatternPayload, ProfileUpdate, ScoredPattern, SessionMemory, SkillLevel, TechnicalDomain,
    Turn, UserMemory, UserProfile, WorkingMemory,
};
pub use store::{InMemorySessionStore, SqliteSessionStore};
