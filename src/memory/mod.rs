//! The four memory tiers.
//!
//! - **Working**: bounded, importance-ranked recent turns and insights per session
//! - **Session**: every insight of a session, with pattern detection
//! - **User**: long-lived profile per user
//! - **Episodic**: patterns shared across sessions, searchable by similarity
//!
//! ## Example
//!
//! ```rust,ignore
//! use layered_memory::memory::{InsightPayload, SessionMemory};
//!
//! let memory = SessionMemory::in_memory();
//! memory
//!     .store_insight("s1", "root_cause", InsightPayload::new("disk full"), 0.9)
//!     .await?;
//! let patterns = memory.detect_patterns("s1").await?;
//! ```

mod episodic;
mod locks;
mod session;
mod types;
mod user;
mod working;

pub use episodic::EpisodicMemory;
pub use session::SessionMemory;
pub use types::{
    CommunicationStyle, DomainContext, EmergingPattern, EpisodicPattern, GlobalPatternAnalysis,
    HistoricalContext, Insight, InsightPayload, InsightType, InteractionPatterns,
    InteractionPatternsUpdate, InteractionRecord, MemoryContent, MemoryItem, Pattern, PatternData,
    PatternKind, PatternPayload, ProfileUpdate, ScoredPattern, SkillLevel, TechnicalDomain, Turn,
    UserProfile,
};
pub use user::UserMemory;
pub use working::WorkingMemory;
