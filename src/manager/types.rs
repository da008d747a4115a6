//! Types exchanged with callers of the memory manager.

use serde::{Deserialize, Serialize};

use crate::memory::{DomainContext, EpisodicPattern, Insight, MemoryItem, UserProfile};

use super::user_id_for;

/// A working-memory item with its relevance to the current query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub item: MemoryItem,
    pub relevance: f64,
}

/// Where a ranked insight came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "record", rename_all = "snake_case")]
pub enum InsightSource {
    Session(Insight),
    Episodic(EpisodicPattern),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedInsight {
    pub source: InsightSource,
    pub relevance: f64,
}

impl RankedInsight {
    pub fn is_episodic(&self) -> bool {
        matches!(self.source, InsightSource::Episodic(_))
    }
}

/// Everything retrieved for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    /// Relevant history, best first
    pub history: Vec<RankedItem>,
    pub user_profile: UserProfile,
    /// Session insights and episodic patterns, best first
    pub insights: Vec<RankedInsight>,
    pub domain_context: DomainContext,
    /// Mean of history fill, insight fill, profile completeness and domain confidence
    pub quality_score: f64,
    pub retrieval_ms: u64,
}

impl ConversationContext {
    /// Context with nothing retrieved and a default profile.
    pub fn empty(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let user_profile = UserProfile::new(user_id_for(&session_id));
        Self {
            session_id,
            history: Vec::new(),
            user_profile,
            insights: Vec::new(),
            domain_context: DomainContext::default(),
            quality_score: 0.0,
            retrieval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Outcome of a troubleshooting exchange, consolidated into memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TroubleshootingResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    /// How well the solution worked, in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effectiveness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl TroubleshootingResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_cause(mut self, root_cause: impl Into<String>) -> Self {
        self.root_cause = Some(root_cause.into());
        self
    }

    pub fn solution(mut self, solution: impl Into<String>) -> Self {
        self.solution = Some(solution.into());
        self
    }

    pub fn solution_type(mut self, solution_type: impl Into<String>) -> Self {
        self.solution_type = Some(solution_type.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn effectiveness(mut self, effectiveness: f64) -> Self {
        self.effectiveness = Some(effectiveness);
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Lifecycle of a background consolidation.
///
/// `Scheduled -> Running -> {Completed | Failed}`, and `Scheduled | Running
/// -> Cancelled` when a newer request for the same session supersedes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationState {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ConsolidationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// At least one external collaborator is not configured
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub vector_store_available: bool,
    pub session_store_available: bool,
    pub llm_available: bool,
    pub live_consolidations: usize,
    pub working_sessions: usize,
    pub working_items: usize,
    pub session_caches: usize,
    pub user_profiles: usize,
    pub episodic_patterns: usize,
}

/// Counters kept by the manager since construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub retrievals: u64,
    /// Retrievals slower than the latency target
    pub slow_retrievals: u64,
    pub avg_retrieval_ms: f64,
    pub last_retrieval_ms: u64,
    /// Retrieval branches that failed, panicked or timed out
    pub degraded_branches: u64,
    pub consolidations_scheduled: u64,
    pub consolidations_completed: u64,
    pub consolidations_failed: u64,
    pub consolidations_cancelled: u64,
}
