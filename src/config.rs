//! Configuration for the memory hierarchy.
//!
//! Every section has serde defaults, so a partial JSON document (or an empty
//! one) is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Working memory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingMemoryConfig {
    /// Maximum items retained per session
    pub max_items: usize,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self { max_items: 20 }
    }
}

/// Session and user memory persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMemoryConfig {
    /// When true, a failed write-through is an error instead of a warning
    pub durable: bool,
}

impl Default for SessionMemoryConfig {
    fn default() -> Self {
        Self { durable: false }
    }
}

/// Episodic memory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodicConfig {
    /// Results requested from the vector store and returned to callers
    pub search_top_k: usize,
    /// Minimum keyword similarity for the local fallback
    pub similarity_threshold: f64,
    /// Local fallback bound per pattern type (oldest evicted first)
    pub max_patterns_per_type: usize,
    /// Window used to decide whether a pattern type is emerging
    pub emerging_window_days: i64,
    /// Share of recent instances that makes a type emerging
    pub emerging_ratio: f64,
}

impl Default for EpisodicConfig {
    fn default() -> Self {
        Self {
            search_top_k: 5,
            similarity_threshold: 0.2,
            max_patterns_per_type: 500,
            emerging_window_days: 7,
            emerging_ratio: 0.3,
        }
    }
}

/// Context retrieval settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Advisory latency target; slower retrievals are logged
    pub latency_target_ms: u64,
    /// Hard deadline per retrieval branch
    pub branch_timeout_ms: u64,
    /// History items kept after the first ranking pass
    pub history_candidates: usize,
    /// History items emitted
    pub max_history: usize,
    /// Insights emitted
    pub max_insights: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            latency_target_ms: 50,
            branch_timeout_ms: 250,
            history_candidates: 10,
            max_history: 8,
            max_insights: 6,
        }
    }
}

/// Top-level configuration for a [`MemoryManager`](crate::MemoryManager).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub working: WorkingMemoryConfig,
    pub session: SessionMemoryConfig,
    pub episodic: EpisodicConfig,
    pub retrieval: RetrievalConfig,
}

impl MemoryConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("LAYERED_MEMORY_MAX_ITEMS") {
            config.working.max_items = v;
        }
        if let Ok(v) = std::env::var("LAYERED_MEMORY_DURABLE") {
            config.session.durable = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_parse("LAYERED_MEMORY_EPISODIC_TOP_K") {
            config.episodic.search_top_k = v;
        }
        if let Some(v) = env_parse("LAYERED_MEMORY_EPISODIC_MAX_PER_TYPE") {
            config.episodic.max_patterns_per_type = v;
        }
        if let Some(v) = env_parse("LAYERED_MEMORY_LATENCY_TARGET_MS") {
            config.retrieval.latency_target_ms = v;
        }
        if let Some(v) = env_parse("LAYERED_MEMORY_BRANCH_TIMEOUT_MS") {
            config.retrieval.branch_timeout_ms = v;
        }

        config
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check bounds and thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.working.max_items == 0 {
            return Err(Error::Config("working.max_items must be at least 1".into()));
        }
        if self.episodic.search_top_k == 0 {
            return Err(Error::Config("episodic.search_top_k must be at least 1".into()));
        }
        if self.episodic.max_patterns_per_type == 0 {
            return Err(Error::Config(
                "episodic.max_patterns_per_type must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.episodic.similarity_threshold) {
            return Err(Error::Config(
                "episodic.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.episodic.emerging_ratio) {
            return Err(Error::Config(
                "episodic.emerging_ratio must be within [0, 1]".into(),
            ));
        }
        if self.retrieval.branch_timeout_ms == 0 {
            return Err(Error::Config(
                "retrieval.branch_timeout_ms must be at least 1".into(),
            ));
        }
        if self.retrieval.max_history > self.retrieval.history_candidates {
            return Err(Error::Config(
                "retrieval.max_history cannot exceed retrieval.history_candidates".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
