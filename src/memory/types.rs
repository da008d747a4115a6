//! Data model shared by the four memory tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::relevance::{clamp_unit, recency_decay};

/// Generate a fresh record id.
pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Kind of insight produced by troubleshooting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InsightType {
    RootCause,
    Solution,
    Error,
    Pattern,
    Other(String),
}

impl InsightType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RootCause => "root_cause",
            Self::Solution => "solution",
            Self::Error => "error",
            Self::Pattern => "pattern",
            Self::Other(name) => name,
        }
    }

    /// Importance multiplier used when an insight enters working memory.
    pub fn importance_multiplier(&self) -> f64 {
        match self {
            Self::RootCause => 1.3,
            Self::Solution => 1.2,
            Self::Error => 1.1,
            _ => 1.0,
        }
    }
}

impl From<String> for InsightType {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "root_cause" => Self::RootCause,
            "solution" => Self::Solution,
            "error" => Self::Error,
            "pattern" => Self::Pattern,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for InsightType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<InsightType> for String {
    fn from(value: InsightType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured body of an insight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightPayload {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl InsightPayload {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// All textual fields joined, for keyword matching.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = vec![self.description.as_str()];
        parts.extend(self.root_cause.as_deref());
        parts.extend(self.solution.as_deref());
        parts.extend(self.domain.as_deref());
        parts.extend(self.solution_type.as_deref());
        parts.extend(self.tags.iter().map(String::as_str));
        parts.join(" ")
    }
}

/// A stored troubleshooting insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub insight_type: InsightType,
    pub payload: InsightPayload,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Insight {
    pub fn new(
        insight_type: impl Into<InsightType>,
        payload: InsightPayload,
        confidence: f64,
    ) -> Self {
        Self {
            id: new_id(),
            insight_type: insight_type.into(),
            payload,
            confidence: clamp_unit(confidence),
            timestamp: Utc::now(),
        }
    }

    /// Confidence weighted by type and a 24-hour recency decay, capped at 1.
    pub fn adaptive_importance(&self, now: DateTime<Utc>) -> f64 {
        clamp_unit(
            self.confidence
                * self.insight_type.importance_multiplier()
                * recency_decay(self.timestamp, now, 24.0),
        )
    }

    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.insight_type, self.payload.searchable_text())
    }
}

/// A single conversational exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Confidence of the assistant's prior response, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_confidence: Option<f64>,
}

impl Turn {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_response_confidence(mut self, confidence: f64) -> Self {
        self.response_confidence = Some(clamp_unit(confidence));
        self
    }
}

/// Content held by a working-memory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryContent {
    Turn(Turn),
    Insight(Insight),
}

impl MemoryContent {
    pub fn is_insight(&self) -> bool {
        matches!(self, Self::Insight(_))
    }

    pub fn searchable_text(&self) -> String {
        match self {
            Self::Turn(turn) => match &turn.response {
                Some(response) => format!("{} {}", turn.query, response),
                None => turn.query.clone(),
            },
            Self::Insight(insight) => insight.searchable_text(),
        }
    }
}

/// An entry in working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: MemoryContent,
    pub timestamp: DateTime<Utc>,
    pub importance: f64,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

impl MemoryItem {
    pub fn new(content: MemoryContent, importance: f64) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            content,
            timestamp: now,
            importance: clamp_unit(importance),
            access_count: 0,
            last_accessed: now,
        }
    }

    /// Record a read.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

/// How a session pattern was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Same insight type seen repeatedly
    Recurring,
    /// Insights sharing a salient keyword
    Semantic,
}

/// A pattern derived from a session's insights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    /// `recurring_<insight type>` or `semantic_<keyword>`
    pub pattern_type: String,
    pub frequency: usize,
    pub confidence: f64,
    pub consistency_score: f64,
    pub temporal_density: f64,
    pub strength: f64,
    pub insight_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

/// Structured body of a cross-session pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternPayload {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effectiveness: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl PatternPayload {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = vec![self.description.as_str()];
        parts.extend(self.domain.as_deref());
        parts.extend(self.solution_type.as_deref());
        parts.extend(self.tags.iter().map(String::as_str));
        parts.join(" ")
    }
}

/// Input for [`EpisodicMemory::store_cross_session_pattern`](super::EpisodicMemory::store_cross_session_pattern).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternData {
    pub frequency: u32,
    pub confidence: f64,
    #[serde(default)]
    pub payload: PatternPayload,
}

impl PatternData {
    pub fn new(frequency: u32, confidence: f64) -> Self {
        Self {
            frequency,
            confidence,
            payload: PatternPayload::default(),
        }
    }

    pub fn with_payload(mut self, payload: PatternPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// A pattern shared across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicPattern {
    pub id: String,
    pub pattern_type: String,
    pub payload: PatternPayload,
    pub frequency: u32,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl EpisodicPattern {
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.pattern_type, self.payload.searchable_text())
    }
}

/// An episodic pattern with its similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPattern {
    pub pattern: EpisodicPattern,
    pub similarity: f64,
}

/// Per-type growth report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergingPattern {
    pub pattern_type: String,
    pub recent_count: usize,
    pub total_count: usize,
    pub growth_rate: f64,
}

/// Summary of everything in episodic memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalPatternAnalysis {
    pub total_patterns: usize,
    pub type_counts: BTreeMap<String, usize>,
    pub high_confidence: Vec<EpisodicPattern>,
    pub emerging: Vec<EmergingPattern>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillLevel {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationStyle {
    Concise,
    Detailed,
    #[default]
    Balanced,
}

/// Observed interaction habits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionPatterns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_session_length: Option<f64>,
    #[serde(default)]
    pub problem_domains: Vec<String>,
    #[serde(default)]
    pub preferred_solution_types: Vec<String>,
}

/// Shallow update for [`InteractionPatterns`]; only `Some` fields replace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionPatternsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_session_length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_solution_types: Option<Vec<String>>,
}

impl InteractionPatterns {
    pub fn merge(&mut self, update: InteractionPatternsUpdate) {
        if let Some(avg) = update.avg_session_length {
            self.avg_session_length = Some(avg);
        }
        if let Some(domains) = update.problem_domains {
            self.problem_domains = domains;
        }
        if let Some(types) = update.preferred_solution_types {
            self.preferred_solution_types = types;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalContext {
    pub total_interactions: u64,
    pub effective_interactions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<DateTime<Utc>>,
}

/// What the assistant knows about a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub skill_level: SkillLevel,
    pub communication_style: CommunicationStyle,
    pub domain_expertise: BTreeSet<String>,
    pub interaction_patterns: InteractionPatterns,
    pub historical_context: HistoricalContext,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Defaults used on first access: intermediate, balanced, no expertise.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            skill_level: SkillLevel::default(),
            communication_style: CommunicationStyle::default(),
            domain_expertise: BTreeSet::new(),
            interaction_patterns: InteractionPatterns::default(),
            historical_context: HistoricalContext::default(),
            updated_at: Utc::now(),
        }
    }

    /// Share of the three required fields that carry information.
    pub fn completeness(&self) -> f64 {
        // Skill level and style always hold a value; expertise must be learned.
        let filled = 2 + usize::from(!self.domain_expertise.is_empty());
        filled as f64 / 3.0
    }

    /// Apply a field-specific merge.
    pub fn apply(&mut self, update: ProfileUpdate) {
        if let Some(level) = update.skill_level {
            self.skill_level = level;
        }
        if let Some(style) = update.communication_style {
            self.communication_style = style;
        }
        if let Some(domains) = update.domain_expertise {
            self.domain_expertise.extend(
                domains
                    .into_iter()
                    .map(|d| d.trim().to_lowercase())
                    .filter(|d| !d.is_empty()),
            );
        }
        if let Some(patterns) = update.interaction_patterns {
            self.interaction_patterns.merge(patterns);
        }
        if let Some(history) = update.historical_context {
            self.historical_context = history;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial profile update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_level: Option<SkillLevel>,
    #[serde(
        default,
        alias = "preferred_communication_style",
        skip_serializing_if = "Option::is_none"
    )]
    pub communication_style: Option<CommunicationStyle>,
    /// Unioned into the existing set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_expertise: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_patterns: Option<InteractionPatternsUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_context: Option<HistoricalContext>,
}

impl ProfileUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skill_level(mut self, level: SkillLevel) -> Self {
        self.skill_level = Some(level);
        self
    }

    pub fn communication_style(mut self, style: CommunicationStyle) -> Self {
        self.communication_style = Some(style);
        self
    }

    pub fn domain_expertise<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain_expertise = Some(domains.into_iter().map(Into::into).collect());
        self
    }

    pub fn interaction_patterns(mut self, patterns: InteractionPatternsUpdate) -> Self {
        self.interaction_patterns = Some(patterns);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One observed interaction, fed to `track_interaction`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// Session length in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_type: Option<String>,
    #[serde(default)]
    pub effective: bool,
}

/// Technical domain a query belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TechnicalDomain {
    Database,
    Network,
    Application,
    System,
    Security,
    Cloud,
    #[default]
    General,
}

impl TechnicalDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Network => "network",
            Self::Application => "application",
            Self::System => "system",
            Self::Security => "security",
            Self::Cloud => "cloud",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for TechnicalDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Best-guess domain classification of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainContext {
    pub primary_domain: TechnicalDomain,
    pub confidence: f64,
    /// Every domain with a non-zero score, best first
    pub matched_domains: Vec<TechnicalDomain>,
    pub multi_domain: bool,
    pub is_complex: bool,
}

impl DomainContext {
    pub fn general(is_complex: bool) -> Self {
        Self {
            is_complex,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insight_type_string_round_trip() {
        assert_eq!(InsightType::from("root_cause"), InsightType::RootCause);
        assert_eq!(InsightType::from("Solution"), InsightType::Solution);
        assert_eq!(
            InsightType::from("config_drift"),
            InsightType::Other("config_drift".to_string())
        );
        let json = serde_json::to_string(&InsightType::RootCause).unwrap();
        assert_eq!(json, "\"root_cause\"");
    }

    #[test]
    fn test_insight_confidence_is_clamped() {
        let insight = Insight::new("solution", InsightPayload::new("restart"), 1.7);
        assert_eq!(insight.confidence, 1.0);
        let insight = Insight::new("solution", InsightPayload::new("restart"), -0.2);
        assert_eq!(insight.confidence, 0.0);
    }

    #[test]
    fn test_adaptive_importance_capped() {
        let insight = Insight::new("root_cause", InsightPayload::new("disk full"), 0.9);
        let importance = insight.adaptive_importance(Utc::now());
        assert!(importance <= 1.0);
        assert!(importance > 0.9);
    }

    #[test]
    fn test_memory_content_is_tagged() {
        let content = MemoryContent::Turn(Turn::new("hello"));
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["kind"], "turn");
        assert_eq!(value["query"], "hello");
    }

    #[test]
    fn test_profile_merge_semantics() {
        let mut profile = UserProfile::new("u1");
        profile.apply(ProfileUpdate::new().domain_expertise(["db"]));
        profile.apply(ProfileUpdate::new().domain_expertise(["net"]));

        let expected: BTreeSet<String> = ["db", "net"].iter().map(|s| s.to_string()).collect();
        assert_eq!(profile.domain_expertise, expected);
    }

    #[test]
    fn test_interaction_patterns_shallow_merge() {
        let mut profile = UserProfile::new("u1");
        profile.apply(ProfileUpdate::new().interaction_patterns(InteractionPatternsUpdate {
            avg_session_length: Some(12.0),
            problem_domains: Some(vec!["network".into()]),
            preferred_solution_types: None,
        }));
        profile.apply(ProfileUpdate::new().interaction_patterns(InteractionPatternsUpdate {
            preferred_solution_types: Some(vec!["restart".into()]),
            ..Default::default()
        }));

        let patterns = &profile.interaction_patterns;
        assert_eq!(patterns.avg_session_length, Some(12.0));
        assert_eq!(patterns.problem_domains, vec!["network".to_string()]);
        assert_eq!(patterns.preferred_solution_types, vec!["restart".to_string()]);
    }

    #[test]
    fn test_profile_update_accepts_preferred_style_alias() {
        let update: ProfileUpdate =
            serde_json::from_str(r#"{"preferred_communication_style": "concise"}"#).unwrap();
        assert_eq!(update.communication_style, Some(CommunicationStyle::Concise));
    }

    #[test]
    fn test_completeness() {
        let mut profile = UserProfile::new("u1");
        assert!((profile.completeness() - 2.0 / 3.0).abs() < 1e-9);
        profile.domain_expertise.insert("cloud".into());
        assert_eq!(profile.completeness(), 1.0);
    }
}
