//! Working memory: the most recent turns and insights per session.
//!
//! Each session holds at most `max_items` entries. When an insert pushes the
//! session over the bound, entries are ranked by (importance desc, timestamp
//! desc) and the tail is dropped.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::WorkingMemoryConfig;
use crate::error::{require_id, Result};
use crate::relevance::{clamp_unit, has_error_signal, has_urgency_signal, token_count};

use super::types::{Insight, MemoryContent, MemoryItem, Turn};

const BASE_TURN_IMPORTANCE: f64 = 0.8;
const ERROR_BOOST: f64 = 1.2;
const URGENCY_BOOST: f64 = 1.3;
const LONG_QUERY_BOOST: f64 = 1.1;
const LONG_QUERY_TOKENS: usize = 10;

/// Bounded per-session cache of recent context.
pub struct WorkingMemory {
    max_items: usize,
    sessions: RwLock<HashMap<String, Vec<MemoryItem>>>,
}

impl WorkingMemory {
    pub fn new(config: &WorkingMemoryConfig) -> Self {
        Self::with_max_items(config.max_items)
    }

    pub fn with_max_items(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Importance of a turn from its wording and prior response confidence.
    ///
    /// Every multiplier caps the running product at 1.0.
    pub fn turn_importance(turn: &Turn) -> f64 {
        let mut importance = BASE_TURN_IMPORTANCE;
        let text = match &turn.response {
            Some(response) => format!("{} {}", turn.query, response),
            None => turn.query.clone(),
        };

        if has_error_signal(&text) {
            importance = (importance * ERROR_BOOST).min(1.0);
        }
        if has_urgency_signal(&text) {
            importance = (importance * URGENCY_BOOST).min(1.0);
        }
        if token_count(&turn.query) > LONG_QUERY_TOKENS {
            importance = (importance * LONG_QUERY_BOOST).min(1.0);
        }
        if let Some(confidence) = turn.response_confidence {
            importance = (importance * (1.0 + 0.2 * clamp_unit(confidence))).min(1.0);
        }

        clamp_unit(importance)
    }

    /// Importance of an insight: confidence × type multiplier, capped at 1.
    pub fn insight_importance(insight: &Insight) -> f64 {
        clamp_unit(insight.confidence * insight.insight_type.importance_multiplier())
    }

    /// Record a conversational turn.
    pub async fn add_turn(&self, session_id: &str, turn: Turn) -> Result<MemoryItem> {
        require_id("session_id", session_id)?;
        let importance = Self::turn_importance(&turn);
        self.insert(session_id, MemoryItem::new(MemoryContent::Turn(turn), importance))
            .await
    }

    /// Record an insight.
    pub async fn add_insight(&self, session_id: &str, insight: Insight) -> Result<MemoryItem> {
        require_id("session_id", session_id)?;
        let importance = Self::insight_importance(&insight);
        self.insert(
            session_id,
            MemoryItem::new(MemoryContent::Insight(insight), importance),
        )
        .await
    }

    async fn insert(&self, session_id: &str, item: MemoryItem) -> Result<MemoryItem> {
        let mut sessions = self.sessions.write().await;
        let items = sessions.entry(session_id.to_string()).or_default();
        items.push(item.clone());

        if items.len() > self.max_items {
            items.sort_by(|a, b| {
                b.importance
                    .total_cmp(&a.importance)
                    .then_with(|| b.timestamp.cmp(&a.timestamp))
            });
            let evicted = items.len() - self.max_items;
            items.truncate(self.max_items);
            debug!(session_id, evicted, "Evicted working memory items");
        }

        Ok(item)
    }

    /// All items for a session. Every returned item is touched.
    pub async fn get_context(&self, session_id: &str) -> Result<Vec<MemoryItem>> {
        require_id("session_id", session_id)?;
        let mut sessions = self.sessions.write().await;
        let Some(items) = sessions.get_mut(session_id) else {
            return Ok(Vec::new());
        };

        for item in items.iter_mut() {
            item.touch();
        }
        Ok(items.clone())
    }

    /// Drop everything held for a session.
    pub async fn clear_session(&self, session_id: &str) -> Result<usize> {
        require_id("session_id", session_id)?;
        let removed = self.sessions.write().await.remove(session_id);
        Ok(removed.map(|items| items.len()).unwrap_or(0))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn total_items(&self) -> usize {
        self.sessions.read().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::InsightPayload;
    use proptest::prelude::*;

    fn insight(confidence: f64) -> Insight {
        Insight::new("general", InsightPayload::new("note"), confidence)
    }

    #[test]
    fn test_turn_importance_baseline() {
        assert!((WorkingMemory::turn_importance(&Turn::new("hello")) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_turn_importance_error_boost() {
        let importance = WorkingMemory::turn_importance(&Turn::new("the build failed"));
        assert!((importance - 0.96).abs() < 1e-9);
    }

    #[test]
    fn test_turn_importance_caps_at_one() {
        let importance = WorkingMemory::turn_importance(&Turn::new("urgent outage error"));
        assert_eq!(importance, 1.0);
    }

    #[test]
    fn test_turn_importance_long_query_and_confidence() {
        let long = Turn::new("one two three four five six seven eight nine ten eleven");
        assert!((WorkingMemory::turn_importance(&long) - 0.88).abs() < 1e-9);

        let confident = Turn::new("hello").with_response_confidence(0.5);
        assert!((WorkingMemory::turn_importance(&confident) - 0.88).abs() < 1e-9);
    }

    #[test]
    fn test_insight_importance_by_type() {
        let root = Insight::new("root_cause", InsightPayload::new("x"), 0.5);
        let solution = Insight::new("solution", InsightPayload::new("x"), 0.5);
        let error = Insight::new("error", InsightPayload::new("x"), 0.5);
        let other = Insight::new("observation", InsightPayload::new("x"), 0.5);

        assert!((WorkingMemory::insight_importance(&root) - 0.65).abs() < 1e-9);
        assert!((WorkingMemory::insight_importance(&solution) - 0.6).abs() < 1e-9);
        assert!((WorkingMemory::insight_importance(&error) - 0.55).abs() < 1e-9);
        assert!((WorkingMemory::insight_importance(&other) - 0.5).abs() < 1e-9);

        let strong = Insight::new("root_cause", InsightPayload::new("x"), 0.95);
        assert_eq!(WorkingMemory::insight_importance(&strong), 1.0);
    }

    #[tokio::test]
    async fn test_eviction_keeps_top_by_importance() {
        let memory = WorkingMemory::with_max_items(3);
        for confidence in [0.3, 0.9, 0.1, 0.7, 0.5] {
            memory.add_insight("s1", insight(confidence)).await.unwrap();
        }

        let items = memory.get_context("s1").await.unwrap();
        let mut importances: Vec<f64> = items.iter().map(|i| i.importance).collect();
        importances.sort_by(|a, b| b.total_cmp(a));
        assert_eq!(importances, vec![0.9, 0.7, 0.5]);
    }

    #[tokio::test]
    async fn test_boosted_turn_survives_eviction() {
        let memory = WorkingMemory::with_max_items(2);
        memory
            .add_turn("s1", Turn::new("urgent outage error"))
            .await
            .unwrap();
        memory.add_turn("s1", Turn::new("hello")).await.unwrap();
        memory.add_turn("s1", Turn::new("thanks")).await.unwrap();

        let items = memory.get_context("s1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|item| matches!(
            &item.content,
            MemoryContent::Turn(t) if t.query == "urgent outage error"
        )));
    }

    #[tokio::test]
    async fn test_get_context_touches_items() {
        let memory = WorkingMemory::with_max_items(5);
        memory.add_turn("s1", Turn::new("hello")).await.unwrap();

        let first = memory.get_context("s1").await.unwrap();
        assert_eq!(first[0].access_count, 1);
        let second = memory.get_context("s1").await.unwrap();
        assert_eq!(second[0].access_count, 2);
        assert!(second[0].last_accessed >= first[0].last_accessed);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_and_clearable() {
        let memory = WorkingMemory::with_max_items(5);
        memory.add_turn("a", Turn::new("one")).await.unwrap();
        memory.add_turn("b", Turn::new("two")).await.unwrap();
        assert_eq!(memory.session_count().await, 2);

        assert_eq!(memory.clear_session("a").await.unwrap(), 1);
        assert!(memory.get_context("a").await.unwrap().is_empty());
        assert_eq!(memory.get_context("b").await.unwrap().len(), 1);
        assert_eq!(memory.total_items().await, 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_session() {
        let memory = WorkingMemory::with_max_items(5);
        assert!(memory.add_turn("", Turn::new("x")).await.is_err());
        assert!(memory.get_context(" ").await.is_err());
    }

    proptest! {
        #[test]
        fn size_bound_holds_after_every_insert(
            max_items in 1usize..6,
            confidences in proptest::collection::vec(0.0f64..1.0, 1..20)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let memory = WorkingMemory::with_max_items(max_items);
                for c in confidences {
                    memory.add_insight("s", insight(c)).await.unwrap();
                    let items = memory.get_context("s").await.unwrap();
                    prop_assert!(items.len() <= max_items);
                    for item in &items {
                        prop_assert!((0.0..=1.0).contains(&item.importance));
                    }
                }
                Ok(())
            })?;
        }

        #[test]
        fn turn_importance_in_unit_interval(
            query in "[a-z ]{0,80}",
            confidence in proptest::option::of(-1.0f64..2.0)
        ) {
            let mut turn = Turn::new(query);
            turn.response_confidence = confidence;
            let importance = WorkingMemory::turn_importance(&turn);
            prop_assert!((0.0..=1.0).contains(&importance));
        }
    }
}
