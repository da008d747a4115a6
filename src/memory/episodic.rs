//! Episodic memory: patterns shared across sessions.
//!
//! Patterns are indexed into the vector store when one is configured and are
//! always kept in a local per-type cache. Retrieval prefers the vector store
//! and falls back to keyword similarity over the local cache whenever the
//! store is absent, fails, or has nothing relevant.

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::collaborators::{
    DocumentMetadata, SearchHit, VectorDocument, VectorStore, EPISODIC_DOCUMENT_KIND,
};
use crate::config::EpisodicConfig;
use crate::error::{require_id, Result};
use crate::relevance::{clamp_unit, keyword_similarity};

use super::types::{
    new_id, EmergingPattern, EpisodicPattern, GlobalPatternAnalysis, PatternData, PatternPayload,
    ScoredPattern,
};

const HIGH_CONFIDENCE: f64 = 0.8;

/// Cross-session pattern store.
pub struct EpisodicMemory {
    vector_store: Option<Arc<dyn VectorStore>>,
    local: RwLock<HashMap<String, VecDeque<EpisodicPattern>>>,
    config: EpisodicConfig,
}

impl EpisodicMemory {
    pub fn new(config: EpisodicConfig, vector_store: Option<Arc<dyn VectorStore>>) -> Self {
        Self {
            vector_store,
            local: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Local cache only.
    pub fn local_only() -> Self {
        Self::new(EpisodicConfig::default(), None)
    }

    pub fn has_vector_store(&self) -> bool {
        self.vector_store.is_some()
    }

    /// Record a pattern observed across sessions.
    ///
    /// Indexing is best-effort. The local cache always receives the pattern.
    pub async fn store_cross_session_pattern(
        &self,
        pattern_type: &str,
        data: PatternData,
    ) -> Result<EpisodicPattern> {
        require_id("pattern_type", pattern_type)?;
        let pattern = EpisodicPattern {
            id: new_id(),
            pattern_type: pattern_type.to_string(),
            payload: data.payload,
            frequency: data.frequency,
            confidence: clamp_unit(data.confidence),
            timestamp: Utc::now(),
        };

        if let Some(store) = &self.vector_store {
            match to_document(&pattern) {
                Ok(document) => {
                    if let Err(e) = store.add_documents(vec![document]).await {
                        warn!(pattern_type, error = %e, "Failed to index episodic pattern");
                    }
                }
                Err(e) => warn!(pattern_type, error = %e, "Failed to encode episodic pattern"),
            }
        }

        let mut local = self.local.write().await;
        let bucket = local.entry(pattern.pattern_type.clone()).or_default();
        bucket.push_back(pattern.clone());
        while bucket.len() > self.config.max_patterns_per_type {
            bucket.pop_front();
        }

        debug!(pattern_type, id = %pattern.id, "Stored episodic pattern");
        Ok(pattern)
    }

    /// Patterns relevant to `query`, best first, at most `search_top_k`.
    pub async fn get_relevant_patterns(
        &self,
        query: &str,
        pattern_type: Option<&str>,
    ) -> Result<Vec<ScoredPattern>> {
        let from_index = self.search_index(query, pattern_type).await;
        if !from_index.is_empty() {
            return Ok(from_index);
        }
        Ok(self.search_local(query, pattern_type).await)
    }

    async fn search_index(&self, query: &str, pattern_type: Option<&str>) -> Vec<ScoredPattern> {
        let Some(store) = &self.vector_store else {
            return Vec::new();
        };

        let hits = match store.search(query, self.config.search_top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Vector search failed, using local patterns");
                return Vec::new();
            }
        };

        let local = self.local.read().await;
        let mut results: Vec<ScoredPattern> = hits
            .into_iter()
            .filter(|hit| hit.document.metadata.kind == EPISODIC_DOCUMENT_KIND)
            .filter(|hit| pattern_type.map_or(true, |t| hit.document.metadata.pattern_type == t))
            .map(|hit| {
                let similarity = clamp_unit(hit.score);
                let pattern = local
                    .get(&hit.document.metadata.pattern_type)
                    .and_then(|bucket| bucket.iter().find(|p| p.id == hit.document.id))
                    .cloned()
                    .unwrap_or_else(|| from_hit(hit));
                ScoredPattern {
                    pattern,
                    similarity,
                }
            })
            .collect();

        sort_and_truncate(&mut results, self.config.search_top_k);
        results
    }

    async fn search_local(&self, query: &str, pattern_type: Option<&str>) -> Vec<ScoredPattern> {
        let local = self.local.read().await;
        let buckets: Vec<&VecDeque<EpisodicPattern>> = match pattern_type {
            Some(t) => local.get(t).into_iter().collect(),
            None => local.values().collect(),
        };

        let mut results: Vec<ScoredPattern> = buckets
            .into_iter()
            .flatten()
            .filter_map(|pattern| {
                let similarity = keyword_similarity(query, &pattern.searchable_text());
                (similarity >= self.config.similarity_threshold).then(|| ScoredPattern {
                    pattern: pattern.clone(),
                    similarity,
                })
            })
            .collect();

        sort_and_truncate(&mut results, self.config.search_top_k);
        results
    }

    /// Totals, per-type counts, high-confidence patterns and emerging types.
    pub async fn analyze_global_patterns(&self) -> GlobalPatternAnalysis {
        let local = self.local.read().await;
        let cutoff = Utc::now() - Duration::days(self.config.emerging_window_days);

        let mut analysis = GlobalPatternAnalysis::default();
        for (pattern_type, bucket) in local.iter() {
            let total = bucket.len();
            if total == 0 {
                continue;
            }
            analysis.total_patterns += total;
            analysis.type_counts.insert(pattern_type.clone(), total);
            analysis.high_confidence.extend(
                bucket
                    .iter()
                    .filter(|p| p.confidence > HIGH_CONFIDENCE)
                    .cloned(),
            );

            let recent = bucket.iter().filter(|p| p.timestamp >= cutoff).count();
            let growth_rate = recent as f64 / total as f64;
            if growth_rate >= self.config.emerging_ratio {
                analysis.emerging.push(EmergingPattern {
                    pattern_type: pattern_type.clone(),
                    recent_count: recent,
                    total_count: total,
                    growth_rate,
                });
            }
        }

        analysis
            .high_confidence
            .sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        analysis
            .emerging
            .sort_by(|a, b| b.growth_rate.total_cmp(&a.growth_rate));
        analysis
    }

    pub async fn pattern_count(&self) -> usize {
        self.local.read().await.values().map(VecDeque::len).sum()
    }
}

fn to_document(pattern: &EpisodicPattern) -> Result<VectorDocument> {
    Ok(VectorDocument {
        id: pattern.id.clone(),
        text: serde_json::to_string(&pattern.payload)?,
        metadata: DocumentMetadata {
            kind: EPISODIC_DOCUMENT_KIND.to_string(),
            pattern_type: pattern.pattern_type.clone(),
            timestamp: pattern.timestamp,
            confidence: pattern.confidence,
        },
    })
}

/// Rebuild a pattern from an indexed document we no longer hold locally.
fn from_hit(hit: SearchHit) -> EpisodicPattern {
    let SearchHit { document, .. } = hit;
    let payload = serde_json::from_str::<PatternPayload>(&document.text)
        .unwrap_or_else(|_| PatternPayload::new(document.text.clone()));
    EpisodicPattern {
        id: document.id,
        pattern_type: document.metadata.pattern_type,
        payload,
        frequency: 1,
        confidence: clamp_unit(document.metadata.confidence),
        timestamp: document.metadata.timestamp,
    }
}

fn sort_and_truncate(results: &mut Vec<ScoredPattern>, limit: usize) {
    results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    results.truncate(limit);
}
