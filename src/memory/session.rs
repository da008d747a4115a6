//! Session memory: insights gathered during one troubleshooting session.
//!
//! The cache is authoritative for the life of the process. When a session
//! store is configured, every write is mirrored to it and a cache miss is
//! filled from it. With `durable = false` a failed mirror is logged and
//! ignored; with `durable = true` it is returned as [`Error::Persistence`].
//!
//! A session's durable copy is only ever overwritten by a snapshot that
//! started from it. If the stored insights could not be read, new insights
//! are kept in the cache and folded in once a later load succeeds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::collaborators::SessionStore;
use crate::config::SessionMemoryConfig;
use crate::error::{require_id, Error, Result};
use crate::relevance::{clamp_unit, is_stopword, tokenize};

use super::locks::KeyedLocks;
use super::types::{Insight, InsightPayload, InsightType, Pattern, PatternKind};

const MIN_CLUSTER_SIZE: usize = 2;
const MIN_CLUSTER_CONFIDENCE: f64 = 0.3;
const MAX_SEMANTIC_CLUSTERS: usize = 3;

fn insights_key(session_id: &str) -> String {
    format!("insights:{}", session_id)
}

/// Cached insights of one session.
#[derive(Debug, Default)]
struct SessionEntry {
    insights: Vec<Insight>,
    /// Whether the durable copy has been read into `insights`
    synced: bool,
}

/// Session-scoped insight cache with pattern detection.
pub struct SessionMemory {
    cache: RwLock<HashMap<String, SessionEntry>>,
    store: Option<Arc<dyn SessionStore>>,
    write_locks: KeyedLocks,
    durable: bool,
}

impl SessionMemory {
    pub fn new(config: &SessionMemoryConfig, store: Option<Arc<dyn SessionStore>>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
            write_locks: KeyedLocks::new(),
            durable: config.durable,
        }
    }

    /// In-memory only.
    pub fn in_memory() -> Self {
        Self::new(&SessionMemoryConfig::default(), None)
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Store an insight and mirror the session to the durable store.
    pub async fn store_insight(
        &self,
        session_id: &str,
        insight_type: impl Into<InsightType>,
        payload: InsightPayload,
        confidence: f64,
    ) -> Result<Insight> {
        require_id("session_id", session_id)?;
        let insight = Insight::new(insight_type, payload, confidence);
        self.store_existing(session_id, insight.clone()).await?;
        Ok(insight)
    }

    /// Store an already-built insight.
    ///
    /// Writes to one session are serialized from load to mirror, so the
    /// durable copy always matches the latest snapshot.
    pub async fn store_existing(&self, session_id: &str, insight: Insight) -> Result<()> {
        require_id("session_id", session_id)?;
        let _guard = self.write_locks.lock(session_id).await;

        let synced = self.ensure_loaded(session_id).await;
        if !synced && self.durable {
            return Err(Error::Persistence(format!(
                "session {}: stored insights could not be loaded",
                session_id
            )));
        }

        let snapshot = {
            let mut cache = self.cache.write().await;
            let entry = cache.entry(session_id.to_string()).or_default();
            entry.insights.push(insight);
            (synced || entry.synced).then(|| entry.insights.clone())
        };

        match snapshot {
            Some(snapshot) => self.persist(session_id, &snapshot).await,
            None => {
                warn!(session_id, "Stored insight locally only, durable copy not loaded");
                Ok(())
            }
        }
    }

    /// Insights for a session, best first by (confidence, timestamp).
    pub async fn get_insights(
        &self,
        session_id: &str,
        insight_type: Option<&InsightType>,
    ) -> Result<Vec<Insight>> {
        require_id("session_id", session_id)?;
        if !self.is_synced(session_id).await {
            let _guard = self.write_locks.lock(session_id).await;
            self.ensure_loaded(session_id).await;
        }

        let cache = self.cache.read().await;
        let mut insights: Vec<Insight> = cache
            .get(session_id)
            .map(|entry| {
                entry
                    .insights
                    .iter()
                    .filter(|i| insight_type.map_or(true, |t| &i.insight_type == t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        insights.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        Ok(insights)
    }

    /// Recurring patterns (sorted by strength) followed by up to three
    /// semantic clusters.
    pub async fn detect_patterns(&self, session_id: &str) -> Result<Vec<Pattern>> {
        let insights = self.get_insights(session_id, None).await?;
        let mut patterns = recurring_patterns(&insights);
        patterns.extend(semantic_clusters(&insights));
        Ok(patterns)
    }

    /// Drop the cached insights for a session.
    ///
    /// The durable copy is kept, so with a session store configured the
    /// next read loads the insights again. Use
    /// [`purge_session`](Self::purge_session) to remove them for good.
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        require_id("session_id", session_id)?;
        let guard = self.write_locks.lock(session_id).await;
        self.cache.write().await.remove(session_id);
        drop(guard);
        self.write_locks.release(session_id).await;
        Ok(())
    }

    /// Drop the cached insights and delete the durable copy.
    ///
    /// A failed delete is returned regardless of the `durable` flag, since
    /// the stored insights would otherwise come back on the next read.
    pub async fn purge_session(&self, session_id: &str) -> Result<()> {
        require_id("session_id", session_id)?;
        let guard = self.write_locks.lock(session_id).await;
        self.cache.write().await.remove(session_id);
        if let Some(store) = &self.store {
            store.delete(&insights_key(session_id)).await.map_err(|e| {
                Error::Persistence(format!("session {}: {}", session_id, e))
            })?;
        }
        drop(guard);
        self.write_locks.release(session_id).await;
        debug!(session_id, "Purged session insights");
        Ok(())
    }

    pub async fn session_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Fill the cache from the durable store on a miss.
    ///
    /// Returns whether the cached entry now reflects the durable copy.
    /// Insights cached while the store was unreadable are kept and appended
    /// after the stored ones once a load succeeds.
    ///
    /// Callers hold the session's write lock.
    async fn ensure_loaded(&self, session_id: &str) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        if self.is_synced(session_id).await {
            return true;
        }

        let mut loaded = match store.get(&insights_key(session_id)).await {
            Ok(Some(blob)) => match serde_json::from_str::<Vec<Insight>>(&blob) {
                Ok(insights) => insights,
                Err(e) => {
                    warn!(session_id, error = %e, "Discarding unreadable stored insights");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(session_id, error = %e, "Failed to load session insights");
                return false;
            }
        };

        debug!(session_id, count = loaded.len(), "Loaded session insights");
        let mut cache = self.cache.write().await;
        let entry = cache.entry(session_id.to_string()).or_default();
        let known: HashSet<String> = loaded.iter().map(|i| i.id.clone()).collect();
        loaded.extend(
            entry
                .insights
                .drain(..)
                .filter(|insight| !known.contains(&insight.id)),
        );
        entry.insights = loaded;
        entry.synced = true;
        true
    }

    async fn is_synced(&self, session_id: &str) -> bool {
        self.store.is_none()
            || self
                .cache
                .read()
                .await
                .get(session_id)
                .map_or(false, |entry| entry.synced)
    }

    async fn persist(&self, session_id: &str, insights: &[Insight]) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let outcome = match serde_json::to_string(insights) {
            Ok(blob) => store.set(&insights_key(session_id), blob).await,
            Err(e) => Err(Error::from(e)),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if self.durable => Err(Error::Persistence(format!(
                "session {}: {}",
                session_id, e
            ))),
            Err(e) => {
                warn!(session_id, error = %e, "Session insight write-through failed");
                Ok(())
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let avg = mean(values);
    values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64
}

/// Consistency, temporal density and strength for a group of insights.
fn group_metrics(members: &[&Insight]) -> (f64, f64, f64, f64) {
    let confidences: Vec<f64> = members.iter().map(|i| i.confidence).collect();
    let avg_confidence = mean(&confidences);
    let consistency = (1.0 - variance(&confidences)).max(0.1);

    let first = members.iter().map(|i| i.timestamp).min();
    let last = members.iter().map(|i| i.timestamp).max();
    let span_hours = match (first, last) {
        (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 3_600_000.0,
        _ => 0.0,
    };
    let temporal_density = members.len() as f64 / span_hours.max(1.0);

    let strength = clamp_unit(avg_confidence * consistency * temporal_density.min(1.0));
    (avg_confidence, consistency, temporal_density, strength)
}

fn recurring_patterns(insights: &[Insight]) -> Vec<Pattern> {
    let mut by_type: BTreeMap<&InsightType, Vec<&Insight>> = BTreeMap::new();
    for insight in insights {
        by_type.entry(&insight.insight_type).or_default().push(insight);
    }

    let mut patterns: Vec<Pattern> = by_type
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(insight_type, members)| {
            let (confidence, consistency, density, strength) = group_metrics(&members);
            Pattern {
                kind: PatternKind::Recurring,
                pattern_type: format!("recurring_{}", insight_type),
                frequency: members.len(),
                confidence,
                consistency_score: consistency,
                temporal_density: density,
                strength,
                insight_ids: members.iter().map(|i| i.id.clone()).collect(),
                keyword: None,
            }
        })
        .collect();

    patterns.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    patterns
}

/// Salient tokens of an insight's payload: no stopwords, longer than three.
fn salient_tokens(insight: &Insight) -> HashSet<String> {
    tokenize(&insight.payload.searchable_text())
        .into_iter()
        .filter(|t| t.len() > 3 && !is_stopword(t))
        .collect()
}

fn semantic_clusters(insights: &[Insight]) -> Vec<Pattern> {
    if insights.len() < MIN_CLUSTER_SIZE {
        return Vec::new();
    }

    let mut members_by_token: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, insight) in insights.iter().enumerate() {
        for token in salient_tokens(insight) {
            members_by_token.entry(token).or_default().push(index);
        }
    }

    let total = insights.len() as f64;
    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    let mut clusters = Vec::new();

    // BTreeMap order: the lexicographically first keyword names a member set.
    for (token, mut indices) in members_by_token {
        if indices.len() < MIN_CLUSTER_SIZE {
            continue;
        }
        indices.sort_unstable();
        if !seen.insert(indices.clone()) {
            continue;
        }

        let members: Vec<&Insight> = indices.iter().map(|&i| &insights[i]).collect();
        let (avg_confidence, consistency, density, _) = group_metrics(&members);
        if avg_confidence <= MIN_CLUSTER_CONFIDENCE {
            continue;
        }

        let score = clamp_unit(avg_confidence * members.len() as f64 / total);
        clusters.push(Pattern {
            kind: PatternKind::Semantic,
            pattern_type: format!("semantic_{}", token),
            frequency: members.len(),
            confidence: avg_confidence,
            consistency_score: consistency,
            temporal_density: density,
            strength: score,
            insight_ids: members.iter().map(|i| i.id.clone()).collect(),
            keyword: Some(token),
        });
    }

    clusters.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    clusters.truncate(MAX_SEMANTIC_CLUSTERS);
    clusters
}
