//! Memory manager: the single entry point over the four memory tiers.
//!
//! Retrieval fans out to every tier concurrently. Each branch runs under its
//! own deadline and panic guard, so one slow or broken collaborator degrades
//! its own contribution and nothing else.
//!
//! Consolidation runs in the background. At most one consolidation per
//! session is live; a newer request cancels the older one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use layered_memory::{MemoryManager, TroubleshootingResult};
//!
//! let manager = MemoryManager::builder().build()?;
//! let context = manager.retrieve_context("session-1", "postgres deadlock").await?;
//!
//! manager
//!     .consolidate_insights(
//!         "session-1",
//!         TroubleshootingResult::new()
//!             .root_cause("lock ordering")
//!             .solution("acquire locks in id order")
//!             .effectiveness(0.9),
//!     )
//!     .await?;
//! ```

mod consolidation;
mod ranking;
mod types;

pub use consolidation::SOLUTION_EFFECTIVENESS;
pub use ranking::{quality_score, rank_history, rank_insights};
pub use types::{
    Complexity, ConsolidationState, ConversationContext, HealthReport, HealthStatus,
    InsightSource, ManagerStats, RankedInsight, RankedItem, TroubleshootingResult,
};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{LlmProvider, Sanitizer, SessionStore, VectorStore};
use crate::config::MemoryConfig;
use crate::error::{require_id, Error, Result};
use crate::memory::{
    EpisodicMemory, ProfileUpdate, SessionMemory, UserMemory, UserProfile, WorkingMemory,
};
use crate::relevance::classify_domain;

/// Deterministic user id for a session: `user_` + 16 hex digits of SHA-256.
pub fn user_id_for(session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("user_{}", &digest[..16])
}

/// The four tiers, shared with background consolidations.
pub(crate) struct MemoryTiers {
    pub working: WorkingMemory,
    pub session: SessionMemory,
    pub user: UserMemory,
    pub episodic: EpisodicMemory,
}

struct ConsolidationHandle {
    generation: u64,
    token: CancellationToken,
    state: ConsolidationState,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct TaskRegistry {
    live: HashMap<String, ConsolidationHandle>,
    /// Superseded tasks that may still be winding down
    retired: Vec<JoinHandle<()>>,
}

impl TaskRegistry {
    /// Cancel and retire the live task of a session, if any.
    fn supersede(&mut self, session_id: &str) {
        if let Some(previous) = self.live.remove(session_id) {
            previous.token.cancel();
            debug!(
                session_id,
                generation = previous.generation,
                "Cancelled consolidation"
            );
            self.retired.extend(previous.join);
        }
        self.retired.retain(|join| !join.is_finished());
    }
}

#[derive(Default)]
struct StatsCounters {
    retrievals: AtomicU64,
    slow_retrievals: AtomicU64,
    total_retrieval_ms: AtomicU64,
    last_retrieval_ms: AtomicU64,
    degraded_branches: AtomicU64,
    consolidations_scheduled: AtomicU64,
    consolidations_completed: AtomicU64,
    consolidations_failed: AtomicU64,
    consolidations_cancelled: AtomicU64,
}

impl StatsCounters {
    fn record_retrieval(&self, elapsed_ms: u64, slow: bool) {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        self.total_retrieval_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.last_retrieval_ms.store(elapsed_ms, Ordering::Relaxed);
        if slow {
            self.slow_retrievals.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_consolidation(&self, state: ConsolidationState) {
        let counter = match state {
            ConsolidationState::Completed => &self.consolidations_completed,
            ConsolidationState::Failed => &self.consolidations_failed,
            ConsolidationState::Cancelled => &self.consolidations_cancelled,
            ConsolidationState::Scheduled | ConsolidationState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ManagerStats {
        let retrievals = self.retrievals.load(Ordering::Relaxed);
        let total_ms = self.total_retrieval_ms.load(Ordering::Relaxed);
        ManagerStats {
            retrievals,
            slow_retrievals: self.slow_retrievals.load(Ordering::Relaxed),
            avg_retrieval_ms: if retrievals == 0 {
                0.0
            } else {
                total_ms as f64 / retrievals as f64
            },
            last_retrieval_ms: self.last_retrieval_ms.load(Ordering::Relaxed),
            degraded_branches: self.degraded_branches.load(Ordering::Relaxed),
            consolidations_scheduled: self.consolidations_scheduled.load(Ordering::Relaxed),
            consolidations_completed: self.consolidations_completed.load(Ordering::Relaxed),
            consolidations_failed: self.consolidations_failed.load(Ordering::Relaxed),
            consolidations_cancelled: self.consolidations_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Everything a background consolidation needs, owned.
struct ConsolidationJob {
    tiers: Arc<MemoryTiers>,
    llm: Option<Arc<dyn LlmProvider>>,
    tasks: Arc<Mutex<TaskRegistry>>,
    stats: Arc<StatsCounters>,
    session_id: String,
    user_id: String,
    generation: u64,
    token: CancellationToken,
}

impl ConsolidationJob {
    async fn run(self, result: TroubleshootingResult) {
        self.set_state(ConsolidationState::Running).await;

        let work = consolidation::run(
            &self.tiers,
            self.llm.as_ref(),
            &self.session_id,
            &self.user_id,
            result,
            &self.token,
        );
        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Ok(ConsolidationState::Cancelled),
            outcome = AssertUnwindSafe(work).catch_unwind() => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Internal("consolidation panicked".to_string())),
            },
        };

        let state = match outcome {
            Ok(state) => state,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Consolidation failed");
                ConsolidationState::Failed
            }
        };
        self.stats.record_consolidation(state);
        debug!(
            session_id = %self.session_id,
            generation = self.generation,
            state = ?state,
            "Consolidation settled"
        );

        let mut registry = self.tasks.lock().await;
        if registry
            .live
            .get(&self.session_id)
            .is_some_and(|handle| handle.generation == self.generation)
        {
            registry.live.remove(&self.session_id);
        }
    }

    async fn set_state(&self, state: ConsolidationState) {
        let mut registry = self.tasks.lock().await;
        if let Some(handle) = registry.live.get_mut(&self.session_id) {
            if handle.generation == self.generation {
                handle.state = state;
            }
        }
    }
}

/// Facade over working, session, user and episodic memory.
pub struct MemoryManager {
    config: MemoryConfig,
    tiers: Arc<MemoryTiers>,
    llm: Option<Arc<dyn LlmProvider>>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
    session_store_available: bool,
    tasks: Arc<Mutex<TaskRegistry>>,
    generation: AtomicU64,
    stats: Arc<StatsCounters>,
}

impl MemoryManager {
    pub fn builder() -> MemoryManagerBuilder {
        MemoryManagerBuilder::new()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.tiers.working
    }

    pub fn session(&self) -> &SessionMemory {
        &self.tiers.session
    }

    pub fn user(&self) -> &UserMemory {
        &self.tiers.user
    }

    pub fn episodic(&self) -> &EpisodicMemory {
        &self.tiers.episodic
    }

    /// Assemble the context for a query.
    ///
    /// Only failures outside the isolated branches, such as a sanitizer
    /// error, are returned, wrapped as [`Error::Retrieval`]. Callers may
    /// substitute [`ConversationContext::empty`].
    pub async fn retrieve_context(
        &self,
        session_id: &str,
        query: &str,
    ) -> Result<ConversationContext> {
        require_id("session_id", session_id)?;
        let started = Instant::now();
        let query = self.sanitize_query(query).await.map_err(Error::retrieval)?;
        let user_id = user_id_for(session_id);
        let deadline = Duration::from_millis(self.config.retrieval.branch_timeout_ms);
        let tiers = &self.tiers;

        let (items, insights, profile, patterns) = tokio::join!(
            self.isolated("working", session_id, deadline, tiers.working.get_context(session_id)),
            self.isolated(
                "session",
                session_id,
                deadline,
                tiers.session.get_insights(session_id, None)
            ),
            self.isolated("user", session_id, deadline, tiers.user.get_user_profile(&user_id)),
            self.isolated(
                "episodic",
                session_id,
                deadline,
                tiers.episodic.get_relevant_patterns(&query, None)
            ),
        );

        let profile = profile.unwrap_or_else(|| UserProfile::new(user_id.clone()));
        let now = Utc::now();
        let domain_context = classify_domain(&query, &profile.domain_expertise);
        let history = rank_history(
            &query,
            items.unwrap_or_default(),
            &profile,
            now,
            &self.config.retrieval,
        );
        let insights = rank_insights(
            &query,
            insights.unwrap_or_default(),
            patterns.unwrap_or_default(),
            &profile,
            now,
            self.config.retrieval.max_insights,
        );
        let quality_score = quality_score(
            history.len(),
            insights.len(),
            &profile,
            domain_context.confidence,
        );

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let target_ms = self.config.retrieval.latency_target_ms;
        let slow = elapsed_ms > target_ms;
        self.stats.record_retrieval(elapsed_ms, slow);
        if slow {
            warn!(session_id, elapsed_ms, target_ms, "Context retrieval exceeded latency target");
        } else {
            debug!(
                session_id,
                elapsed_ms,
                history = history.len(),
                insights = insights.len(),
                "Retrieved context"
            );
        }

        Ok(ConversationContext {
            session_id: session_id.to_string(),
            history,
            user_profile: profile,
            insights,
            domain_context,
            quality_score,
            retrieval_ms: elapsed_ms,
        })
    }

    /// Run one retrieval branch; any failure, panic or timeout yields `None`.
    async fn isolated<T, F>(
        &self,
        branch: &'static str,
        session_id: &str,
        deadline: Duration,
        fut: F,
    ) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        let error = match timeout(deadline, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(Ok(value))) => return Some(value),
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => Error::Internal(format!("{} branch panicked", branch)),
            Err(_) => Error::timeout(deadline.as_millis() as u64),
        };

        self.stats.degraded_branches.fetch_add(1, Ordering::Relaxed);
        warn!(session_id, branch, error = %error, "Retrieval branch degraded");
        None
    }

    async fn sanitize_query(&self, query: &str) -> Result<String> {
        let Some(sanitizer) = &self.sanitizer else {
            return Ok(query.to_string());
        };
        match sanitizer.sanitize(Value::String(query.to_string())).await? {
            Value::String(clean) => Ok(clean),
            other => Err(Error::validation(format!(
                "sanitizer returned a non-string query: {}",
                other
            ))),
        }
    }

    async fn sanitize_result(
        &self,
        result: TroubleshootingResult,
    ) -> Result<TroubleshootingResult> {
        let Some(sanitizer) = &self.sanitizer else {
            return Ok(result);
        };
        let value = serde_json::to_value(&result)?;
        let clean = sanitizer.sanitize(value).await?;
        Ok(serde_json::from_value(clean)?)
    }

    /// Schedule background consolidation of a troubleshooting result.
    ///
    /// Returns once the task is scheduled and never waits for extraction. A
    /// live consolidation for the same session is cancelled first. Returns
    /// `false` when the sanitizer rejects the result.
    pub async fn consolidate_insights(
        &self,
        session_id: &str,
        result: TroubleshootingResult,
    ) -> Result<bool> {
        require_id("session_id", session_id)?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::consolidation_scheduling(session_id, e.to_string()))?;

        let result = match self.sanitize_result(result).await {
            Ok(result) => result,
            Err(e) => {
                warn!(session_id, error = %e, "Sanitizer rejected result, consolidation skipped");
                return Ok(false);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let job = ConsolidationJob {
            tiers: Arc::clone(&self.tiers),
            llm: self.llm.clone(),
            tasks: Arc::clone(&self.tasks),
            stats: Arc::clone(&self.stats),
            session_id: session_id.to_string(),
            user_id: user_id_for(session_id),
            generation,
            token: token.clone(),
        };

        // Spawn and register under one lock so the task cannot settle
        // before its entry exists.
        let mut registry = self.tasks.lock().await;
        registry.supersede(session_id);
        let join = runtime.spawn(job.run(result));
        registry.live.insert(
            session_id.to_string(),
            ConsolidationHandle {
                generation,
                token,
                state: ConsolidationState::Scheduled,
                join: Some(join),
            },
        );
        self.stats
            .consolidations_scheduled
            .fetch_add(1, Ordering::Relaxed);

        debug!(session_id, generation, "Scheduled consolidation");
        Ok(true)
    }

    /// State of the live consolidation for a session.
    pub async fn consolidation_state(&self, session_id: &str) -> Option<ConsolidationState> {
        self.tasks
            .lock()
            .await
            .live
            .get(session_id)
            .map(|handle| handle.state)
    }

    pub async fn live_consolidations(&self) -> usize {
        self.tasks.lock().await.live.len()
    }

    /// Wait until every scheduled consolidation, including superseded ones,
    /// has settled.
    pub async fn wait_for_consolidations(&self) {
        loop {
            let joins: Vec<JoinHandle<()>> = {
                let mut registry = self.tasks.lock().await;
                let mut joins: Vec<JoinHandle<()>> = registry.retired.drain(..).collect();
                joins.extend(registry.live.values_mut().filter_map(|h| h.join.take()));
                joins
            };
            if joins.is_empty() {
                return;
            }
            for join in joins {
                if let Err(e) = join.await {
                    warn!(error = %e, "Consolidation task aborted");
                }
            }
        }
    }

    /// Cancel every live consolidation and wait for all of them to settle.
    pub async fn shutdown(&self) {
        {
            let registry = self.tasks.lock().await;
            for handle in registry.live.values() {
                handle.token.cancel();
            }
            info!(live = registry.live.len(), "Shutting down memory manager");
        }
        self.wait_for_consolidations().await;
    }

    /// Forget a session's working and session caches and cancel its
    /// consolidation.
    ///
    /// Stored insights are kept: with a session store configured they are
    /// loaded again on the next retrieval. See [`purge_session`](Self::purge_session).
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        require_id("session_id", session_id)?;
        self.tasks.lock().await.supersede(session_id);
        self.tiers.working.clear_session(session_id).await?;
        self.tiers.session.clear_session(session_id).await?;
        debug!(session_id, "Cleared session");
        Ok(())
    }

    /// Clear a session and delete its stored insights.
    ///
    /// Cancelled consolidations are awaited first so none of them can write
    /// the session back afterwards.
    pub async fn purge_session(&self, session_id: &str) -> Result<()> {
        require_id("session_id", session_id)?;
        let joins: Vec<JoinHandle<()>> = {
            let mut registry = self.tasks.lock().await;
            let live = registry
                .live
                .get_mut(session_id)
                .and_then(|handle| handle.join.take());
            registry.supersede(session_id);
            registry.retired.drain(..).chain(live).collect()
        };
        for join in joins {
            if let Err(e) = join.await {
                warn!(session_id, error = %e, "Consolidation task aborted");
            }
        }

        self.tiers.working.clear_session(session_id).await?;
        self.tiers.session.purge_session(session_id).await?;
        debug!(session_id, "Purged session");
        Ok(())
    }

    /// Profile of the session's user; defaults on failure.
    pub async fn get_user_profile(&self, session_id: &str) -> UserProfile {
        let user_id = user_id_for(session_id);
        match self.tiers.user.get_user_profile(&user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(session_id, error = %e, "Falling back to default profile");
                UserProfile::new(user_id)
            }
        }
    }

    /// Merge an update into the session's user profile.
    pub async fn update_user_profile(&self, session_id: &str, update: ProfileUpdate) -> bool {
        let user_id = user_id_for(session_id);
        match self.tiers.user.update_user_profile(&user_id, update).await {
            Ok(_) => true,
            Err(e) => {
                warn!(session_id, error = %e, "Profile update failed");
                false
            }
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let vector_store_available = self.tiers.episodic.has_vector_store();
        let session_store_available = self.session_store_available;
        let llm_available = self.llm.is_some();
        let status = if vector_store_available && session_store_available && llm_available {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            vector_store_available,
            session_store_available,
            llm_available,
            live_consolidations: self.live_consolidations().await,
            working_sessions: self.tiers.working.session_count().await,
            working_items: self.tiers.working.total_items().await,
            session_caches: self.tiers.session.session_count().await,
            user_profiles: self.tiers.user.profile_count().await,
            episodic_patterns: self.tiers.episodic.pattern_count().await,
        }
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.snapshot()
    }
}

/// Builder for [`MemoryManager`].
#[derive(Default)]
pub struct MemoryManagerBuilder {
    config: MemoryConfig,
    llm: Option<Arc<dyn LlmProvider>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    session_store: Option<Arc<dyn SessionStore>>,
    sanitizer: Option<Arc<dyn Sanitizer>>,
}

impl MemoryManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the working-memory bound per session.
    pub fn max_items(mut self, max_items: usize) -> Self {
        self.config.working.max_items = max_items;
        self
    }

    /// Fail writes when the durable store rejects them.
    pub fn durable(mut self, durable: bool) -> Self {
        self.config.session.durable = durable;
        self
    }

    /// Set the per-branch retrieval deadline in milliseconds.
    pub fn branch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.retrieval.branch_timeout_ms = timeout_ms;
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn build(self) -> Result<MemoryManager> {
        self.config.validate()?;
        let config = self.config;

        let tiers = MemoryTiers {
            working: WorkingMemory::new(&config.working),
            session: SessionMemory::new(&config.session, self.session_store.clone()),
            user: UserMemory::new(&config.session, self.session_store.clone()),
            episodic: EpisodicMemory::new(config.episodic.clone(), self.vector_store),
        };

        Ok(MemoryManager {
            session_store_available: self.session_store.is_some(),
            config,
            tiers: Arc::new(tiers),
            llm: self.llm,
            sanitizer: self.sanitizer,
            tasks: Arc::new(Mutex::new(TaskRegistry::default())),
            generation: AtomicU64::new(0),
            stats: Arc::new(StatsCounters::default()),
        })
    }
}
