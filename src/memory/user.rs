//! User memory: per-user profile and interaction habits.
//!
//! Profiles follow the same write-through rules as session insights. A
//! profile that could not be read from the store is never written back over
//! the stored one: changes made meanwhile are kept as pending and replayed
//! onto the stored profile once a load succeeds.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::collaborators::SessionStore;
use crate::config::SessionMemoryConfig;
use crate::error::{require_id, Error, Result};

use super::locks::KeyedLocks;
use super::types::{InteractionPatternsUpdate, InteractionRecord, ProfileUpdate, UserProfile};

fn profile_key(user_id: &str) -> String {
    format!("profile:{}", user_id)
}

/// A change to a profile, kept so it can be replayed.
#[derive(Debug, Clone)]
enum ProfileChange {
    Update(ProfileUpdate),
    Interaction(InteractionRecord, DateTime<Utc>),
}

impl ProfileChange {
    fn apply_to(&self, profile: &mut UserProfile) {
        match self {
            Self::Update(update) => profile.apply(update.clone()),
            Self::Interaction(record, at) => {
                let update = interaction_update(profile, record, *at);
                profile.apply(update);
            }
        }
    }
}

#[derive(Debug)]
struct ProfileEntry {
    profile: UserProfile,
    /// Changes not yet applied to the stored profile
    pending: Vec<ProfileChange>,
    /// Whether the stored profile has been read into `profile`
    synced: bool,
}

impl ProfileEntry {
    fn fresh(user_id: &str, synced: bool) -> Self {
        Self {
            profile: UserProfile::new(user_id),
            pending: Vec::new(),
            synced,
        }
    }
}

/// Profile cache with merge-on-update semantics.
pub struct UserMemory {
    profiles: RwLock<HashMap<String, ProfileEntry>>,
    store: Option<Arc<dyn SessionStore>>,
    write_locks: KeyedLocks,
    durable: bool,
}

impl UserMemory {
    pub fn new(config: &SessionMemoryConfig, store: Option<Arc<dyn SessionStore>>) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            store,
            write_locks: KeyedLocks::new(),
            durable: config.durable,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(&SessionMemoryConfig::default(), None)
    }

    /// Cached profile, the stored one, or defaults on first access.
    ///
    /// Defaults returned because the store could not be read are not cached.
    pub async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile> {
        require_id("user_id", user_id)?;
        let synced = self.is_synced(user_id).await || {
            let _guard = self.write_locks.lock(user_id).await;
            self.ensure_loaded(user_id).await
        };

        let mut profiles = self.profiles.write().await;
        if let Some(entry) = profiles.get(user_id) {
            return Ok(entry.profile.clone());
        }
        let entry = ProfileEntry::fresh(user_id, synced);
        let profile = entry.profile.clone();
        if synced {
            profiles.insert(user_id.to_string(), entry);
        }
        Ok(profile)
    }

    /// Merge an update into the profile and persist it.
    ///
    /// Skill level and communication style replace, domain expertise is
    /// unioned, interaction patterns are merged field by field.
    pub async fn update_user_profile(
        &self,
        user_id: &str,
        update: ProfileUpdate,
    ) -> Result<UserProfile> {
        self.change(user_id, ProfileChange::Update(update)).await
    }

    /// Fold one interaction into the profile.
    ///
    /// The session-length average is `(old + new) / 2`, which weights the
    /// latest session at one half regardless of history.
    pub async fn track_interaction(
        &self,
        user_id: &str,
        record: InteractionRecord,
    ) -> Result<UserProfile> {
        self.change(user_id, ProfileChange::Interaction(record, Utc::now())).await
    }

    pub async fn profile_count(&self) -> usize {
        self.profiles.read().await.len()
    }

    /// Apply a change and mirror the result.
    ///
    /// Changes to one user are serialized from read to mirror.
    async fn change(&self, user_id: &str, change: ProfileChange) -> Result<UserProfile> {
        require_id("user_id", user_id)?;
        let _guard = self.write_locks.lock(user_id).await;

        let synced = self.ensure_loaded(user_id).await;
        if !synced && self.durable {
            return Err(Error::Persistence(format!(
                "profile {}: stored profile could not be loaded",
                user_id
            )));
        }

        let (profile, mirror) = {
            let mut profiles = self.profiles.write().await;
            let entry = profiles
                .entry(user_id.to_string())
                .or_insert_with(|| ProfileEntry::fresh(user_id, synced));
            change.apply_to(&mut entry.profile);
            let mirror = synced || entry.synced;
            if !mirror {
                entry.pending.push(change);
            }
            (entry.profile.clone(), mirror)
        };

        if mirror {
            self.persist(&profile).await?;
        } else {
            warn!(user_id, "Profile change kept locally, stored profile not loaded");
        }
        Ok(profile)
    }

    /// Fill the cache from the store on a miss, replaying pending changes.
    ///
    /// Returns whether the cached profile now reflects the stored one.
    ///
    /// Callers hold the user's write lock.
    async fn ensure_loaded(&self, user_id: &str) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        if self.is_synced(user_id).await {
            return true;
        }

        let stored = match load(store.as_ref(), user_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to load user profile");
                return false;
            }
        };

        let mut profiles = self.profiles.write().await;
        let entry = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| ProfileEntry::fresh(user_id, false));
        let mut profile = stored.unwrap_or_else(|| UserProfile::new(user_id));
        for change in entry.pending.drain(..) {
            change.apply_to(&mut profile);
        }
        entry.profile = profile;
        entry.synced = true;
        true
    }

    async fn is_synced(&self, user_id: &str) -> bool {
        self.store.is_none()
            || self
                .profiles
                .read()
                .await
                .get(user_id)
                .map_or(false, |entry| entry.synced)
    }

    async fn persist(&self, profile: &UserProfile) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let outcome = match serde_json::to_string(profile) {
            Ok(blob) => store.set(&profile_key(&profile.user_id), blob).await,
            Err(e) => Err(Error::from(e)),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if self.durable => Err(Error::Persistence(format!(
                "profile {}: {}",
                profile.user_id, e
            ))),
            Err(e) => {
                warn!(user_id = %profile.user_id, error = %e, "Profile write-through failed");
                Ok(())
            }
        }
    }
}

/// Stored profile, if any. An unreadable blob counts as absent.
async fn load(store: &dyn SessionStore, user_id: &str) -> Result<Option<UserProfile>> {
    let Some(blob) = store.get(&profile_key(user_id)).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&blob) {
        Ok(profile) => {
            debug!(user_id, "Loaded user profile");
            Ok(Some(profile))
        }
        Err(e) => {
            warn!(user_id, error = %e, "Discarding unreadable stored profile");
            Ok(None)
        }
    }
}

/// Profile changes implied by one interaction.
fn interaction_update(
    profile: &UserProfile,
    record: &InteractionRecord,
    at: DateTime<Utc>,
) -> ProfileUpdate {
    let patterns = &profile.interaction_patterns;
    let mut patterns_update = InteractionPatternsUpdate::default();

    if let Some(length) = record.session_length {
        let avg = match patterns.avg_session_length {
            Some(old) => (old + length) / 2.0,
            None => length,
        };
        patterns_update.avg_session_length = Some(avg);
    }

    if let Some(domain) = normalized(record.problem_domain.as_deref()) {
        if !patterns.problem_domains.contains(&domain) {
            let mut domains = patterns.problem_domains.clone();
            domains.push(domain);
            patterns_update.problem_domains = Some(domains);
        }
    }

    if record.effective {
        if let Some(solution_type) = normalized(record.solution_type.as_deref()) {
            if !patterns.preferred_solution_types.contains(&solution_type) {
                let mut types = patterns.preferred_solution_types.clone();
                types.push(solution_type);
                patterns_update.preferred_solution_types = Some(types);
            }
        }
    }

    let mut history = profile.historical_context.clone();
    history.total_interactions += 1;
    if record.effective {
        history.effective_interactions += 1;
    }
    history.last_interaction = Some(at);

    ProfileUpdate {
        interaction_patterns: Some(patterns_update),
        historical_context: Some(history),
        ..Default::default()
    }
}

fn normalized(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{CommunicationStyle, SkillLevel};
    use crate::store::InMemorySessionStore;
    use crate::testing::{FailingSessionStore, FlakySessionStore};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn expertise(domains: &[&str]) -> BTreeSet<String> {
        domains.iter().map(|s| s.to_string()).collect()
    }

    async fn stored_profile(store: &InMemorySessionStore, user_id: &str) -> UserProfile {
        let shared: Arc<dyn SessionStore> = Arc::new(store.clone());
        UserMemory::new(&SessionMemoryConfig::default(), Some(shared))
            .get_user_profile(user_id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_default_profile() {
        let memory = UserMemory::in_memory();
        let profile = memory.get_user_profile("u1").await.unwrap();
        assert_eq!(profile.skill_level, SkillLevel::Intermediate);
        assert_eq!(profile.communication_style, CommunicationStyle::Balanced);
        assert!(profile.domain_expertise.is_empty());
        assert_eq!(memory.profile_count().await, 1);
    }

    #[tokio::test]
    async fn test_expertise_is_unioned() {
        let memory = UserMemory::in_memory();
        memory
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["db"]))
            .await
            .unwrap();
        let profile = memory
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["net"]))
            .await
            .unwrap();

        let expected: BTreeSet<String> = ["db", "net"].iter().map(|s| s.to_string()).collect();
        assert_eq!(profile.domain_expertise, expected);
    }

    #[tokio::test]
    async fn test_scalar_fields_replace() {
        let memory = UserMemory::in_memory();
        let profile = memory
            .update_user_profile(
                "u1",
                ProfileUpdate::new()
                    .skill_level(SkillLevel::Advanced)
                    .communication_style(CommunicationStyle::Concise),
            )
            .await
            .unwrap();
        assert_eq!(profile.skill_level, SkillLevel::Advanced);
        assert_eq!(profile.communication_style, CommunicationStyle::Concise);
    }

    #[tokio::test]
    async fn test_track_interaction_running_average() {
        let memory = UserMemory::in_memory();
        let record = |length| InteractionRecord {
            session_length: Some(length),
            ..Default::default()
        };

        memory.track_interaction("u1", record(10.0)).await.unwrap();
        memory.track_interaction("u1", record(20.0)).await.unwrap();
        let profile = memory.track_interaction("u1", record(40.0)).await.unwrap();

        // (10 + 20) / 2 = 15, then (15 + 40) / 2 = 27.5
        assert_eq!(profile.interaction_patterns.avg_session_length, Some(27.5));
        assert_eq!(profile.historical_context.total_interactions, 3);
    }

    #[tokio::test]
    async fn test_track_interaction_domains_and_preferences() {
        let memory = UserMemory::in_memory();
        memory
            .track_interaction(
                "u1",
                InteractionRecord {
                    problem_domain: Some("network".into()),
                    solution_type: Some("restart".into()),
                    effective: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let profile = memory
            .track_interaction(
                "u1",
                InteractionRecord {
                    problem_domain: Some("Network".into()),
                    solution_type: Some("config_change".into()),
                    effective: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let patterns = &profile.interaction_patterns;
        assert_eq!(patterns.problem_domains, vec!["network".to_string()]);
        assert_eq!(
            patterns.preferred_solution_types,
            vec!["config_change".to_string()]
        );
        assert_eq!(profile.historical_context.effective_interactions, 1);
        assert!(profile.historical_context.last_interaction.is_some());
    }

    #[tokio::test]
    async fn test_profile_persists_and_reloads() {
        let store = InMemorySessionStore::new();
        let shared: Arc<dyn SessionStore> = Arc::new(store);

        let writer = UserMemory::new(&SessionMemoryConfig::default(), Some(shared.clone()));
        writer
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["cloud"]))
            .await
            .unwrap();

        let reader = UserMemory::new(&SessionMemoryConfig::default(), Some(shared));
        let profile = reader.get_user_profile("u1").await.unwrap();
        assert!(profile.domain_expertise.contains("cloud"));
    }

    #[tokio::test]
    async fn test_durable_flag_controls_write_failures() {
        let store: Arc<dyn SessionStore> = Arc::new(FailingSessionStore);

        let lenient = UserMemory::new(&SessionMemoryConfig { durable: false }, Some(store.clone()));
        assert!(lenient
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["db"]))
            .await
            .is_ok());

        let strict = UserMemory::new(&SessionMemoryConfig { durable: true }, Some(store));
        let err = strict
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["db"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[tokio::test]
    async fn test_failed_load_does_not_replace_stored_profile() {
        let store = InMemorySessionStore::new();
        let shared: Arc<dyn SessionStore> = Arc::new(store.clone());
        UserMemory::new(&SessionMemoryConfig::default(), Some(shared))
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["db"]))
            .await
            .unwrap();

        let flaky: Arc<dyn SessionStore> =
            Arc::new(FlakySessionStore::new(store.clone()).failing_gets(1));
        let memory = UserMemory::new(&SessionMemoryConfig::default(), Some(flaky));
        memory
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["net"]))
            .await
            .unwrap();
        assert_eq!(stored_profile(&store, "u1").await.domain_expertise, expertise(&["db"]));

        // Once the store is readable the local change is replayed onto it
        let profile = memory.get_user_profile("u1").await.unwrap();
        assert_eq!(profile.domain_expertise, expertise(&["db", "net"]));

        memory
            .update_user_profile("u1", ProfileUpdate::new().domain_expertise(["cloud"]))
            .await
            .unwrap();
        assert_eq!(
            stored_profile(&store, "u1").await.domain_expertise,
            expertise(&["cloud", "db", "net"])
        );
    }

    #[tokio::test]
    async fn test_unreadable_store_defaults_are_not_cached() {
        let flaky: Arc<dyn SessionStore> =
            Arc::new(FlakySessionStore::new(InMemorySessionStore::new()).failing_gets(1));
        let memory = UserMemory::new(&SessionMemoryConfig::default(), Some(flaky));

        let profile = memory.get_user_profile("u1").await.unwrap();
        assert!(profile.domain_expertise.is_empty());
        assert_eq!(memory.profile_count().await, 0);

        memory.get_user_profile("u1").await.unwrap();
        assert_eq!(memory.profile_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_interactions_are_all_counted() {
        let store = InMemorySessionStore::new();
        let slow: Arc<dyn SessionStore> = Arc::new(
            FlakySessionStore::new(store.clone()).slow_first_set(Duration::from_millis(100)),
        );
        let memory = UserMemory::new(&SessionMemoryConfig::default(), Some(slow));
        let record = || InteractionRecord {
            effective: true,
            ..Default::default()
        };

        let (first, second) = tokio::join!(
            memory.track_interaction("u1", record()),
            memory.track_interaction("u1", record()),
        );
        first.unwrap();
        second.unwrap();

        let cached = memory.get_user_profile("u1").await.unwrap();
        assert_eq!(cached.historical_context.total_interactions, 2);
        let stored = stored_profile(&store, "u1").await;
        assert_eq!(stored.historical_context.total_interactions, 2);
        assert_eq!(stored.historical_context.effective_interactions, 2);
    }

    #[tokio::test]
    async fn test_rejects_empty_user() {
        let memory = UserMemory::in_memory();
        assert!(memory.get_user_profile("").await.is_err());
    }
}
