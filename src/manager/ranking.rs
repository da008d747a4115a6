//! Relevance ranking of retrieved history and insights.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};

use crate::config::RetrievalConfig;
use crate::memory::{Insight, InsightType, MemoryItem, ScoredPattern, SkillLevel, UserProfile};
use crate::relevance::{clamp_unit, jaccard, keywords, mentions_expertise, recency_decay};

use super::types::{InsightSource, RankedInsight, RankedItem};

const INSIGHT_ITEM_WEIGHT: f64 = 1.2;
const TURN_ITEM_WEIGHT: f64 = 0.9;
const HISTORY_THRESHOLD: f64 = 0.1;
const EXPERTISE_BOOST: f64 = 1.2;

const SESSION_INSIGHT_THRESHOLD: f64 = 0.1;
const EPISODIC_THRESHOLD: f64 = 0.15;
const EPISODIC_DOMAIN_BOOST: f64 = 1.15;

const DAY_HOURS: f64 = 24.0;
const HOUR: f64 = 1.0;

/// Two-pass history ranking.
///
/// The first pass scores keyword overlap weighted by a day-long decay and the
/// item kind, and keeps the best `history_candidates` above 0.1. The second
/// pass boosts items that mention the user's expertise, applies an hour-long
/// decay, and keeps `max_history`.
pub fn rank_history(
    query: &str,
    items: Vec<MemoryItem>,
    profile: &UserProfile,
    now: DateTime<Utc>,
    config: &RetrievalConfig,
) -> Vec<RankedItem> {
    let query_words = keywords(query);

    let mut candidates: Vec<RankedItem> = items
        .into_iter()
        .filter_map(|item| {
            let text = item.content.searchable_text();
            let kind_weight = if item.content.is_insight() {
                INSIGHT_ITEM_WEIGHT
            } else {
                TURN_ITEM_WEIGHT
            };
            let relevance = clamp_unit(
                jaccard(&query_words, &keywords(&text))
                    * recency_decay(item.timestamp, now, DAY_HOURS)
                    * kind_weight,
            );
            (relevance >= HISTORY_THRESHOLD).then_some(RankedItem { item, relevance })
        })
        .collect();
    sort_items(&mut candidates);
    candidates.truncate(config.history_candidates);

    for candidate in candidates.iter_mut() {
        let mut relevance = candidate.relevance;
        let text = candidate.item.content.searchable_text();
        if mentions_expertise(&text, &profile.domain_expertise) {
            relevance *= EXPERTISE_BOOST;
        }
        relevance *= recency_decay(candidate.item.timestamp, now, HOUR);
        candidate.relevance = clamp_unit(relevance);
    }
    sort_items(&mut candidates);
    candidates.truncate(config.max_history);
    candidates
}

fn sort_items(items: &mut [RankedItem]) {
    items.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then_with(|| b.item.timestamp.cmp(&a.item.timestamp))
    });
}

/// Skill-dependent boost: beginners see root causes first, advanced users
/// see solutions first.
fn skill_adaptation(skill: SkillLevel, insight_type: &InsightType) -> f64 {
    match (skill, insight_type) {
        (SkillLevel::Beginner, InsightType::RootCause) => 1.3,
        (SkillLevel::Advanced, InsightType::Solution) => 1.2,
        _ => 1.0,
    }
}

fn pattern_in_expertise(pattern: &ScoredPattern, expertise: &BTreeSet<String>) -> bool {
    let domain_listed = pattern
        .pattern
        .payload
        .domain
        .as_deref()
        .map(|d| expertise.contains(&d.trim().to_lowercase()))
        .unwrap_or(false);
    domain_listed || mentions_expertise(&pattern.pattern.searchable_text(), expertise)
}

/// Merge session insights and episodic patterns into one ranked list.
pub fn rank_insights(
    query: &str,
    session: Vec<Insight>,
    episodic: Vec<ScoredPattern>,
    profile: &UserProfile,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<RankedInsight> {
    let query_words: HashSet<String> = keywords(query);
    let mut ranked = Vec::with_capacity(session.len() + episodic.len());

    for insight in session {
        let overlap = jaccard(&query_words, &keywords(&insight.searchable_text()));
        let relevance = clamp_unit(
            overlap
                * insight.confidence
                * skill_adaptation(profile.skill_level, &insight.insight_type)
                * recency_decay(insight.timestamp, now, DAY_HOURS),
        );
        if relevance >= SESSION_INSIGHT_THRESHOLD {
            ranked.push(RankedInsight {
                source: InsightSource::Session(insight),
                relevance,
            });
        }
    }

    for scored in episodic {
        let boost = if pattern_in_expertise(&scored, &profile.domain_expertise) {
            EPISODIC_DOMAIN_BOOST
        } else {
            1.0
        };
        let relevance = clamp_unit(scored.similarity * boost * scored.pattern.confidence);
        if relevance >= EPISODIC_THRESHOLD {
            ranked.push(RankedInsight {
                source: InsightSource::Episodic(scored.pattern),
                relevance,
            });
        }
    }

    ranked.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    ranked.truncate(limit);
    ranked
}

/// Mean of history fill, insight fill, profile completeness and domain
/// confidence.
pub fn quality_score(
    history_len: usize,
    insights_len: usize,
    profile: &UserProfile,
    domain_confidence: f64,
) -> f64 {
    let history_fill = (history_len as f64 / 5.0).min(1.0);
    let insight_fill = (insights_len as f64 / 3.0).min(1.0);
    clamp_unit(
        (history_fill + insight_fill + profile.completeness() + clamp_unit(domain_confidence))
            / 4.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EpisodicPattern, InsightPayload, MemoryContent, PatternPayload, Turn};
    use chrono::Duration;
    use proptest::prelude::*;

    fn turn(query: &str, age_hours: i64) -> MemoryItem {
        let mut item = MemoryItem::new(MemoryContent::Turn(Turn::new(query)), 0.8);
        item.timestamp = Utc::now() - Duration::hours(age_hours);
        item
    }

    fn pattern(description: &str, domain: Option<&str>, confidence: f64) -> EpisodicPattern {
        EpisodicPattern {
            id: description.to_string(),
            pattern_type: "solution_effectiveness".to_string(),
            payload: PatternPayload {
                description: description.to_string(),
                domain: domain.map(str::to_string),
                ..Default::default()
            },
            frequency: 1,
            confidence,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_history_drops_unrelated_items() {
        let profile = UserProfile::new("u1");
        let items = vec![turn("nginx returns 502", 0), turn("weather is nice", 0)];
        let config = RetrievalConfig::default();
        let ranked = rank_history("nginx 502", items, &profile, Utc::now(), &config);

        assert_eq!(ranked.len(), 1);
        assert!(matches!(
            &ranked[0].item.content,
            MemoryContent::Turn(t) if t.query == "nginx returns 502"
        ));
    }

    #[test]
    fn test_history_prefers_recent_and_insights() {
        let profile = UserProfile::new("u1");
        let insight = Insight::new("solution", InsightPayload::new("nginx 502 upstream"), 0.9);
        let insight_item = MemoryItem::new(MemoryContent::Insight(insight), 0.9);
        let items = vec![turn("nginx 502 upstream", 30), insight_item];

        let ranked = rank_history(
            "nginx 502 upstream",
            items,
            &profile,
            Utc::now(),
            &RetrievalConfig::default(),
        );
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].item.content.is_insight());
    }

    #[test]
    fn test_history_respects_limits() {
        let profile = UserProfile::new("u1");
        let items: Vec<MemoryItem> = (0..20).map(|_| turn("disk full", 0)).collect();
        let config = RetrievalConfig::default();
        let ranked = rank_history("disk full", items, &profile, Utc::now(), &config);
        assert_eq!(ranked.len(), config.max_history);
    }

    #[test]
    fn test_expertise_boost_reorders_history() {
        let mut profile = UserProfile::new("u1");
        profile.domain_expertise.insert("postgres".to_string());

        let now = Utc::now();
        let plain = turn("slow query tuning", 0);
        let expert = turn("slow query postgres", 0);
        let ranked = rank_history(
            "slow query",
            vec![plain, expert],
            &profile,
            now,
            &RetrievalConfig::default(),
        );
        assert!(matches!(
            &ranked[0].item.content,
            MemoryContent::Turn(t) if t.query.contains("postgres")
        ));
    }

    #[test]
    fn test_skill_adaptation() {
        assert_eq!(skill_adaptation(SkillLevel::Beginner, &InsightType::RootCause), 1.3);
        assert_eq!(skill_adaptation(SkillLevel::Advanced, &InsightType::Solution), 1.2);
        assert_eq!(skill_adaptation(SkillLevel::Advanced, &InsightType::RootCause), 1.0);
        assert_eq!(skill_adaptation(SkillLevel::Intermediate, &InsightType::Solution), 1.0);
    }

    #[test]
    fn test_insights_merge_and_threshold() {
        let profile = UserProfile::new("u1");
        let session = vec![
            Insight::new("root_cause", InsightPayload::new("disk full"), 0.9),
            Insight::new("root_cause", InsightPayload::new("unrelated thing"), 0.9),
        ];
        let episodic = vec![
            ScoredPattern {
                pattern: pattern("disk cleanup", None, 0.9),
                similarity: 0.5,
            },
            ScoredPattern {
                pattern: pattern("weak", None, 0.2),
                similarity: 0.5,
            },
        ];

        let ranked = rank_insights("disk full", session, episodic, &profile, Utc::now(), 6);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().any(RankedInsight::is_episodic));
        assert!(ranked.windows(2).all(|w| w[0].relevance >= w[1].relevance));
    }

    #[test]
    fn test_episodic_domain_boost() {
        let mut profile = UserProfile::new("u1");
        profile.domain_expertise.insert("network".to_string());
        let episodic = vec![
            ScoredPattern {
                pattern: pattern("a", Some("network"), 0.8),
                similarity: 0.5,
            },
            ScoredPattern {
                pattern: pattern("b", Some("database"), 0.8),
                similarity: 0.5,
            },
        ];

        let ranked = rank_insights("x", Vec::new(), episodic, &profile, Utc::now(), 6);
        assert!((ranked[0].relevance - 0.46).abs() < 1e-9);
        assert!((ranked[1].relevance - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_quality_score() {
        let mut profile = UserProfile::new("u1");
        profile.domain_expertise.insert("db".into());
        assert_eq!(quality_score(5, 3, &profile, 1.0), 1.0);

        let fresh = UserProfile::new("u2");
        let score = quality_score(0, 0, &fresh, 0.0);
        assert!((score - (2.0 / 3.0) / 4.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn relevance_scores_stay_in_unit_interval(
            queries in proptest::collection::vec("[a-z]{1,6}( [a-z]{1,6}){0,4}", 1..8),
            confidence in 0.0f64..1.0,
            similarity in 0.0f64..1.0,
        ) {
            let profile = UserProfile::new("u1");
            let items: Vec<MemoryItem> = queries.iter().map(|q| turn(q, 0)).collect();
            let config = RetrievalConfig::default();
            let history = rank_history(&queries[0], items, &profile, Utc::now(), &config);
            for ranked in &history {
                prop_assert!((0.0..=1.0).contains(&ranked.relevance));
            }

            let session = queries
                .iter()
                .map(|q| Insight::new("root_cause", InsightPayload::new(q.clone()), confidence))
                .collect();
            let episodic = vec![ScoredPattern {
                pattern: pattern(&queries[0], None, confidence),
                similarity,
            }];
            for ranked in rank_insights(&queries[0], session, episodic, &profile, Utc::now(), 6) {
                prop_assert!((0.0..=1.0).contains(&ranked.relevance));
            }
        }
    }
}
