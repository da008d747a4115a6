//! Background consolidation of a troubleshooting result into memory.

use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collaborators::LlmProvider;
use crate::error::Result;
use crate::memory::{
    Insight, InsightPayload, InteractionRecord, PatternData, PatternPayload, ProfileUpdate,
    SkillLevel,
};

use super::types::{Complexity, ConsolidationState, TroubleshootingResult};
use super::MemoryTiers;

/// Pattern type recorded for every consolidated result.
pub const SOLUTION_EFFECTIVENESS: &str = "solution_effectiveness";

const WORKING_MIRROR_COUNT: usize = 3;
const PROFILE_UPDATE_THRESHOLD: f64 = 0.7;
const PROMOTION_THRESHOLD: f64 = 0.8;
const DEFAULT_EFFECTIVENESS: f64 = 0.5;
const ROOT_CAUSE_CONFIDENCE: f64 = 0.8;

/// One insight as returned by the LLM.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ExtractedInsight {
    #[serde(alias = "type")]
    pub insight_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub solution_type: Option<String>,
}

fn default_confidence() -> f64 {
    DEFAULT_EFFECTIVENESS
}

impl ExtractedInsight {
    fn into_insight(self) -> Insight {
        let payload = InsightPayload {
            description: self.description,
            root_cause: self.root_cause,
            solution: self.solution,
            domain: self.domain,
            solution_type: self.solution_type,
            tags: Vec::new(),
        };
        Insight::new(self.insight_type, payload, self.confidence)
    }
}

pub(crate) fn extraction_prompt(result: &TroubleshootingResult) -> String {
    let body = serde_json::to_string_pretty(result).unwrap_or_default();
    format!(
        "Extract reusable troubleshooting insights from the result below.\n\
         Respond with a JSON array only. Each element must have the fields \
         \"insight_type\" (one of root_cause, solution, error, pattern), \
         \"description\" and \"confidence\" (0 to 1), and may have \
         \"root_cause\", \"solution\", \"domain\" and \"solution_type\".\n\n\
         Result:\n{}",
        body
    )
}

/// Parse the JSON array between the first `[` and the last `]`.
pub(crate) fn parse_insight_array(text: &str) -> Option<Vec<ExtractedInsight>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    let insights: Vec<ExtractedInsight> = serde_json::from_str(&text[start..=end]).ok()?;
    let insights: Vec<ExtractedInsight> = insights
        .into_iter()
        .filter(|i| !i.insight_type.trim().is_empty())
        .collect();
    (!insights.is_empty()).then_some(insights)
}

/// Insights derived directly from the result fields.
pub(crate) fn heuristic_insights(result: &TroubleshootingResult) -> Vec<Insight> {
    let mut insights = Vec::new();
    if let Some(root_cause) = &result.root_cause {
        let mut payload = InsightPayload::new(root_cause.clone());
        payload.root_cause = Some(root_cause.clone());
        payload.domain = result.domain.clone();
        insights.push(Insight::new("root_cause", payload, ROOT_CAUSE_CONFIDENCE));
    }
    if let Some(solution) = &result.solution {
        let mut payload = InsightPayload::new(solution.clone());
        payload.solution = Some(solution.clone());
        payload.domain = result.domain.clone();
        payload.solution_type = result.solution_type.clone();
        insights.push(Insight::new(
            "solution",
            payload,
            result.effectiveness.unwrap_or(DEFAULT_EFFECTIVENESS),
        ));
    }
    insights
}

async fn extract_insights(
    llm: Option<&Arc<dyn LlmProvider>>,
    result: &TroubleshootingResult,
    session_id: &str,
) -> Vec<Insight> {
    let Some(llm) = llm else {
        return heuristic_insights(result);
    };

    match llm.generate_response(&extraction_prompt(result)).await {
        Ok(text) => match parse_insight_array(&text) {
            Some(extracted) => extracted
                .into_iter()
                .map(ExtractedInsight::into_insight)
                .collect(),
            None => {
                debug!(session_id, "Unparseable extraction, using heuristic insights");
                heuristic_insights(result)
            }
        },
        Err(e) => {
            warn!(session_id, error = %e, "Insight extraction failed, using heuristic insights");
            heuristic_insights(result)
        }
    }
}

fn is_effective(result: &TroubleshootingResult) -> bool {
    result
        .effectiveness
        .map_or(false, |e| e > PROFILE_UPDATE_THRESHOLD)
}

/// Profile changes implied by an effective result.
pub(crate) fn profile_update_for(result: &TroubleshootingResult) -> Option<ProfileUpdate> {
    if !is_effective(result) {
        return None;
    }
    let effectiveness = result.effectiveness.unwrap_or_default();

    let mut update = ProfileUpdate::new();
    if result.complexity == Some(Complexity::High) && effectiveness > PROMOTION_THRESHOLD {
        update = update.skill_level(SkillLevel::Advanced);
    }
    if let Some(domain) = &result.domain {
        update = update.domain_expertise([domain.clone()]);
    }
    (!update.is_empty()).then_some(update)
}

/// Run one consolidation.
///
/// The token is checked before every write so a superseded run stops
/// writing as soon as it notices.
pub(crate) async fn run(
    tiers: &MemoryTiers,
    llm: Option<&Arc<dyn LlmProvider>>,
    session_id: &str,
    user_id: &str,
    result: TroubleshootingResult,
    token: &CancellationToken,
) -> Result<ConsolidationState> {
    let insights = extract_insights(llm, &result, session_id).await;

    for insight in &insights {
        if token.is_cancelled() {
            return Ok(ConsolidationState::Cancelled);
        }
        tiers.session.store_existing(session_id, insight.clone()).await?;
    }

    let mut mirrored = insights;
    mirrored.sort_by(|a, b| {
        let a_rank = a.confidence * a.insight_type.importance_multiplier();
        let b_rank = b.confidence * b.insight_type.importance_multiplier();
        b_rank.total_cmp(&a_rank)
    });
    for insight in mirrored.iter().take(WORKING_MIRROR_COUNT) {
        if token.is_cancelled() {
            return Ok(ConsolidationState::Cancelled);
        }
        tiers.working.add_insight(session_id, insight.clone()).await?;
    }

    if is_effective(&result) {
        if token.is_cancelled() {
            return Ok(ConsolidationState::Cancelled);
        }
        if let Some(update) = profile_update_for(&result) {
            tiers.user.update_user_profile(user_id, update).await?;
        }
        let record = InteractionRecord {
            problem_domain: result.domain.clone(),
            solution_type: result.solution_type.clone(),
            effective: true,
            ..Default::default()
        };
        tiers.user.track_interaction(user_id, record).await?;
    }

    if token.is_cancelled() {
        return Ok(ConsolidationState::Cancelled);
    }
    let effectiveness = result.effectiveness.unwrap_or(DEFAULT_EFFECTIVENESS);
    let description = result
        .solution
        .clone()
        .or_else(|| result.summary.clone())
        .or_else(|| result.root_cause.clone())
        .unwrap_or_default();
    let payload = PatternPayload {
        description,
        domain: result.domain.clone(),
        solution_type: result.solution_type.clone(),
        effectiveness: Some(effectiveness),
        tags: Vec::new(),
    };
    tiers
        .episodic
        .store_cross_session_pattern(
            SOLUTION_EFFECTIVENESS,
            PatternData::new(1, effectiveness).with_payload(payload),
        )
        .await?;

    debug!(session_id, insights = mirrored.len(), "Consolidation finished");
    Ok(ConsolidationState::Completed)
}
