//! Conversation state carried across turns.
//!
//! The orchestrator reads, mutates, and returns one `ConversationContext`
//! per turn. The caller owns the context between turns (keyed by session id
//! in whatever store it likes), so everything here is serializable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::classify::ConversationStep;
use super::collaborators::GenerationTicket;

/// Which phrase category a code was found under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodeCategory {
    Condition,
    Drug,
    Procedure,
    /// Looked up from the raw query because no structured phrases were available.
    Fallback,
}

/// A clinical code returned by the semantic lookup, tagged with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeRecord {
    pub code: String,
    pub description: String,
    pub vocabulary: String,
    /// The search phrase that produced this code.
    pub source_phrase: String,
    pub category: CodeCategory,
}

/// Structured breakdown of the user's free-text criteria.
///
/// Field order within each list is insertion order and is preserved; the
/// display join-back relies on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CriteriaBreakdown {
    pub summary: String,
    pub conditions: Vec<String>,
    pub drugs: Vec<String>,
    pub procedures: Vec<String>,
    pub demographics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguities: Vec<String>,
}

impl CriteriaBreakdown {
    /// A breakdown containing only the raw query, used when the language
    /// understanding collaborator is unavailable.
    pub fn degraded(raw_query: &str) -> Self {
        Self {
            summary: raw_query.to_string(),
            ..Default::default()
        }
    }

    /// True when no structured phrases were extracted at all.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
            && self.drugs.is_empty()
            && self.procedures.is_empty()
            && self.demographics.is_empty()
    }

    /// Deterministic single-line rendering for display and prompts.
    pub fn display_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.conditions.is_empty() {
            parts.push(format!("conditions: {}", self.conditions.join(", ")));
        }
        if !self.drugs.is_empty() {
            parts.push(format!("drugs: {}", self.drugs.join(", ")));
        }
        if !self.procedures.is_empty() {
            parts.push(format!("procedures: {}", self.procedures.join(", ")));
        }
        if !self.demographics.is_empty() {
            parts.push(format!("demographics: {}", self.demographics.join(", ")));
        }
        if let Some(ref timeframe) = self.timeframe {
            parts.push(format!("timeframe: {}", timeframe));
        }
        if parts.is_empty() {
            self.summary.clone()
        } else {
            parts.join("; ")
        }
    }
}

/// What kind of human input the orchestrator is suspended awaiting.
///
/// Invariant: `waiting_for` is non-`None` iff the last turn ended at a
/// suspension point without reaching a terminal answer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitingFor {
    #[default]
    None,
    CodeSearchConfirmation,
    CodeSelection,
    AnalysisDecision,
}

/// How the human chose to narrow the found codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodeSelectionMode {
    All,
    Selected,
    /// The human wants to pick interactively; the turn stays suspended.
    Interactive,
    Excluded,
}

/// A materialized cohort result set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CohortHandle {
    pub table_id: String,
    pub row_count: u64,
}

/// Counts surfaced after cohort SQL generation.
///
/// `visits` and `sites` are fixed at zero: they need a dedicated secondary
/// count query that is not wired up yet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatientCounts {
    pub patients: u64,
    pub visits: u64,
    pub sites: u64,
}

impl PatientCounts {
    pub fn patients_only(patients: u64) -> Self {
        Self {
            patients,
            visits: 0,
            sites: 0,
        }
    }
}

/// One reasoning/trace entry for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub step: String,
    pub detail: String,
}

/// The unit of conversation state carried across turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Stable per-session identifier, assigned at creation.
    pub session_id: String,

    /// Raw user text of the current turn.
    pub user_query: String,

    /// Raw text of the round that produced `criteria`. Unlike `user_query`
    /// this survives confirmation turns ("yes", "use all") and feeds the
    /// code-search fallback and the generation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria_query: Option<String>,

    /// Structured criteria from the current round, if interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<CriteriaBreakdown>,

    /// Every code found this session, duplicates across phrases included.
    #[serde(default)]
    pub codes: Vec<CodeRecord>,

    /// The subset of codes the human has accepted.
    #[serde(default)]
    pub selected_codes: Vec<CodeRecord>,

    /// Distinct vocabularies represented in `codes`, sorted for determinism.
    #[serde(default)]
    pub vocabularies: Vec<String>,

    /// Selection mode decided by classification, consumed by confirm-codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_selection_mode: Option<CodeSelectionMode>,

    /// Active materialized cohort, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort: Option<CohortHandle>,

    /// Counts surfaced for the current cohort SQL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<PatientCounts>,

    /// The last SQL produced by the generation collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,

    /// Opaque continuation for the multi-turn NL-to-SQL exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_conversation: Option<GenerationTicket>,

    /// What human input the orchestrator is suspended awaiting.
    #[serde(default)]
    pub waiting_for: WaitingFor,

    /// Answer text from the most recent follow-up question, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_answer: Option<String>,

    /// Error slot; set when a turn ends in the error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Ordered reasoning trace for observability.
    #[serde(default)]
    pub trace: Vec<TraceEntry>,

    /// Step the last turn ended on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<ConversationStep>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_query: String::new(),
            criteria_query: None,
            criteria: None,
            codes: Vec::new(),
            selected_codes: Vec::new(),
            vocabularies: Vec::new(),
            code_selection_mode: None,
            cohort: None,
            counts: None,
            generated_sql: None,
            generation_conversation: None,
            waiting_for: WaitingFor::None,
            last_answer: None,
            error: None,
            trace: Vec::new(),
            current_step: None,
        }
    }

    /// Append a trace entry.
    pub fn trace(&mut self, step: &str, detail: impl Into<String>) {
        self.trace.push(TraceEntry {
            at: Utc::now(),
            step: step.to_string(),
            detail: detail.into(),
        });
    }

    /// Recompute the sorted, deduplicated vocabulary list from `codes`.
    pub fn refresh_vocabularies(&mut self) {
        let mut vocabularies: Vec<String> =
            self.codes.iter().map(|c| c.vocabulary.clone()).collect();
        vocabularies.sort();
        vocabularies.dedup();
        self.vocabularies = vocabularies;
    }

    /// Discard the current round's criteria and code state, keeping the
    /// cohort and generation continuation. Used when the human refines.
    pub fn reset_round(&mut self) {
        self.criteria_query = None;
        self.criteria = None;
        self.codes.clear();
        self.selected_codes.clear();
        self.vocabularies.clear();
        self.code_selection_mode = None;
        self.counts = None;
        self.generated_sql = None;
        self.error = None;
    }
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new()
    }
}
