//! Lexical turn classification.
//!
//! Classification inspects the context's suspension marker first: a pending
//! `waiting_for` narrows the routing table to answers for that question.
//! Only when nothing is pending does the cohort/new-text routing apply.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::context::{CodeSelectionMode, ConversationContext, WaitingFor};

/// The routing targets of a turn. Every input maps to exactly one step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStep {
    InterpretIntent,
    SearchCodes,
    ConfirmCodes,
    AskForAnalysis,
    AnswerQuestion,
    Refine,
    Error,
}

/// Outcome of classifying one turn of user text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub step: ConversationStep,
    /// Set only when routing through confirm-codes.
    pub code_selection_mode: Option<CodeSelectionMode>,
    /// Message attached when routing straight to the error state.
    pub message: Option<String>,
}

impl Classification {
    fn step(step: ConversationStep) -> Self {
        Self {
            step,
            code_selection_mode: None,
            message: None,
        }
    }

    fn confirm(mode: CodeSelectionMode) -> Self {
        Self {
            step: ConversationStep::ConfirmCodes,
            code_selection_mode: Some(mode),
            message: None,
        }
    }

    fn error(message: &str) -> Self {
        Self {
            step: ConversationStep::Error,
            code_selection_mode: None,
            message: Some(message.to_string()),
        }
    }
}

/// Compiled word-alternation tables, built once on first classification.
struct RoutingPatterns {
    affirmative: Regex,
    negative: Regex,
    select_chosen: Regex,
    select_interactive: Regex,
    select_excluded: Regex,
    refine: Regex,
    analytic: Regex,
}

fn patterns() -> &'static RoutingPatterns {
    static PATTERNS: OnceLock<RoutingPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| RoutingPatterns {
        affirmative: word_set(&[
            "yes", "yeah", "yep", "sure", "ok", "okay", "proceed", "go ahead", "search", "find",
        ]),
        negative: word_set(&["no", "nope", "skip", "don't", "dont", "stop", "cancel"]),
        select_chosen: word_set(&["selected", "chosen", "those", "these", "keep"]),
        select_interactive: word_set(&["choose", "pick", "let me", "interactively", "myself"]),
        select_excluded: word_set(&[
            "except", "exclude", "excluding", "without", "remove", "drop",
        ]),
        refine: word_set(&[
            "refine", "change", "adjust", "modify", "different", "instead", "narrow", "broaden",
        ]),
        analytic: word_set(&[
            "how many",
            "count",
            "breakdown",
            "break down",
            "compare",
            "average",
            "distribution",
            "percent",
            "percentage",
            "show",
            "what",
            "which",
            "insight",
            "insights",
            "trend",
        ]),
    })
}

/// Case-insensitive whole-word alternation. The tables above are static, so
/// a pattern that fails to compile is a programming error and panics on
/// first use.
fn word_set(words: &[&str]) -> Regex {
    let pattern = format!(r"(?i)\b(?:{})\b", words.join("|"));
    Regex::new(&pattern).expect("word alternation compiles")
}

/// Assign exactly one step to the new turn text.
pub fn classify(context: &ConversationContext, text: &str) -> Classification {
    let patterns = patterns();
    match context.waiting_for {
        WaitingFor::CodeSearchConfirmation => {
            if patterns.affirmative.is_match(text) {
                Classification::step(ConversationStep::SearchCodes)
            } else if patterns.negative.is_match(text) {
                Classification::error("Code search skipped at user request")
            } else {
                // Anything not explicitly negative counts as confirmation.
                Classification::step(ConversationStep::SearchCodes)
            }
        }
        WaitingFor::CodeSelection => {
            if patterns.select_excluded.is_match(text) {
                Classification::confirm(CodeSelectionMode::Excluded)
            } else if patterns.select_interactive.is_match(text) {
                Classification::confirm(CodeSelectionMode::Interactive)
            } else if patterns.select_chosen.is_match(text) {
                Classification::confirm(CodeSelectionMode::Selected)
            } else {
                // "use all" wording and anything unmatched both take every code.
                Classification::confirm(CodeSelectionMode::All)
            }
        }
        WaitingFor::AnalysisDecision => {
            if patterns.refine.is_match(text) {
                Classification::step(ConversationStep::Refine)
            } else {
                Classification::step(ConversationStep::AskForAnalysis)
            }
        }
        WaitingFor::None => {
            if context.cohort.is_some() && patterns.analytic.is_match(text) {
                return Classification::step(ConversationStep::AnswerQuestion);
            }
            // Default: a fresh cohort round.
            Classification::step(ConversationStep::InterpretIntent)
        }
    }
}
