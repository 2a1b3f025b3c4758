//! Turn orchestration state machine.
//!
//! `run_turn` is the whole conversational surface: context in, mutated
//! context out, with the caller owning persistence between turns. Every node
//! runs inside a failure boundary that writes the error slot and forces the
//! terminal error state instead of letting anything propagate; a turn that
//! errors keeps all accumulated codes and cohort state so the next turn can
//! retry or refine.

use std::collections::HashSet;
use std::sync::Arc;

use super::classify::{classify, Classification, ConversationStep};
use super::collaborators::{CodeSearch, CriteriaAnalyzer, Warehouse};
use super::context::{
    CodeCategory, CodeRecord, CodeSelectionMode, CohortHandle, ConversationContext,
    CriteriaBreakdown, PatientCounts, WaitingFor,
};
use super::nl2sql::{GenerationClient, GenerationResult};
use crate::error::{CohortIqError, Result};

/// Drives one conversation turn through the state machine.
pub struct TurnOrchestrator {
    analyzer: Arc<dyn CriteriaAnalyzer>,
    code_search: Arc<dyn CodeSearch>,
    generation: GenerationClient,
    warehouse: Arc<dyn Warehouse>,
    /// Generation space the NL-to-SQL service answers from.
    space: String,
    /// Codes requested per search phrase.
    max_codes_per_phrase: usize,
}

impl TurnOrchestrator {
    pub fn new(
        analyzer: Arc<dyn CriteriaAnalyzer>,
        code_search: Arc<dyn CodeSearch>,
        generation: GenerationClient,
        warehouse: Arc<dyn Warehouse>,
        space: impl Into<String>,
        max_codes_per_phrase: usize,
    ) -> Self {
        Self {
            analyzer,
            code_search,
            generation,
            warehouse,
            space: space.into(),
            max_codes_per_phrase,
        }
    }

    /// Run one turn. Never returns an error: failures land in the context's
    /// error slot with `current_step = Error`.
    pub async fn run_turn(
        &self,
        mut ctx: ConversationContext,
        text: &str,
    ) -> ConversationContext {
        ctx.user_query = text.to_string();
        ctx.error = None;

        let classification = classify(&ctx, text);
        ctx.trace("classify", format!("routed to {:?}", classification.step));
        tracing::debug!(step = ?classification.step, session = %ctx.session_id, "turn classified");

        match classification.step {
            ConversationStep::InterpretIntent => {
                self.interpret_intent(&mut ctx, text).await;
            }
            ConversationStep::Refine => {
                ctx.trace("refine", "discarding prior round state");
                ctx.reset_round();
                self.interpret_intent(&mut ctx, text).await;
            }
            ConversationStep::SearchCodes => {
                self.search_codes(&mut ctx).await;
            }
            ConversationStep::ConfirmCodes => {
                self.confirm_and_generate(&mut ctx, &classification).await;
            }
            ConversationStep::AskForAnalysis => {
                // Terminal: the caller renders the analysis (and may run the
                // dimension pipeline against the materialized cohort).
                ctx.waiting_for = WaitingFor::None;
                ctx.current_step = Some(ConversationStep::AskForAnalysis);
                ctx.trace("ask_for_analysis", "handing off to analysis");
            }
            ConversationStep::AnswerQuestion => {
                if let Err(e) = self.answer_question(&mut ctx, text).await {
                    fail(&mut ctx, e.to_string());
                }
            }
            ConversationStep::Error => {
                let message = classification
                    .message
                    .unwrap_or_else(|| "unrecognized input".to_string());
                fail(&mut ctx, message);
            }
        }

        ctx
    }

    /// Interpret the free text into a structured breakdown and suspend for
    /// code-search confirmation. Degrades to a raw-text-only breakdown when
    /// the analyzer fails; losing the whole turn is worse than showing no
    /// breakdown.
    async fn interpret_intent(&self, ctx: &mut ConversationContext, text: &str) {
        ctx.criteria_query = Some(text.to_string());

        let breakdown = match self.analyzer.analyze(text).await {
            Ok(breakdown) => {
                ctx.trace(
                    "interpret_intent",
                    format!("structured breakdown: {}", breakdown.display_text()),
                );
                breakdown
            }
            Err(e) => {
                tracing::warn!(error = %e, "criteria analysis failed, degrading to raw text");
                ctx.trace(
                    "interpret_intent",
                    format!("analyzer unavailable ({e}), using raw text"),
                );
                CriteriaBreakdown::degraded(text)
            }
        };

        ctx.criteria = Some(breakdown);
        ctx.waiting_for = WaitingFor::CodeSearchConfirmation;
        ctx.current_step = Some(ConversationStep::InterpretIntent);
    }

    /// Look up codes per structured phrase and suspend for selection.
    ///
    /// One search call per phrase keeps returned codes attributable to the
    /// phrase that produced them. A lookup failure for one phrase is logged
    /// and skipped; it never aborts the batch.
    async fn search_codes(&self, ctx: &mut ConversationContext) {
        let criteria = ctx.criteria.clone().unwrap_or_default();
        let mut found = Vec::new();

        let phrase_groups = [
            (CodeCategory::Condition, criteria.conditions.clone()),
            (CodeCategory::Drug, criteria.drugs.clone()),
            (CodeCategory::Procedure, criteria.procedures.clone()),
        ];

        for (category, phrases) in phrase_groups {
            for phrase in phrases.iter().filter(|p| !p.trim().is_empty()) {
                self.search_one_phrase(phrase, category, &mut found).await;
            }
        }

        // Nothing structured to search: fall back to extracted phrases from
        // the raw query, or the raw query itself as a single term.
        if found.is_empty() && criteria.is_empty() {
            let raw = ctx
                .criteria_query
                .clone()
                .unwrap_or_else(|| ctx.user_query.clone());
            let phrases = match self.analyzer.extract_phrases(&raw).await {
                Ok(phrases) if !phrases.is_empty() => phrases,
                Ok(_) => vec![raw.clone()],
                Err(e) => {
                    tracing::warn!(error = %e, "phrase extraction failed, searching raw query");
                    vec![raw.clone()]
                }
            };
            for phrase in phrases.iter().filter(|p| !p.trim().is_empty()) {
                self.search_one_phrase(phrase, CodeCategory::Fallback, &mut found)
                    .await;
            }
        }

        ctx.trace(
            "search_codes",
            format!("found {} codes across phrases", found.len()),
        );
        // Duplicates across phrases are surfaced on purpose: selection is by
        // code value and the human sees all provenance.
        ctx.codes = found;
        ctx.refresh_vocabularies();
        ctx.waiting_for = WaitingFor::CodeSelection;
        ctx.current_step = Some(ConversationStep::SearchCodes);
    }

    async fn search_one_phrase(
        &self,
        phrase: &str,
        category: CodeCategory,
        found: &mut Vec<CodeRecord>,
    ) {
        match self
            .code_search
            .search(phrase, self.max_codes_per_phrase)
            .await
        {
            Ok(matches) => {
                for m in matches {
                    found.push(CodeRecord {
                        code: m.code,
                        description: m.description,
                        vocabulary: m.vocabulary,
                        source_phrase: phrase.to_string(),
                        category,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(phrase, error = %e, "code lookup failed for phrase, skipping");
            }
        }
    }

    /// Resolve the selection mode, then proceed without suspending through
    /// SQL generation and counts, ending suspended on the analysis decision.
    async fn confirm_and_generate(
        &self,
        ctx: &mut ConversationContext,
        classification: &Classification,
    ) {
        let mode = classification
            .code_selection_mode
            .unwrap_or(CodeSelectionMode::All);
        ctx.code_selection_mode = Some(mode);

        if mode == CodeSelectionMode::Interactive {
            // The human wants to pick through the external control; stay
            // suspended on the same question.
            ctx.trace("confirm_codes", "awaiting interactive selection");
            ctx.current_step = Some(ConversationStep::ConfirmCodes);
            ctx.waiting_for = WaitingFor::CodeSelection;
            return;
        }

        ctx.selected_codes = resolve_selected_codes(mode, ctx);
        ctx.trace(
            "confirm_codes",
            format!("{} codes selected ({:?})", ctx.selected_codes.len(), mode),
        );

        match self.generate_cohort_sql(ctx).await {
            Ok(result) => {
                self.get_counts(ctx, &result);
                ctx.waiting_for = WaitingFor::AnalysisDecision;
                ctx.current_step = Some(ConversationStep::ConfirmCodes);
            }
            Err(e) => fail(ctx, e.to_string()),
        }
    }

    /// Build the query-intent payload and run one generation exchange.
    async fn generate_cohort_sql(
        &self,
        ctx: &mut ConversationContext,
    ) -> Result<GenerationResult> {
        let prompt = build_generation_prompt(ctx);
        ctx.trace("generate_sql", "sending criteria to generation service");

        let result = self
            .generation
            .generate(&self.space, &prompt, ctx.generation_conversation.as_ref())
            .await?;

        ctx.generated_sql = result.sql.clone();
        ctx.generation_conversation = Some(result.ticket.clone());
        Ok(result)
    }

    /// Surface counts from the generation outcome.
    ///
    /// Only the patient count is available today; visit and site counts need
    /// a dedicated secondary count query that is not wired up.
    fn get_counts(&self, ctx: &mut ConversationContext, result: &GenerationResult) {
        let patients = result.row_count.unwrap_or(0);
        ctx.counts = Some(PatientCounts::patients_only(patients));
        ctx.trace("get_counts", format!("{patients} patients"));
    }

    /// Terminal follow-up/insights path: route the question through the
    /// generation exchange with the cohort as context.
    async fn answer_question(&self, ctx: &mut ConversationContext, text: &str) -> Result<()> {
        let cohort = ctx.cohort.clone().ok_or_else(|| {
            CohortIqError::Collaborator("no materialized cohort to answer against".to_string())
        })?;

        let prompt = format!(
            "Regarding the cohort in table {} ({} patients): {}",
            cohort.table_id, cohort.row_count, text
        );
        let result = self
            .generation
            .generate(&self.space, &prompt, ctx.generation_conversation.as_ref())
            .await?;

        let answer = result
            .answer
            .or(result.sql)
            .unwrap_or_else(|| "No answer produced".to_string());
        ctx.trace("answer_question", answer.clone());
        ctx.last_answer = Some(answer);
        ctx.generation_conversation = Some(result.ticket);
        ctx.waiting_for = WaitingFor::None;
        ctx.current_step = Some(ConversationStep::AnswerQuestion);
        Ok(())
    }

    /// Materialize the current generated SQL as a cohort table.
    ///
    /// Called by the owning layer once the human accepts the counts; not a
    /// state-machine node.
    pub async fn materialize_cohort(&self, ctx: &mut ConversationContext) -> Result<CohortHandle> {
        let sql = ctx.generated_sql.clone().ok_or_else(|| {
            CohortIqError::Validation("no generated SQL to materialize".to_string())
        })?;

        let materialized = self
            .warehouse
            .materialize(&ctx.session_id, &sql)
            .await
            .map_err(|e| CohortIqError::Collaborator(format!("materialization failed: {e}")))?;

        let handle = CohortHandle {
            table_id: materialized.table_id,
            row_count: materialized.row_count,
        };
        ctx.trace(
            "materialize",
            format!("{} rows in {}", handle.row_count, handle.table_id),
        );
        ctx.cohort = Some(handle.clone());
        Ok(handle)
    }
}

/// Resolve the concrete selected-codes list from the chosen mode.
fn resolve_selected_codes(
    mode: CodeSelectionMode,
    ctx: &ConversationContext,
) -> Vec<CodeRecord> {
    match mode {
        CodeSelectionMode::All => ctx.codes.clone(),
        CodeSelectionMode::Selected => {
            // The caller placed the human's picks into the context. Fall back
            // to everything only when that set is empty.
            if ctx.selected_codes.is_empty() {
                ctx.codes.clone()
            } else {
                ctx.selected_codes.clone()
            }
        }
        // TODO: subtract the exclusion set once the selection UI can supply
        // which codes were excluded; until then this behaves like All.
        CodeSelectionMode::Excluded => ctx.codes.clone(),
        CodeSelectionMode::Interactive => ctx.selected_codes.clone(),
    }
}

/// Build the natural-language query-intent payload sent to the generation
/// service: distinct code values, per-code detail, distinct vocabularies,
/// the original text, and the timeframe.
fn build_generation_prompt(ctx: &ConversationContext) -> String {
    let criteria_text = ctx
        .criteria_query
        .clone()
        .unwrap_or_else(|| ctx.user_query.clone());

    let mut lines = vec![format!(
        "Count the distinct patients matching: {criteria_text}"
    )];

    if let Some(timeframe) = ctx.criteria.as_ref().and_then(|c| c.timeframe.clone()) {
        lines.push(format!("Restrict to the timeframe: {timeframe}"));
    }

    if !ctx.selected_codes.is_empty() {
        // The same code can arrive under several source phrases, and those
        // occurrences are not adjacent; dedupe with a seen-set to keep first
        // occurrence order.
        let mut seen = HashSet::new();
        let values: Vec<&str> = ctx
            .selected_codes
            .iter()
            .map(|c| c.code.as_str())
            .filter(|code| seen.insert(*code))
            .collect();
        lines.push(format!(
            "Match clinical events against exactly these codes: {}",
            values.join(", ")
        ));
        lines.push("Code details:".to_string());
        for code in &ctx.selected_codes {
            lines.push(format!(
                "- {} ({}): {}",
                code.code, code.vocabulary, code.description
            ));
        }
        if !ctx.vocabularies.is_empty() {
            lines.push(format!("Vocabularies used: {}", ctx.vocabularies.join(", ")));
        }
    }

    lines.push(
        "Return a single SELECT statement producing the distinct patient count.".to_string(),
    );
    lines.join("\n")
}

/// Force the terminal error state, preserving accumulated context.
fn fail(ctx: &mut ConversationContext, message: String) {
    tracing::warn!(session = %ctx.session_id, %message, "turn ended in error state");
    ctx.trace("error", message.clone());
    ctx.error = Some(message);
    ctx.current_step = Some(ConversationStep::Error);
    ctx.waiting_for = WaitingFor::None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::collaborators::{
        CodeMatch, GenerationOutcome, GenerationStatus, GenerationTicket, MaterializedCohort, Row,
        SqlGeneration,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubAnalyzer {
        breakdown: Option<CriteriaBreakdown>,
        phrases: Vec<String>,
    }

    #[async_trait]
    impl CriteriaAnalyzer for StubAnalyzer {
        async fn analyze(&self, text: &str) -> anyhow::Result<CriteriaBreakdown> {
            match &self.breakdown {
                Some(b) => Ok(b.clone()),
                None => anyhow::bail!("analyzer offline for {text}"),
            }
        }

        async fn extract_phrases(&self, _text: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.phrases.clone())
        }
    }

    struct StubCodeSearch {
        /// Phrases that fail instead of returning matches.
        failing: Vec<String>,
        per_phrase: usize,
        calls: Mutex<Vec<String>>,
    }

    impl StubCodeSearch {
        fn returning(per_phrase: usize) -> Self {
            Self {
                failing: vec![],
                per_phrase,
                calls: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl CodeSearch for StubCodeSearch {
        async fn search(&self, text: &str, _limit: usize) -> anyhow::Result<Vec<CodeMatch>> {
            self.calls.lock().unwrap().push(text.to_string());
            if self.failing.iter().any(|f| f == text) {
                anyhow::bail!("lookup service error");
            }
            Ok((0..self.per_phrase)
                .map(|i| CodeMatch {
                    code: format!("{text}-{i}"),
                    description: format!("code for {text}"),
                    vocabulary: "SNOMED".to_string(),
                    confidence: 0.9,
                })
                .collect())
        }
    }

    struct StubGeneration {
        rows: Option<u64>,
        starts: AtomicUsize,
    }

    #[async_trait]
    impl SqlGeneration for StubGeneration {
        async fn start(
            &self,
            _space: &str,
            _content: &str,
            _continuation: Option<&GenerationTicket>,
        ) -> anyhow::Result<GenerationTicket> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(GenerationTicket {
                conversation_id: "conv".to_string(),
                message_id: format!("msg-{n}"),
            })
        }

        async fn poll(&self, _ticket: &GenerationTicket) -> anyhow::Result<GenerationStatus> {
            Ok(GenerationStatus::Completed(GenerationOutcome {
                sql: Some("SELECT COUNT(DISTINCT patient_id) FROM encounters".to_string()),
                answer: Some("Found matching patients".to_string()),
                row_count: self.rows,
                duration_ms: Some(10),
            }))
        }
    }

    struct StubWarehouse;

    #[async_trait]
    impl Warehouse for StubWarehouse {
        async fn execute(&self, _sql: &str) -> anyhow::Result<Vec<Row>> {
            Ok(vec![])
        }

        async fn materialize(
            &self,
            session_id: &str,
            _sql: &str,
        ) -> anyhow::Result<MaterializedCohort> {
            Ok(MaterializedCohort {
                table_id: format!("cohort_{session_id}"),
                row_count: 321,
            })
        }
    }

    fn orchestrator(
        analyzer: StubAnalyzer,
        code_search: StubCodeSearch,
        rows: Option<u64>,
    ) -> TurnOrchestrator {
        let generation = GenerationClient::new(
            Arc::new(StubGeneration {
                rows,
                starts: AtomicUsize::new(0),
            }),
            0,
            5,
        );
        TurnOrchestrator::new(
            Arc::new(analyzer),
            Arc::new(code_search),
            generation,
            Arc::new(StubWarehouse),
            "space-1",
            10,
        )
    }

    fn diabetes_breakdown() -> CriteriaBreakdown {
        CriteriaBreakdown {
            summary: "male patients over 60 with type 2 diabetes".to_string(),
            conditions: vec!["type 2 diabetes".to_string()],
            demographics: vec!["male".to_string(), "over 60".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_interpret_intent_suspends_for_confirmation() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(diabetes_breakdown()),
                phrases: vec![],
            },
            StubCodeSearch::returning(1),
            Some(100),
        );

        let ctx = orch
            .run_turn(
                ConversationContext::new(),
                "male patients over 60 with type 2 diabetes",
            )
            .await;

        let criteria = ctx.criteria.as_ref().unwrap();
        assert_eq!(criteria.conditions, vec!["type 2 diabetes"]);
        assert!(criteria.demographics.contains(&"male".to_string()));
        assert_eq!(ctx.waiting_for, WaitingFor::CodeSearchConfirmation);
        assert!(ctx.error.is_none());
    }

    #[tokio::test]
    async fn test_analyzer_failure_degrades_without_error() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: None,
                phrases: vec![],
            },
            StubCodeSearch::returning(1),
            Some(100),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "patients with asthma")
            .await;

        assert!(ctx.error.is_none());
        assert_eq!(ctx.waiting_for, WaitingFor::CodeSearchConfirmation);
        let criteria = ctx.criteria.as_ref().unwrap();
        assert!(criteria.is_empty());
        assert_eq!(criteria.summary, "patients with asthma");
    }

    #[tokio::test]
    async fn test_search_codes_per_phrase_attribution() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(CriteriaBreakdown {
                    summary: "diabetics on metformin".to_string(),
                    conditions: vec!["type 2 diabetes".to_string()],
                    drugs: vec!["metformin".to_string()],
                    ..Default::default()
                }),
                phrases: vec![],
            },
            StubCodeSearch::returning(2),
            Some(100),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "diabetics on metformin")
            .await;
        let ctx = orch.run_turn(ctx, "yes").await;

        assert_eq!(ctx.waiting_for, WaitingFor::CodeSelection);
        assert_eq!(ctx.codes.len(), 4);
        let condition_codes: Vec<_> = ctx
            .codes
            .iter()
            .filter(|c| c.category == CodeCategory::Condition)
            .collect();
        assert_eq!(condition_codes.len(), 2);
        assert!(condition_codes
            .iter()
            .all(|c| c.source_phrase == "type 2 diabetes"));
    }

    #[tokio::test]
    async fn test_one_failing_phrase_does_not_abort_batch() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(CriteriaBreakdown {
                    summary: String::new(),
                    conditions: vec!["type 2 diabetes".to_string(), "hypertension".to_string()],
                    ..Default::default()
                }),
                phrases: vec![],
            },
            StubCodeSearch {
                failing: vec!["type 2 diabetes".to_string()],
                per_phrase: 3,
                calls: Mutex::new(vec![]),
            },
            Some(100),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "diabetes and hypertension")
            .await;
        let ctx = orch.run_turn(ctx, "sure").await;

        assert!(ctx.error.is_none());
        assert_eq!(ctx.codes.len(), 3);
        assert!(ctx.codes.iter().all(|c| c.source_phrase == "hypertension"));
    }

    #[tokio::test]
    async fn test_zero_codes_still_suspends_for_selection() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: None,
                phrases: vec![],
            },
            StubCodeSearch::returning(0),
            Some(100),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "rare condition xyz")
            .await;
        let ctx = orch.run_turn(ctx, "yes").await;

        assert!(ctx.codes.is_empty());
        assert_eq!(ctx.waiting_for, WaitingFor::CodeSelection);
        assert!(ctx.error.is_none());
    }

    #[tokio::test]
    async fn test_empty_breakdown_falls_back_to_raw_query_search() {
        let search = StubCodeSearch::returning(1);
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: None,
                phrases: vec![],
            },
            search,
            Some(100),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "patients with asthma")
            .await;
        let ctx = orch.run_turn(ctx, "go ahead").await;

        assert_eq!(ctx.codes.len(), 1);
        assert_eq!(ctx.codes[0].category, CodeCategory::Fallback);
        // Fallback searched the criteria text, not the confirmation text.
        assert_eq!(ctx.codes[0].source_phrase, "patients with asthma");
    }

    #[tokio::test]
    async fn test_confirm_all_selects_every_code_in_order() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(diabetes_breakdown()),
                phrases: vec![],
            },
            StubCodeSearch::returning(3),
            Some(250),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "type 2 diabetics")
            .await;
        let ctx = orch.run_turn(ctx, "yes").await;
        let codes_before = ctx.codes.clone();
        let ctx = orch.run_turn(ctx, "use all of them").await;

        assert_eq!(ctx.selected_codes, codes_before);
        assert_eq!(ctx.waiting_for, WaitingFor::AnalysisDecision);
        assert_eq!(ctx.counts.unwrap(), PatientCounts::patients_only(250));
        assert!(ctx.generated_sql.is_some());
        assert!(ctx.generation_conversation.is_some());
    }

    #[tokio::test]
    async fn test_interactive_mode_stays_suspended() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(diabetes_breakdown()),
                phrases: vec![],
            },
            StubCodeSearch::returning(2),
            Some(100),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "type 2 diabetics")
            .await;
        let ctx = orch.run_turn(ctx, "yes").await;
        let ctx = orch.run_turn(ctx, "let me pick them").await;

        assert_eq!(ctx.waiting_for, WaitingFor::CodeSelection);
        assert!(ctx.selected_codes.is_empty());
        assert!(ctx.generated_sql.is_none());
    }

    #[tokio::test]
    async fn test_negative_confirmation_errors_but_keeps_context() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(diabetes_breakdown()),
                phrases: vec![],
            },
            StubCodeSearch::returning(1),
            Some(100),
        );

        let ctx = orch
            .run_turn(ConversationContext::new(), "type 2 diabetics")
            .await;
        let ctx = orch.run_turn(ctx, "no, skip it").await;

        assert_eq!(ctx.current_step, Some(ConversationStep::Error));
        assert!(ctx.error.as_ref().unwrap().contains("skipped"));
        assert_eq!(ctx.waiting_for, WaitingFor::None);
        // Criteria survive the error for the next turn to refine.
        assert!(ctx.criteria.is_some());
    }

    #[tokio::test]
    async fn test_refine_discards_round_but_keeps_cohort() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(diabetes_breakdown()),
                phrases: vec![],
            },
            StubCodeSearch::returning(1),
            Some(100),
        );

        let mut ctx = orch
            .run_turn(ConversationContext::new(), "type 2 diabetics")
            .await;
        ctx = orch.run_turn(ctx, "yes").await;
        ctx = orch.run_turn(ctx, "all").await;
        orch.materialize_cohort(&mut ctx).await.unwrap();
        assert!(ctx.cohort.is_some());

        let ctx = orch.run_turn(ctx, "refine: only women").await;

        assert_eq!(ctx.waiting_for, WaitingFor::CodeSearchConfirmation);
        assert!(ctx.cohort.is_some());
        assert_eq!(ctx.criteria_query.as_deref(), Some("refine: only women"));
    }

    #[tokio::test]
    async fn test_follow_up_question_answered_terminally() {
        let orch = orchestrator(
            StubAnalyzer {
                breakdown: Some(diabetes_breakdown()),
                phrases: vec![],
            },
            StubCodeSearch::returning(1),
            Some(100),
        );

        let mut ctx = ConversationContext::new();
        ctx.cohort = Some(CohortHandle {
            table_id: "cohort_t".to_string(),
            row_count: 50,
        });

        let ctx = orch.run_turn(ctx, "how many are over 65?").await;

        assert_eq!(ctx.current_step, Some(ConversationStep::AnswerQuestion));
        assert_eq!(ctx.waiting_for, WaitingFor::None);
        assert!(ctx.last_answer.is_some());
    }

    #[test]
    fn test_generation_prompt_contains_codes_and_text() {
        let mut ctx = ConversationContext::new();
        ctx.criteria_query = Some("type 2 diabetics on metformin".to_string());
        ctx.criteria = Some(CriteriaBreakdown {
            timeframe: Some("last 12 months".to_string()),
            ..Default::default()
        });
        ctx.selected_codes = vec![CodeRecord {
            code: "E11".to_string(),
            description: "Type 2 diabetes mellitus".to_string(),
            vocabulary: "ICD10CM".to_string(),
            source_phrase: "type 2 diabetes".to_string(),
            category: CodeCategory::Condition,
        }];
        ctx.vocabularies = vec!["ICD10CM".to_string()];

        let prompt = build_generation_prompt(&ctx);
        assert!(prompt.contains("type 2 diabetics on metformin"));
        assert!(prompt.contains("last 12 months"));
        assert!(prompt.contains("E11 (ICD10CM): Type 2 diabetes mellitus"));
        assert!(prompt.contains("Vocabularies used: ICD10CM"));
    }

    #[test]
    fn test_generation_prompt_lists_each_code_value_once() {
        let mut ctx = ConversationContext::new();
        // The same code found under two phrases, with another code between,
        // so the repeats are not adjacent.
        for (code, phrase) in [
            ("E11", "type 2 diabetes"),
            ("4548-4", "hba1c"),
            ("E11", "diabetes mellitus"),
        ] {
            ctx.selected_codes.push(CodeRecord {
                code: code.to_string(),
                description: String::new(),
                vocabulary: "ICD10CM".to_string(),
                source_phrase: phrase.to_string(),
                category: CodeCategory::Condition,
            });
        }

        let prompt = build_generation_prompt(&ctx);
        let line = prompt
            .lines()
            .find(|l| l.starts_with("Match clinical events"))
            .unwrap();
        assert_eq!(line.matches("E11").count(), 1);
        assert!(line.contains("4548-4"));
    }

    #[test]
    fn test_selected_mode_falls_back_to_all_when_empty() {
        let mut ctx = ConversationContext::new();
        ctx.codes = vec![CodeRecord {
            code: "E11".to_string(),
            description: String::new(),
            vocabulary: "ICD10CM".to_string(),
            source_phrase: String::new(),
            category: CodeCategory::Condition,
        }];

        let selected = resolve_selected_codes(CodeSelectionMode::Selected, &ctx);
        assert_eq!(selected, ctx.codes);

        ctx.selected_codes = vec![ctx.codes[0].clone()];
        ctx.codes.push(CodeRecord {
            code: "E10".to_string(),
            description: String::new(),
            vocabulary: "ICD10CM".to_string(),
            source_phrase: String::new(),
            category: CodeCategory::Condition,
        });
        let selected = resolve_selected_codes(CodeSelectionMode::Selected, &ctx);
        assert_eq!(selected.len(), 1);
    }
}
