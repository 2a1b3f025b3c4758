//! Create-then-poll driver for the NL-to-SQL generation collaborator.
//!
//! One `generate` call is: start the exchange, then poll on a fixed interval
//! up to a fixed attempt budget. Exceeding the budget is a timeout error;
//! explicit failure and cancellation are surfaced as their own errors.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::collaborators::{GenerationStatus, GenerationTicket, SqlGeneration};
use crate::error::{CohortIqError, Result};

/// Result of a completed generation exchange.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub sql: Option<String>,
    pub answer: Option<String>,
    pub row_count: Option<u64>,
    /// Continuation handle for follow-up prompts in the same exchange.
    pub ticket: GenerationTicket,
}

/// Drives the two-phase generation protocol with bounded polling.
#[derive(Clone)]
pub struct GenerationClient {
    service: Arc<dyn SqlGeneration>,
    poll_interval: Duration,
    max_poll_attempts: usize,
}

impl GenerationClient {
    pub fn new(
        service: Arc<dyn SqlGeneration>,
        poll_interval_ms: u64,
        max_poll_attempts: usize,
    ) -> Self {
        Self {
            service,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_poll_attempts,
        }
    }

    /// Run one full exchange: start, poll to completion, extract SQL.
    pub async fn generate(
        &self,
        space: &str,
        content: &str,
        continuation: Option<&GenerationTicket>,
    ) -> Result<GenerationResult> {
        let started = std::time::Instant::now();

        let ticket = self
            .service
            .start(space, content, continuation)
            .await
            .map_err(|e| CohortIqError::Collaborator(format!("failed to start generation: {e}")))?;

        for attempt in 1..=self.max_poll_attempts {
            let status = self
                .service
                .poll(&ticket)
                .await
                .map_err(|e| CohortIqError::Collaborator(format!("poll failed: {e}")))?;

            match status {
                GenerationStatus::Completed(outcome) => {
                    tracing::debug!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "generation completed"
                    );
                    let sql = outcome
                        .sql
                        .or_else(|| outcome.answer.as_deref().and_then(extract_sql_block));
                    return Ok(GenerationResult {
                        sql,
                        answer: outcome.answer,
                        row_count: outcome.row_count,
                        ticket,
                    });
                }
                GenerationStatus::Failed(reason) => {
                    return Err(CohortIqError::GenerationFailed(reason));
                }
                GenerationStatus::Cancelled => {
                    return Err(CohortIqError::GenerationCancelled);
                }
                GenerationStatus::Running(sub_state) => {
                    tracing::trace!(attempt, %sub_state, "generation still running");
                    if attempt < self.max_poll_attempts {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        }

        Err(CohortIqError::GenerationTimeout {
            attempts: self.max_poll_attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Pull a SQL statement out of a fenced code block in a free-text answer.
///
/// Prefers a ```sql fence; falls back to the first bare fence whose body
/// starts with SELECT or WITH.
pub fn extract_sql_block(answer: &str) -> Option<String> {
    let fenced = Regex::new(r"(?s)```(sql)?\s*\n?(.*?)```").ok()?;
    for capture in fenced.captures_iter(answer) {
        let tagged = capture.get(1).is_some();
        let body = capture.get(2)?.as_str().trim();
        if body.is_empty() {
            continue;
        }
        let upper = body.to_uppercase();
        if tagged || upper.starts_with("SELECT") || upper.starts_with("WITH") {
            return Some(body.to_string());
        }
    }
    None
}
