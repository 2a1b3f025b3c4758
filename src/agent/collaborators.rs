//! Trait seams for the external collaborators.
//!
//! The core owns no wire protocols or file formats; everything network-facing
//! lives behind these traits so the orchestrator and pipeline can be driven
//! by real clients or by mocks in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::CriteriaBreakdown;

/// One candidate code from the semantic lookup.
///
/// No ordering guarantee beyond relevance; an empty result set is a valid,
/// non-error outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeMatch {
    pub code: String,
    pub description: String,
    pub vocabulary: String,
    pub confidence: f64,
}

/// Opaque continuation handle for the two-phase NL-to-SQL exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationTicket {
    pub conversation_id: String,
    pub message_id: String,
}

/// Payload exposed by the generation service on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// SQL attached directly to the result, if any.
    pub sql: Option<String>,
    /// Free-text answer; may carry the SQL in a fenced code block instead.
    pub answer: Option<String>,
    pub row_count: Option<u64>,
    pub duration_ms: Option<u64>,
}

/// Status of one poll of the generation service.
#[derive(Debug, Clone)]
pub enum GenerationStatus {
    Completed(GenerationOutcome),
    Failed(String),
    Cancelled,
    /// The "still running" family; the string is the sub-state for logging.
    Running(String),
}

/// One warehouse result row: column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A persisted cohort result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializedCohort {
    pub table_id: String,
    pub row_count: u64,
}

/// A table visible in the warehouse catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A column of a warehouse table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Language-understanding collaborator: free text to structured criteria.
///
/// Implementations must signal failure through `Err` rather than panicking;
/// the orchestrator degrades gracefully on any error.
#[async_trait]
pub trait CriteriaAnalyzer: Send + Sync {
    async fn analyze(&self, text: &str) -> anyhow::Result<CriteriaBreakdown>;

    /// Fallback phrase extraction used when the structured breakdown is empty.
    async fn extract_phrases(&self, text: &str) -> anyhow::Result<Vec<String>>;
}

/// Semantic code-lookup collaborator.
#[async_trait]
pub trait CodeSearch: Send + Sync {
    async fn search(&self, text: &str, limit: usize) -> anyhow::Result<Vec<CodeMatch>>;
}

/// NL-to-SQL generation collaborator, two-phase create-then-poll protocol.
#[async_trait]
pub trait SqlGeneration: Send + Sync {
    /// Start a generation exchange. `continuation` carries the prior
    /// conversation id when refining within one session.
    async fn start(
        &self,
        space: &str,
        content: &str,
        continuation: Option<&GenerationTicket>,
    ) -> anyhow::Result<GenerationTicket>;

    /// Poll the status of a started exchange.
    async fn poll(&self, ticket: &GenerationTicket) -> anyhow::Result<GenerationStatus>;
}

/// Warehouse execution collaborator.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn execute(&self, sql: &str) -> anyhow::Result<Vec<Row>>;

    /// Execute `sql` and persist the result set as a named cohort table.
    async fn materialize(&self, session_id: &str, sql: &str)
        -> anyhow::Result<MaterializedCohort>;
}

/// Schema metadata collaborator.
#[async_trait]
pub trait SchemaMetadata: Send + Sync {
    async fn list_tables(&self, catalog: &str, schema: &str) -> anyhow::Result<Vec<TableInfo>>;

    async fn list_columns(
        &self,
        catalog: &str,
        schema: &str,
        table: &str,
    ) -> anyhow::Result<Vec<ColumnInfo>>;
}
