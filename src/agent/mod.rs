//! Conversational cohort-building agent.
//!
//! The turn orchestrator, its context state, lexical classification, the
//! collaborator trait seams, and the NL-to-SQL polling client.

pub mod classify;
pub mod collaborators;
pub mod context;
pub mod nl2sql;
pub mod orchestrator;

pub use classify::{classify, Classification, ConversationStep};
pub use collaborators::{
    CodeMatch, CodeSearch, ColumnInfo, CriteriaAnalyzer, GenerationOutcome, GenerationStatus,
    GenerationTicket, MaterializedCohort, Row, SchemaMetadata, SqlGeneration, TableInfo, Warehouse,
};
pub use context::{
    CodeCategory, CodeRecord, CodeSelectionMode, CohortHandle, ConversationContext,
    CriteriaBreakdown, PatientCounts, TraceEntry, WaitingFor,
};
pub use nl2sql::{extract_sql_block, GenerationClient, GenerationResult};
pub use orchestrator::TurnOrchestrator;
