//! cohortiq: AI-assisted clinical cohort discovery.
//!
//! Turns free-text clinical criteria into a validated count query through a
//! multi-turn human-in-the-loop negotiation, then breaks a materialized
//! cohort down along demographic, visit, and site dimensions.
//!
//! The conversational surface is [`agent::TurnOrchestrator::run_turn`]; the
//! breakdown surface is [`analytics::DimensionPipeline::analyze_dimensions`].
//! Everything network-facing sits behind the trait seams in
//! [`agent::collaborators`].

pub mod agent;
pub mod analytics;
pub mod error;
pub mod settings;

pub use agent::{ConversationContext, GenerationClient, TurnOrchestrator};
pub use analytics::{default_dimensions, DimensionPipeline, SchemaCache};
pub use error::{CohortIqError, Result};
pub use settings::{CohortIqSettings, SettingsManager};

/// Initialize tracing output for binaries and integration harnesses.
///
/// Honors `RUST_LOG`, defaulting the crate to debug.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cohortiq=debug".parse().expect("static directive")),
        )
        .init();
}
