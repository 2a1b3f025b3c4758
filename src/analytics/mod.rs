//! Cohort breakdown analytics.
//!
//! The dimension catalogue, the SQL safety validator, the schema metadata
//! cache, and the concurrent generate/validate/execute pipeline.

pub mod dimensions;
pub mod pipeline;
pub mod schema_cache;
pub mod validator;

pub use dimensions::{default_dimensions, DimensionSpec, JoinKey};
pub use pipeline::{DimensionAnalysis, DimensionPipeline};
pub use schema_cache::{ResolvedColumns, SchemaCache, SchemaContext};
pub use validator::{
    validate_sql, Severity, ValidationDetails, ValidationResult, ValidationWarning,
};
