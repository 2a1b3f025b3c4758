//! Concurrent cohort breakdown pipeline.
//!
//! Two strictly sequential fan-outs: first every dimension's SQL is generated
//! and validated, then only the validated SQL is executed. Generation
//! failure, validation failure, and execution failure are each caught and
//! attributed to exactly one dimension; the call as a whole never fails for
//! a single bad dimension, and the result always covers every requested
//! name, either with rows or with an error entry.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::agent::collaborators::{Row, SchemaMetadata, Warehouse};
use crate::agent::nl2sql::GenerationClient;
use crate::analytics::dimensions::{DimensionSpec, JoinKey};
use crate::analytics::schema_cache::{SchemaCache, SchemaContext};
use crate::analytics::validator::{validate_sql, ValidationDetails};

/// Aggregated breakdown result, keyed by dimension name throughout.
#[derive(Debug, Default)]
pub struct DimensionAnalysis {
    /// Rows per dimension; empty when execution failed.
    pub dimensions: HashMap<String, Vec<Row>>,
    /// Error text per failed dimension only.
    pub errors: HashMap<String, String>,
    /// Generated SQL per dimension, for audit and debugging.
    pub sql: HashMap<String, String>,
    /// Validation detail per dimension that reached validation.
    pub validation: HashMap<String, ValidationDetails>,
}

/// Per-dimension outcome of the generation fan-out.
struct GeneratedDimension {
    name: String,
    sql: Option<String>,
    error: Option<String>,
}

/// Generates, validates, and executes breakdown queries for one cohort.
pub struct DimensionPipeline {
    generation: GenerationClient,
    warehouse: Arc<dyn Warehouse>,
    metadata: Arc<dyn SchemaMetadata>,
    cache: Arc<SchemaCache>,
    catalog: String,
    schema: String,
    space: String,
    /// Strict validation: generated SQL may only reference catalog columns
    /// through table-name qualifiers. Fed from
    /// `AnalysisSettings::strict_column_allowlist`.
    strict_columns: bool,
}

impl DimensionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generation: GenerationClient,
        warehouse: Arc<dyn Warehouse>,
        metadata: Arc<dyn SchemaMetadata>,
        cache: Arc<SchemaCache>,
        catalog: impl Into<String>,
        schema: impl Into<String>,
        space: impl Into<String>,
        strict_columns: bool,
    ) -> Self {
        Self {
            generation,
            warehouse,
            metadata,
            cache,
            catalog: catalog.into(),
            schema: schema.into(),
            space: space.into(),
            strict_columns,
        }
    }

    /// Break the cohort down along every requested dimension.
    ///
    /// Postcondition: `dimensions` keys plus `errors` keys cover exactly the
    /// requested spec names.
    pub async fn analyze_dimensions(
        &self,
        cohort_table: &str,
        cohort_sql: &str,
        specs: &[DimensionSpec],
    ) -> DimensionAnalysis {
        let mut analysis = DimensionAnalysis::default();
        if specs.is_empty() {
            return analysis;
        }

        let join_key = JoinKey::infer(cohort_sql);
        tracing::info!(
            cohort = cohort_table,
            dimensions = specs.len(),
            join_key = join_key.column(),
            "starting dimension analysis"
        );

        // Schema context is resolved once and shared by every worker.
        let schema_context = match self
            .cache
            .get_or_load_context(self.metadata.as_ref(), &self.catalog, &self.schema)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                // Without metadata nothing can generate; every dimension gets
                // the same attributed error rather than a batch-level failure.
                let message = format!("schema metadata unavailable: {e}");
                for spec in specs {
                    analysis.errors.insert(spec.name.to_string(), message.clone());
                }
                return analysis;
            }
        };
        let schema_block = schema_context.format_for_generation();
        let allowlist = self
            .strict_columns
            .then(|| column_allowlist(&schema_context));

        // Fan-out 1: generate SQL for every dimension concurrently.
        let generation_tasks = specs.iter().map(|spec| {
            let schema_block = schema_block.clone();
            async move {
                self.generate_for_dimension(spec, cohort_table, join_key, &schema_block)
                    .await
            }
        });
        let generated: Vec<GeneratedDimension> = join_all(generation_tasks).await;

        // Validate everything generated before any execution begins, so a
        // failed generation never occupies an execution slot.
        let mut to_execute: Vec<(String, String)> = Vec::new();
        for (spec, item) in specs.iter().zip(generated) {
            if let Some(error) = item.error {
                analysis.errors.insert(item.name, error);
                continue;
            }
            let sql = match item.sql {
                Some(sql) => sql,
                None => {
                    analysis
                        .errors
                        .insert(item.name, "generation produced no SQL".to_string());
                    continue;
                }
            };
            analysis.sql.insert(item.name.clone(), sql.clone());

            let expected: Vec<&str> = spec.expected_tables.to_vec();
            let result = validate_sql(
                &sql,
                spec.name,
                cohort_table,
                Some(&expected),
                allowlist.as_ref(),
            );
            analysis
                .validation
                .insert(item.name.clone(), result.details.clone());
            if result.is_valid {
                to_execute.push((item.name, sql));
            } else {
                tracing::warn!(
                    dimension = %item.name,
                    warnings = ?result.blocking_messages(),
                    "generated SQL failed validation, skipping execution"
                );
                analysis.errors.insert(
                    item.name,
                    format!("validation failed: {}", result.blocking_messages().join("; ")),
                );
            }
        }

        // Fan-out 2: execute every validated query concurrently.
        let execution_tasks = to_execute.iter().map(|(name, sql)| {
            let warehouse = self.warehouse.clone();
            async move {
                let outcome = warehouse.execute(sql).await;
                (name.clone(), outcome)
            }
        });
        for (name, outcome) in join_all(execution_tasks).await {
            match outcome {
                Ok(rows) => {
                    analysis.dimensions.insert(name, rows);
                }
                Err(e) => {
                    tracing::warn!(dimension = %name, error = %e, "dimension execution failed");
                    analysis
                        .errors
                        .insert(name.clone(), format!("execution failed: {e}"));
                    // The dimension stays present, with no rows.
                    analysis.dimensions.insert(name, Vec::new());
                }
            }
        }

        tracing::info!(
            succeeded = analysis.dimensions.len(),
            failed = analysis.errors.len(),
            "dimension analysis complete"
        );
        analysis
    }

    /// Resolve column hints and run one generation exchange for a dimension.
    /// Failures are captured per dimension, never propagated.
    async fn generate_for_dimension(
        &self,
        spec: &DimensionSpec,
        cohort_table: &str,
        join_key: JoinKey,
        schema_block: &str,
    ) -> GeneratedDimension {
        let hints = match self
            .cache
            .get_or_resolve_columns(self.metadata.as_ref(), &self.catalog, &self.schema, spec)
            .await
        {
            Ok(resolved) => resolved.hint_text(),
            Err(e) => {
                return GeneratedDimension {
                    name: spec.name.to_string(),
                    sql: None,
                    error: Some(format!("column resolution failed: {e}")),
                }
            }
        };

        let prompt = build_dimension_prompt(spec, cohort_table, join_key, schema_block, &hints);
        match self.generation.generate(&self.space, &prompt, None).await {
            Ok(result) => GeneratedDimension {
                name: spec.name.to_string(),
                sql: result.sql,
                error: None,
            },
            Err(e) => GeneratedDimension {
                name: spec.name.to_string(),
                sql: None,
                error: Some(format!("generation failed: {e}")),
            },
        }
    }
}

/// Per-table allow-list for strict validation: any `table.column` reference
/// in generated SQL must name a column the catalog actually has. Free aliases
/// are not in the map and pass through unchecked.
fn column_allowlist(context: &SchemaContext) -> HashMap<String, Vec<String>> {
    context
        .columns
        .iter()
        .map(|(table, columns)| {
            (
                table.to_lowercase(),
                columns.iter().map(|c| c.name.to_lowercase()).collect(),
            )
        })
        .collect()
}

/// Build the generation request for one dimension: schema context, exact
/// column hints, the join-key instruction, and the output-column convention.
fn build_dimension_prompt(
    spec: &DimensionSpec,
    cohort_table: &str,
    join_key: JoinKey,
    schema_block: &str,
    hints: &str,
) -> String {
    format!(
        "{schema_block}\n\n\
         Break down the cohort in table {cohort_table} by {description}.\n\
         Join the cohort table on {join}.\n\
         Column hints: {hints}\n\
         The result must have exactly these columns in order: {outputs}.\n\
         Return a single SELECT statement with a GROUP BY and a JOIN.",
        description = spec.description,
        join = join_key.column(),
        outputs = spec.output_columns.join(", "),
    )
}
