//! Memoized schema metadata for generation prompts.
//!
//! Two cache levels, both keyed by catalog-qualified strings and both
//! append-only: the full table/column context for a schema, and the resolved
//! physical columns for one dimension. Values are a pure function of the key,
//! so concurrent first-writers racing to populate the same entry are benign;
//! last-writer-wins leaves identical content either way.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::agent::collaborators::{ColumnInfo, SchemaMetadata, TableInfo};
use crate::analytics::dimensions::DimensionSpec;

/// Dimension-agnostic metadata for one catalog.schema.
#[derive(Debug, Clone)]
pub struct SchemaContext {
    pub catalog: String,
    pub schema: String,
    pub tables: Vec<TableInfo>,
    /// Columns per table, in catalog order.
    pub columns: HashMap<String, Vec<ColumnInfo>>,
}

impl SchemaContext {
    /// Render the descriptive block embedded in generation prompts.
    pub fn format_for_generation(&self) -> String {
        let mut lines = vec![format!(
            "Schema {}.{} contains the following tables:",
            self.catalog, self.schema
        )];
        for table in &self.tables {
            let columns = self
                .columns
                .get(&table.name)
                .map(|cols| {
                    cols.iter()
                        .map(|c| format!("{} {}", c.name, c.data_type))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            match &table.comment {
                Some(comment) => lines.push(format!("- {} ({}): {}", table.name, comment, columns)),
                None => lines.push(format!("- {}: {}", table.name, columns)),
            }
        }
        lines.join("\n")
    }
}

/// Physical columns resolved for one dimension.
#[derive(Debug, Clone, Default)]
pub struct ResolvedColumns {
    /// Logical role name to `table.column`.
    pub columns: HashMap<String, String>,
}

impl ResolvedColumns {
    pub fn hint_text(&self) -> String {
        if self.columns.is_empty() {
            return "No exact column hints available.".to_string();
        }
        let mut entries: Vec<_> = self
            .columns
            .iter()
            .map(|(role, physical)| format!("{role} is stored in {physical}"))
            .collect();
        entries.sort();
        entries.join("; ")
    }
}

/// Append-only schema metadata cache shared across pipeline workers.
#[derive(Default)]
pub struct SchemaCache {
    contexts: DashMap<String, Arc<SchemaContext>>,
    columns: DashMap<String, Arc<ResolvedColumns>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or load and memoize) the full metadata context for a schema.
    pub async fn get_or_load_context(
        &self,
        metadata: &dyn SchemaMetadata,
        catalog: &str,
        schema: &str,
    ) -> anyhow::Result<Arc<SchemaContext>> {
        let key = format!("{catalog}.{schema}");
        if let Some(cached) = self.contexts.get(&key) {
            tracing::debug!(%key, "schema context cache hit");
            return Ok(cached.clone());
        }

        let tables = metadata.list_tables(catalog, schema).await?;
        let mut columns = HashMap::new();
        for table in &tables {
            let cols = metadata.list_columns(catalog, schema, &table.name).await?;
            columns.insert(table.name.clone(), cols);
        }

        let context = Arc::new(SchemaContext {
            catalog: catalog.to_string(),
            schema: schema.to_string(),
            tables,
            columns,
        });
        tracing::info!(%key, tables = context.tables.len(), "loaded schema context");
        self.contexts.insert(key, context.clone());
        Ok(context)
    }

    /// Fetch (or resolve and memoize) the physical columns for one dimension.
    pub async fn get_or_resolve_columns(
        &self,
        metadata: &dyn SchemaMetadata,
        catalog: &str,
        schema: &str,
        spec: &DimensionSpec,
    ) -> anyhow::Result<Arc<ResolvedColumns>> {
        let key = format!("{catalog}.{schema}.{}", spec.name);
        if let Some(cached) = self.columns.get(&key) {
            tracing::debug!(%key, "dimension columns cache hit");
            return Ok(cached.clone());
        }

        let context = self.get_or_load_context(metadata, catalog, schema).await?;
        let resolved = Arc::new(resolve_columns(&context, spec));
        self.columns.insert(key, resolved.clone());
        Ok(resolved)
    }

    #[cfg(test)]
    pub fn context_entries(&self) -> usize {
        self.contexts.len()
    }
}

/// Match a dimension's logical column roles to physical columns.
///
/// Exact case-insensitive name matches win; a substring match is the
/// fallback. Tables in the dimension's expected set are searched first.
fn resolve_columns(context: &SchemaContext, spec: &DimensionSpec) -> ResolvedColumns {
    let mut resolved = ResolvedColumns::default();

    // Expected tables first, then the rest in catalog order so resolution is
    // deterministic for a given schema context.
    let mut tables: Vec<&str> = spec
        .expected_tables
        .iter()
        .copied()
        .filter(|t| context.columns.contains_key(*t))
        .collect();
    for table in &context.tables {
        if context.columns.contains_key(&table.name) && !tables.contains(&table.name.as_str()) {
            tables.push(&table.name);
        }
    }

    for role in spec.logical_columns {
        'tables: for table in &tables {
            let Some(columns) = context.columns.get(*table) else {
                continue;
            };
            for column in columns {
                if column.name.eq_ignore_ascii_case(role) {
                    resolved
                        .columns
                        .insert((*role).to_string(), format!("{table}.{}", column.name));
                    break 'tables;
                }
            }
            for column in columns {
                if column.name.to_lowercase().contains(&role.to_lowercase()) {
                    resolved
                        .columns
                        .insert((*role).to_string(), format!("{table}.{}", column.name));
                    break 'tables;
                }
            }
        }
    }

    resolved
}
