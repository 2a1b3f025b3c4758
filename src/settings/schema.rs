//! Settings schema definitions for cohortiq configuration.
//!
//! All settings structs use `#[serde(default)]` to allow partial configuration files.
//! Missing fields are filled with sensible defaults.

use serde::{Deserialize, Serialize};

use crate::error::{CohortIqError, Result};

/// Root settings structure for cohortiq.
///
/// Loaded from `~/.cohortiq/settings.toml` with environment variable
/// interpolation support. Version field enables future migrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortIqSettings {
    /// Schema version for migrations
    pub version: u32,

    /// Warehouse connection configuration
    pub warehouse: WarehouseSettings,

    /// NL-to-SQL generation service configuration
    pub generation: GenerationSettings,

    /// Code search and dimension analysis knobs
    pub analysis: AnalysisSettings,
}

impl Default for CohortIqSettings {
    fn default() -> Self {
        Self {
            version: 1,
            warehouse: WarehouseSettings::default(),
            generation: GenerationSettings::default(),
            analysis: AnalysisSettings::default(),
        }
    }
}

/// Warehouse connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WarehouseSettings {
    /// Catalog containing the clinical schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,

    /// Schema containing the clinical tables
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Warehouse hostname (supports $ENV_VAR syntax)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// HTTP path for the SQL endpoint (supports $ENV_VAR syntax)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,

    /// Access token (supports $ENV_VAR syntax)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl WarehouseSettings {
    /// Verify that every parameter required to open a connection is present.
    ///
    /// Reports all missing fields at once so a misconfigured deployment
    /// is fixable in a single pass.
    pub fn require_connection(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.catalog.as_deref().unwrap_or("").is_empty() {
            missing.push("warehouse.catalog");
        }
        if self.schema.as_deref().unwrap_or("").is_empty() {
            missing.push("warehouse.schema");
        }
        if self.host.as_deref().unwrap_or("").is_empty() {
            missing.push("warehouse.host");
        }
        if self.http_path.as_deref().unwrap_or("").is_empty() {
            missing.push("warehouse.http_path");
        }
        if self.token.as_deref().unwrap_or("").is_empty() {
            missing.push("warehouse.token");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CohortIqError::Configuration(format!(
                "missing required connection parameters: {}",
                missing.join(", ")
            )))
        }
    }
}

/// NL-to-SQL generation service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Identifier of the generation space to query against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,

    /// Interval between status polls, in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum number of status polls before timing out
    pub max_poll_attempts: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            space_id: None,
            poll_interval_ms: 2_000,
            max_poll_attempts: 60,
        }
    }
}

/// Code search and dimension analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Maximum codes returned per search phrase
    pub max_codes_per_phrase: usize,

    /// Enforce the catalog column allow-list during dimension SQL validation
    pub strict_column_allowlist: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            max_codes_per_phrase: 10,
            strict_column_allowlist: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CohortIqSettings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.generation.poll_interval_ms, 2_000);
        assert_eq!(settings.generation.max_poll_attempts, 60);
        assert_eq!(settings.analysis.max_codes_per_phrase, 10);
        assert!(!settings.analysis.strict_column_allowlist);
    }

    #[test]
    fn test_require_connection_reports_all_missing() {
        let warehouse = WarehouseSettings {
            catalog: Some("clinical".to_string()),
            ..Default::default()
        };
        let err = warehouse.require_connection().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("warehouse.schema"));
        assert!(message.contains("warehouse.host"));
        assert!(message.contains("warehouse.token"));
        assert!(!message.contains("warehouse.catalog,"));
    }

    #[test]
    fn test_require_connection_complete() {
        let warehouse = WarehouseSettings {
            catalog: Some("clinical".to_string()),
            schema: Some("omop".to_string()),
            host: Some("dbc.example.com".to_string()),
            http_path: Some("/sql/1.0/endpoint".to_string()),
            token: Some("secret".to_string()),
        };
        assert!(warehouse.require_connection().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings: CohortIqSettings =
            toml::from_str("[generation]\nmax_poll_attempts = 10\n").unwrap();
        assert_eq!(settings.generation.max_poll_attempts, 10);
        assert_eq!(settings.generation.poll_interval_ms, 2_000);
    }
}
