//! Settings loading, saving, and environment variable interpolation.
//!
//! The `SettingsManager` handles:
//! - Loading settings from `~/.cohortiq/settings.toml`
//! - Resolving `$VAR` and `${VAR}` environment variable references
//! - Atomic file writes with temp file + rename
//! - First-run template generation

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use super::schema::CohortIqSettings;

/// Embedded template for first-run generation.
const TEMPLATE: &str = include_str!("template.toml");

/// Get the path to the global settings file.
pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cohortiq")
        .join("settings.toml")
}

/// Manages settings loading, interpolation, and persistence.
pub struct SettingsManager {
    /// Cached settings (with env vars resolved)
    settings: RwLock<CohortIqSettings>,

    /// Path to the settings file
    path: PathBuf,
}

impl SettingsManager {
    /// Create a new SettingsManager, loading from disk if available.
    pub async fn new() -> Result<Self> {
        Self::with_path(settings_path()).await
    }

    /// Create a SettingsManager backed by a specific file path.
    pub async fn with_path(path: PathBuf) -> Result<Self> {
        let settings = Self::load_from_path(&path).await?;

        Ok(Self {
            settings: RwLock::new(settings),
            path,
        })
    }

    /// Load settings from a specific path.
    async fn load_from_path(path: &PathBuf) -> Result<CohortIqSettings> {
        if !path.exists() {
            tracing::debug!("Settings file not found at {:?}, using defaults", path);
            return Ok(CohortIqSettings::default());
        }

        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read settings file")?;

        // Parse into typed struct
        let mut settings: CohortIqSettings =
            toml::from_str(&contents).context("Failed to deserialize settings")?;

        // Resolve environment variable references
        Self::resolve_env_vars(&mut settings);

        tracing::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Resolve $ENV_VAR references in string fields.
    fn resolve_env_vars(settings: &mut CohortIqSettings) {
        fn resolve_opt(value: &mut Option<String>) {
            if let Some(v) = value {
                if let Some(resolved) = resolve_env_ref(v) {
                    *v = resolved;
                }
            }
        }

        resolve_opt(&mut settings.warehouse.catalog);
        resolve_opt(&mut settings.warehouse.schema);
        resolve_opt(&mut settings.warehouse.host);
        resolve_opt(&mut settings.warehouse.http_path);
        resolve_opt(&mut settings.warehouse.token);
        resolve_opt(&mut settings.generation.space_id);
    }

    /// Get the current settings (read-only).
    pub async fn get(&self) -> CohortIqSettings {
        self.settings.read().await.clone()
    }

    /// Update settings and persist to disk.
    pub async fn update(&self, new_settings: CohortIqSettings) -> Result<()> {
        // Update cached settings
        *self.settings.write().await = new_settings.clone();

        // Serialize to TOML
        let toml_string =
            toml::to_string_pretty(&new_settings).context("Failed to serialize settings")?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("toml.tmp");
        tokio::fs::write(&temp_path, &toml_string).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        tracing::info!("Saved settings to {:?}", self.path);
        Ok(())
    }

    /// Check if settings file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Get the settings file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Ensure settings file exists, creating from template if needed.
    ///
    /// Returns `true` if a new file was created.
    pub async fn ensure_settings_file(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&self.path, TEMPLATE).await?;
        tracing::info!("Generated settings template at {:?}", self.path);
        Ok(true)
    }

    /// Reload settings from disk.
    pub async fn reload(&self) -> Result<()> {
        let settings = Self::load_from_path(&self.path).await?;
        *self.settings.write().await = settings;
        Ok(())
    }
}

/// Get a setting value with environment variable fallback.
///
/// Resolution order: non-empty settings value, then the listed environment
/// variables in order, then the provided default.
pub fn get_with_env_fallback(
    setting: &Option<String>,
    env_vars: &[&str],
    default: Option<String>,
) -> Option<String> {
    if let Some(v) = setting {
        if !v.is_empty() {
            return Some(v.clone());
        }
    }

    for env_var in env_vars {
        if let Ok(v) = std::env::var(env_var) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }

    default
}

/// Load environment variables from a `.env` file so `$VAR` references in
/// the settings file can resolve against it. Returns how many were loaded.
pub fn load_env_file(path: &str) -> Result<usize> {
    dotenvy::from_path(path).context("Failed to load .env file")?;
    let count = dotenvy::from_path_iter(path)
        .map(|iter| iter.count())
        .unwrap_or(0);
    tracing::info!("Loaded {} environment variables from {}", count, path);
    Ok(count)
}

/// Resolve a $ENV_VAR or ${ENV_VAR} reference.
///
/// Returns `Some(resolved)` if the value starts with `$` and the env var exists.
/// Returns `None` if no env var reference or env var not set.
fn resolve_env_ref(value: &str) -> Option<String> {
    let trimmed = value.trim();

    if trimmed.starts_with('$') {
        let var_name = if trimmed.starts_with("${") && trimmed.ends_with('}') {
            &trimmed[2..trimmed.len() - 1]
        } else {
            &trimmed[1..]
        };

        return std::env::var(var_name).ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env_ref_dollar_format() {
        std::env::set_var("COHORTIQ_TEST_VAR_1", "test_value_1");

        assert_eq!(
            resolve_env_ref("$COHORTIQ_TEST_VAR_1"),
            Some("test_value_1".to_string())
        );

        std::env::remove_var("COHORTIQ_TEST_VAR_1");
    }

    #[test]
    fn test_resolve_env_ref_braces_format() {
        std::env::set_var("COHORTIQ_TEST_VAR_2", "test_value_2");

        assert_eq!(
            resolve_env_ref("${COHORTIQ_TEST_VAR_2}"),
            Some("test_value_2".to_string())
        );

        std::env::remove_var("COHORTIQ_TEST_VAR_2");
    }

    #[test]
    fn test_resolve_env_ref_no_match() {
        assert_eq!(resolve_env_ref("regular_value"), None);
        assert_eq!(resolve_env_ref("$NONEXISTENT_VAR_XYZ_12345"), None);
    }

    #[test]
    fn test_get_with_env_fallback_from_setting() {
        let setting = Some("from_settings".to_string());
        let result = get_with_env_fallback(&setting, &["SOME_VAR"], None);
        assert_eq!(result, Some("from_settings".to_string()));
    }

    #[test]
    fn test_get_with_env_fallback_default() {
        let setting = None;
        let result = get_with_env_fallback(
            &setting,
            &["NONEXISTENT_VAR_ABC"],
            Some("default_value".to_string()),
        );
        assert_eq!(result, Some("default_value".to_string()));
    }

    #[tokio::test]
    async fn test_settings_manager_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::with_path(dir.path().join("settings.toml"))
            .await
            .unwrap();
        let settings = manager.get().await;
        assert_eq!(settings.generation.max_poll_attempts, 60);
        assert!(!manager.exists());
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let manager = SettingsManager::with_path(path.clone()).await.unwrap();

        let mut settings = manager.get().await;
        settings.warehouse.catalog = Some("clinical".to_string());
        settings.generation.max_poll_attempts = 5;
        manager.update(settings).await.unwrap();

        let reloaded = SettingsManager::with_path(path).await.unwrap();
        let settings = reloaded.get().await;
        assert_eq!(settings.warehouse.catalog.as_deref(), Some("clinical"));
        assert_eq!(settings.generation.max_poll_attempts, 5);
    }

    #[tokio::test]
    async fn test_env_interpolation_on_load() {
        std::env::set_var("COHORTIQ_TEST_TOKEN", "tok-123");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        tokio::fs::write(&path, "[warehouse]\ntoken = \"$COHORTIQ_TEST_TOKEN\"\n")
            .await
            .unwrap();

        let manager = SettingsManager::with_path(path).await.unwrap();
        let settings = manager.get().await;
        assert_eq!(settings.warehouse.token.as_deref(), Some("tok-123"));

        std::env::remove_var("COHORTIQ_TEST_TOKEN");
    }

    #[tokio::test]
    async fn test_ensure_settings_file_creates_template() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::with_path(dir.path().join("settings.toml"))
            .await
            .unwrap();

        assert!(manager.ensure_settings_file().await.unwrap());
        assert!(manager.exists());
        // Second call is a no-op
        assert!(!manager.ensure_settings_file().await.unwrap());
    }
}
