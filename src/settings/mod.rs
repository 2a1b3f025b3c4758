//! Centralized TOML-based settings system for cohortiq.
//!
//! Settings are loaded from `~/.cohortiq/settings.toml` with environment
//! variable interpolation support. Existing environment variables remain
//! usable through the `get_with_env_fallback` helper.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cohortiq::settings::{SettingsManager, get_with_env_fallback};
//!
//! // Load settings
//! let manager = SettingsManager::new().await?;
//! let settings = manager.get().await;
//!
//! // Get a value with environment variable fallback
//! let token = get_with_env_fallback(
//!     &settings.warehouse.token,
//!     &["WAREHOUSE_TOKEN"],
//!     None,
//! );
//! ```

pub mod loader;
pub mod schema;

pub use loader::{get_with_env_fallback, load_env_file, settings_path, SettingsManager};
pub use schema::{AnalysisSettings, CohortIqSettings, GenerationSettings, WarehouseSettings};
