//! Settings loading and validation for slidegen.
//!
//! Settings live in `<project>/.slidegen/settings.json`. Every section is
//! optional and falls back to its defaults, so an empty object is a valid
//! settings file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::batch::BatchConfig;
use crate::cost::PricingConfig;
use crate::engine::EngineSettings;
use crate::error::{Result, SlidegenError};
use crate::feedback::FeedbackConfig;
use crate::retry::RetryConfig;

/// Project state directory name.
pub const STATE_DIR: &str = ".slidegen";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub engines: EngineSettings,
    pub pricing: PricingConfig,
    pub feedback: FeedbackConfig,
}

impl Settings {
    /// Load settings from a project directory; a missing file yields defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);

        if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path).map_err(|e| {
                SlidegenError::config_with_path(
                    format!("Failed to read settings: {e}"),
                    settings_path.clone(),
                )
            })?;
            serde_json::from_str(&content).map_err(|e| {
                SlidegenError::config_with_path(
                    format!("Failed to parse settings: {e}"),
                    settings_path.clone(),
                )
            })
        } else {
            Ok(Self::default())
        }
    }

    /// Load and reject settings with any validation problem.
    pub fn load_validated(project_dir: &Path) -> Result<Self> {
        let settings = Self::load(project_dir)?;
        let problems = settings.validate();
        if !problems.is_empty() {
            return Err(SlidegenError::config_with_path(
                problems.join("; "),
                Self::settings_path(project_dir),
            ));
        }
        Ok(settings)
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        Self::state_dir(project_dir).join("settings.json")
    }

    /// Get the state directory (settings, cost ledger)
    pub fn state_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR)
    }

    /// All problems across sections, prefixed with their field path.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.retry.validate();
        problems.extend(self.engines.validate());
        problems.extend(self.pricing.validate());
        problems.extend(self.feedback.validate());
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            Settings::settings_path(dir.path()),
            r#"{"retry": {"max_attempts": 5}, "batch": {"inter_item_delay_ms": 0}}"#,
        )
        .unwrap();

        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.base_delay_ms, 2000);
        assert_eq!(settings.batch.inter_item_delay_ms, 0);
        assert_eq!(settings.feedback.capacity, 30);
        assert_eq!(settings.engines.primary, "flux");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(Settings::settings_path(dir.path()), "{not json").unwrap();

        let err = Settings::load(dir.path()).unwrap_err();
        assert!(matches!(err, SlidegenError::Config { path: Some(_), .. }));
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_validation_aggregates_sections() {
        let mut settings = Settings::default();
        settings.retry.max_attempts = 0;
        settings.engines.primary = "dalle".to_string();
        settings.feedback.max_rules = 0;

        let problems = settings.validate();
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("engines.primary")));
    }

    #[test]
    fn test_load_validated_rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            Settings::settings_path(dir.path()),
            r#"{"retry": {"max_attempts": 0}}"#,
        )
        .unwrap();
        assert!(Settings::load_validated(dir.path()).is_err());
    }
}
