//! Application Configuration
//!
//! User settings stored in TOML format: preprocessing, OCR engines,
//! scoring weights and custom scoring rules.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::vision::preprocess::VariantKind;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Image preprocessing before OCR
    pub preprocessing: OcrPreprocessing,
    /// OCR engine settings
    pub ocr: OcrSettings,
    /// Authenticity scoring weights
    pub scoring: ScoringWeights,
    /// Custom scoring rules
    pub rules: Vec<RuleDefinition>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// SQLite database location (defaults to the data directory)
    pub database_path: Option<PathBuf>,
    /// Extra catalog merged over the built-in one
    pub catalog_path: Option<PathBuf>,
    /// Append every analysis to the database
    pub save_results: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            catalog_path: None,
            save_results: true,
        }
    }
}

/// Preprocessing applied to photographs before OCR
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrPreprocessing {
    /// Master switch; when off only the original image is used
    pub enabled: bool,
    /// Convert to grayscale and equalize the histogram
    pub grayscale: bool,
    /// Contrast factor around mid-grey (1.0 = unchanged)
    pub contrast: f32,
    /// Sharpen strength (0.0 = off)
    pub sharpen: f32,
    /// Integer upscale factor applied first (1 = unchanged)
    pub scale: u32,
    /// Produce a median-filtered variant
    pub denoise: bool,
    /// Variants handed to the OCR engines
    pub variants: Vec<VariantKind>,
}

impl Default for OcrPreprocessing {
    fn default() -> Self {
        Self {
            enabled: true,
            grayscale: true,
            contrast: 1.5,
            sharpen: 0.5,
            scale: 2,
            denoise: true,
            variants: VariantKind::ALL.to_vec(),
        }
    }
}

/// How an engine reports its results on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOutput {
    /// One recognized line per stdout line
    #[default]
    Text,
    /// JSON array of `{text, confidence, bounds}` objects
    Json,
}

/// An external OCR program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine name used in logs and fusion
    pub name: String,
    /// Program to run
    pub command: String,
    /// Arguments; `{image}` is replaced by the image path
    #[serde(default)]
    pub args: Vec<String>,
    /// Vote weight during fusion
    #[serde(default = "default_engine_weight")]
    pub weight: f32,
    /// Whether this engine runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Output format
    #[serde(default)]
    pub output: EngineOutput,
}

fn default_engine_weight() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

/// OCR engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Configured engines
    pub engines: Vec<EngineConfig>,
    /// Confidence assigned to plain-text engine output
    pub default_confidence: f32,
    /// Readings below this confidence are dropped
    pub min_confidence: f32,
    /// Per-invocation timeout
    pub timeout_secs: u64,
    /// Minimum normalized similarity for two readings to be the same line
    pub similarity_threshold: f32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            engines: Vec::new(),
            default_confidence: 0.6,
            min_confidence: 0.1,
            timeout_secs: 60,
            similarity_threshold: 0.75,
        }
    }
}

/// Point weights for the authenticity score (out of 100)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub catalog_match: i32,
    pub date_code: i32,
    pub ocr_confidence: i32,
    pub manufacturer_match: i32,
    pub manufacturer_mismatch: i32,
    pub future_date_code: i32,
    pub date_before_production: i32,
    pub date_after_discontinued: i32,
    pub low_agreement: i32,
    /// Agreement ratio under which `low_agreement` applies
    pub low_agreement_threshold: f32,
    /// Score at or above which a part is reported authentic
    pub authentic_threshold: u8,
    /// Score at or above which a part is reported suspicious rather than counterfeit
    pub suspicious_threshold: u8,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            catalog_match: 40,
            date_code: 30,
            ocr_confidence: 20,
            manufacturer_match: 10,
            manufacturer_mismatch: -20,
            future_date_code: -40,
            date_before_production: -30,
            date_after_discontinued: -15,
            low_agreement: -10,
            low_agreement_threshold: 0.5,
            authentic_threshold: 70,
            suspicious_threshold: 40,
        }
    }
}

/// A user-defined scoring rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Rule identifier
    pub id: String,
    /// Rule name
    pub name: String,
    /// Whether the rule is evaluated
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rhai script code
    pub script: String,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Default location of the configuration file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

/// Load configuration from an explicit path, the config directory, or defaults
pub fn load_or_create_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = load_config(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(path) = default_config_path() {
        if path.exists() {
            let config = load_config(&path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))?;
            info!("Loaded configuration from {:?}", path);
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert!(config.general.database_path.is_none());
        assert!(config.general.save_results);

        assert!(config.preprocessing.enabled);
        assert_eq!(config.preprocessing.scale, 2);
        assert_eq!(config.preprocessing.variants.len(), VariantKind::ALL.len());

        assert!(config.ocr.engines.is_empty());
        assert!((config.ocr.default_confidence - 0.6).abs() < 0.01);

        assert_eq!(config.scoring.catalog_match, 40);
        assert_eq!(config.scoring.date_code, 30);
        assert_eq!(config.scoring.ocr_confidence, 20);
        assert_eq!(config.scoring.manufacturer_match, 10);
        assert_eq!(config.scoring.authentic_threshold, 70);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.preprocessing.scale, parsed.preprocessing.scale);
        assert_eq!(config.scoring.future_date_code, parsed.scoring.future_date_code);
        assert_eq!(config.ocr.timeout_secs, parsed.ocr.timeout_secs);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [scoring]
            catalog_match = 50

            [[ocr.engines]]
            name = "tesseract"
            command = "tesseract"
            args = ["{image}", "stdout", "--psm", "6"]

            [[rules]]
            id = "no-ti-lm"
            name = "TI never marks LM parts with lowercase"
            script = "0"
        "#;
        let parsed: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(parsed.scoring.catalog_match, 50);
        assert_eq!(parsed.scoring.date_code, 30);
        assert_eq!(parsed.ocr.engines.len(), 1);
        assert!((parsed.ocr.engines[0].weight - 1.0).abs() < f32::EPSILON);
        assert!(parsed.ocr.engines[0].enabled);
        assert_eq!(parsed.ocr.engines[0].output, EngineOutput::Text);
        assert!(parsed.rules[0].enabled);
        assert!(parsed.preprocessing.enabled);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.general.save_results = false;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert!(!loaded.general.save_results);
        assert_eq!(config.scoring.low_agreement, loaded.scoring.low_agreement);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_missing_config_is_error() {
        let result = load_or_create_config(Some(Path::new("/nonexistent/chipmark.toml")));
        assert!(result.is_err());
    }
}
