//! OCR engine interface
//!
//! Engines are external programs: anything that takes an image path and
//! prints recognized text, either line by line or as JSON. Precomputed
//! results can be supplied as a readings file instead.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::preprocess::VariantKind;
use crate::config::{EngineConfig, EngineOutput};

/// Errors raised while running an OCR engine
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("failed to start {engine}: {source}")]
    Spawn {
        engine: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{engine} exited with {status}: {stderr}")]
    Failed {
        engine: String,
        status: String,
        stderr: String,
    },
    #[error("{engine} timed out after {secs}s")]
    Timeout { engine: String, secs: u64 },
    #[error("{engine} produced unreadable output: {reason}")]
    InvalidOutput { engine: String, reason: String },
}

/// A single line of text recognized by one engine on one image variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrReading {
    /// Engine that produced the reading
    pub engine: String,
    /// Image variant the engine read
    pub variant: VariantKind,
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
    /// Line position within the engine's output
    pub line: usize,
    /// Bounding box (x, y, width, height)
    pub bounds: Option<(u32, u32, u32, u32)>,
}

/// Anything that can turn an image file into text readings
pub trait OcrEngine {
    /// Engine name
    fn name(&self) -> &str;

    /// Vote weight during fusion
    fn weight(&self) -> f32 {
        1.0
    }

    /// Recognize text in the image at `image`
    fn recognize(&self, image: &Path, variant: VariantKind) -> Result<Vec<OcrReading>, OcrError>;
}

/// OCR engine backed by an external command
pub struct CommandOcrEngine {
    config: EngineConfig,
    default_confidence: f32,
    timeout: Duration,
}

/// JSON object emitted by engines with `output = "json"`
#[derive(Debug, Deserialize)]
struct JsonLine {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    bounds: Option<(u32, u32, u32, u32)>,
}

impl CommandOcrEngine {
    pub fn new(config: EngineConfig, default_confidence: f32, timeout: Duration) -> Self {
        Self {
            config,
            default_confidence,
            timeout,
        }
    }

    /// Arguments with `{image}` substituted
    fn build_args(&self, image: &Path) -> Vec<String> {
        let image = image.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{image}", &image))
            .collect()
    }

    async fn run(&self, image: &Path) -> Result<Vec<u8>, OcrError> {
        let name = &self.config.name;
        let child = tokio::process::Command::new(&self.config.command)
            .args(self.build_args(image))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| OcrError::Timeout {
                engine: name.clone(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|source| OcrError::Spawn {
                engine: name.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(OcrError::Failed {
                engine: name.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// Turn engine stdout into readings
    fn parse_output(&self, stdout: &[u8], variant: VariantKind) -> Result<Vec<OcrReading>, OcrError> {
        let text = String::from_utf8_lossy(stdout);
        let reading = |line: usize, text: String, confidence: f32, bounds: Option<(u32, u32, u32, u32)>| OcrReading {
            engine: self.config.name.clone(),
            variant,
            text,
            confidence: confidence.clamp(0.0, 1.0),
            line,
            bounds,
        };

        match self.config.output {
            EngineOutput::Text => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .enumerate()
                .map(|(i, l)| reading(i, l.to_string(), self.default_confidence, None))
                .collect()),
            EngineOutput::Json => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(Vec::new());
                }
                let lines: Vec<JsonLine> =
                    serde_json::from_str(trimmed).map_err(|e| OcrError::InvalidOutput {
                        engine: self.config.name.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(lines
                    .into_iter()
                    .filter(|l| !l.text.trim().is_empty())
                    .enumerate()
                    .map(|(i, l)| {
                        let confidence = l.confidence.unwrap_or(self.default_confidence);
                        reading(i, l.text.trim().to_string(), confidence, l.bounds)
                    })
                    .collect())
            }
        }
    }
}

impl OcrEngine for CommandOcrEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn weight(&self) -> f32 {
        self.config.weight
    }

    fn recognize(&self, image: &Path, variant: VariantKind) -> Result<Vec<OcrReading>, OcrError> {
        debug!("Running {} on {:?}", self.config.name, image);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| OcrError::Spawn {
                engine: self.config.name.clone(),
                source,
            })?;
        let stdout = runtime.block_on(self.run(image))?;

        self.parse_output(&stdout, variant)
    }
}

/// Build command engines for every enabled engine in the configuration
pub fn engines_from_config(settings: &crate::config::OcrSettings) -> Vec<Box<dyn OcrEngine>> {
    settings
        .engines
        .iter()
        .filter(|e| e.enabled)
        .map(|e| {
            Box::new(CommandOcrEngine::new(
                e.clone(),
                settings.default_confidence,
                Duration::from_secs(settings.timeout_secs),
            )) as Box<dyn OcrEngine>
        })
        .collect()
}

/// Run every engine over every variant image
///
/// A failing engine is logged and skipped so the others still contribute.
pub fn run_engines(
    engines: &[Box<dyn OcrEngine>],
    variants: &[(VariantKind, PathBuf)],
    min_confidence: f32,
) -> Vec<OcrReading> {
    let mut readings = Vec::new();

    for engine in engines {
        for (kind, path) in variants {
            match engine.recognize(path, *kind) {
                Ok(found) => {
                    debug!("{} read {} lines from {} variant", engine.name(), found.len(), kind);
                    readings.extend(found.into_iter().filter(|r| r.confidence >= min_confidence));
                }
                Err(e) => warn!("OCR engine {} failed on {} variant: {}", engine.name(), kind, e),
            }
        }
    }

    readings
}

/// Precomputed readings, e.g. exported from an OCR tool run elsewhere
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingsFile {
    pub readings: Vec<FileReading>,
}

/// Reading as it appears in a readings file; most fields are optional
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReading {
    #[serde(default = "default_engine_name")]
    pub engine: String,
    #[serde(default)]
    pub variant: VariantKind,
    pub text: String,
    /// Missing confidences fall back to the configured default
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub bounds: Option<(u32, u32, u32, u32)>,
}

fn default_engine_name() -> String {
    "external".to_string()
}

/// Load readings from a JSON file
///
/// Readings without a line index are numbered in file order per engine;
/// readings without a confidence get `default_confidence`.
pub fn load_readings(path: &Path, default_confidence: f32) -> Result<Vec<OcrReading>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read readings file {:?}", path))?;
    let file: ReadingsFile = serde_json::from_str(&content)
        .with_context(|| format!("Invalid readings file {:?}", path))?;

    let mut counters: std::collections::HashMap<(String, VariantKind), usize> =
        std::collections::HashMap::new();

    Ok(file
        .readings
        .into_iter()
        .map(|r| {
            let counter = counters.entry((r.engine.clone(), r.variant)).or_insert(0);
            let line = r.line.unwrap_or(*counter);
            *counter += 1;
            OcrReading {
                engine: r.engine,
                variant: r.variant,
                text: r.text,
                confidence: r.confidence.unwrap_or(default_confidence).clamp(0.0, 1.0),
                line,
                bounds: r.bounds,
            }
        })
        .collect())
}
