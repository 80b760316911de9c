//! Analysis pipeline
//!
//! Runs one analysis end to end: image variants, OCR engines, fusion,
//! parsing, catalog lookup and scoring.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use crate::analysis::{fuse_readings, parse_marking, score_marking, AuthenticityReport, FusedText, MarkingInfo, RulesEngine};
use crate::catalog::{Catalog, CatalogMatch};
use crate::config::AppConfig;
use crate::storage::NewAnalysis;
use crate::vision::{generate_variants, load_image, run_engines, write_variants, OcrEngine, OcrReading};

/// Image path recorded for text-only verification
pub const TEXT_ONLY_LABEL: &str = "-";

/// Everything learned from one analysis
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub image_path: String,
    pub fused: FusedText,
    pub marking: MarkingInfo,
    pub catalog_match: Option<CatalogMatch>,
    pub report: AuthenticityReport,
}

impl AnalysisOutcome {
    /// Row for the analysis log
    pub fn to_new_analysis(&self) -> Result<NewAnalysis> {
        let extracted_data = serde_json::json!({
            "marking": self.marking,
            "fused": self.fused,
        });

        Ok(NewAnalysis {
            run_id: self.run_id.clone(),
            timestamp: self.timestamp,
            image_path: self.image_path.clone(),
            part_number: self.marking.part_number.clone(),
            manufacturer: self.marking.manufacturer.clone(),
            is_authentic: self.report.is_authentic(),
            confidence: self.report.confidence(),
            extracted_data,
            official_data: serde_json::to_value(&self.catalog_match)
                .context("Failed to serialize catalog match")?,
            verification_data: serde_json::to_value(&self.report)
                .context("Failed to serialize report")?,
        })
    }
}

/// Runs analyses with a fixed configuration, catalog and engine set
pub struct Analyzer {
    config: AppConfig,
    catalog: Catalog,
    engines: Vec<Box<dyn OcrEngine>>,
    rules: RulesEngine,
}

impl Analyzer {
    /// Create an analyzer, compiling the configured rules
    pub fn new(config: AppConfig, catalog: Catalog, engines: Vec<Box<dyn OcrEngine>>) -> Result<Self> {
        let rules = RulesEngine::from_definitions(&config.rules)?;
        info!(
            "Analyzer ready: {} catalog parts, {} OCR engines, {} rules",
            catalog.len(),
            engines.len(),
            rules.len()
        );

        Ok(Self {
            config,
            catalog,
            engines,
            rules,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Photograph in, scored marking out
    pub fn analyze_image(&self, path: &Path) -> Result<AnalysisOutcome> {
        if self.engines.is_empty() {
            bail!("No OCR engines configured; add [[ocr.engines]] to the config or pass --readings");
        }

        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("analysis", run_id = %run_id);
        let _guard = span.enter();

        info!("Analyzing {:?}", path);
        let image = load_image(path)?;
        let variants = generate_variants(&image, &self.config.preprocessing)?;

        let workdir = tempfile::Builder::new()
            .prefix("chipmark-")
            .tempdir()
            .context("Failed to create working directory")?;
        let files = write_variants(&variants, workdir.path())?;
        debug!("Wrote {} variants to {:?}", files.len(), workdir.path());

        let readings = run_engines(&self.engines, &files, self.config.ocr.min_confidence);
        info!("Collected {} readings", readings.len());

        let fused = self.fuse(&readings);
        Ok(self.finish(run_id, path.display().to_string(), fused))
    }

    /// Analyze readings produced elsewhere, e.g. loaded from a readings file
    pub fn analyze_readings(&self, image_label: &str, readings: &[OcrReading]) -> AnalysisOutcome {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("analysis", run_id = %run_id);
        let _guard = span.enter();

        let min_confidence = self.config.ocr.min_confidence;
        let kept: Vec<OcrReading> = readings
            .iter()
            .filter(|r| r.confidence >= min_confidence)
            .cloned()
            .collect();
        info!("Analyzing {} readings for {}", kept.len(), image_label);

        let fused = self.fuse(&kept);
        self.finish(run_id, image_label.to_string(), fused)
    }

    /// Verify marking text typed in by hand
    pub fn verify_text(&self, lines: &[String]) -> AnalysisOutcome {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("analysis", run_id = %run_id);
        let _guard = span.enter();

        info!("Verifying {} text lines", lines.len());
        self.finish(run_id, TEXT_ONLY_LABEL.to_string(), FusedText::from_manual(lines))
    }

    /// Engine vote weights: live engines first, configured ones for readings files
    fn engine_weights(&self) -> HashMap<String, f32> {
        let mut weights: HashMap<String, f32> = self
            .config
            .ocr
            .engines
            .iter()
            .map(|e| (e.name.clone(), e.weight))
            .collect();
        for engine in &self.engines {
            weights.insert(engine.name().to_string(), engine.weight());
        }
        weights
    }

    fn fuse(&self, readings: &[OcrReading]) -> FusedText {
        fuse_readings(readings, &self.engine_weights(), self.config.ocr.similarity_threshold)
    }

    fn finish(&self, run_id: String, image_path: String, fused: FusedText) -> AnalysisOutcome {
        let timestamp = Utc::now();
        let marking = parse_marking(&fused.texts());
        let catalog_match = marking
            .part_number
            .as_deref()
            .and_then(|part| self.catalog.lookup(part));

        match &catalog_match {
            Some(m) => debug!("Catalog {:?} match: {}", m.kind, m.record.part_number),
            None => debug!("No catalog match for {:?}", marking.part_number),
        }

        let report = score_marking(
            &marking,
            catalog_match.as_ref(),
            &fused,
            &self.config.scoring,
            &self.rules,
            timestamp.year(),
        );

        info!(
            "Result: {} ({}/100) for part {}",
            report.verdict,
            report.score,
            marking.part_number.as_deref().unwrap_or("?")
        );

        AnalysisOutcome {
            run_id,
            timestamp,
            image_path,
            fused,
            marking,
            catalog_match,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Verdict;
    use crate::config::RuleDefinition;
    use crate::storage::Database;
    use crate::vision::{OcrError, VariantKind};
    use image::{GrayImage, Luma};

    /// Engine returning the same lines for every variant
    struct ScriptedEngine {
        name: &'static str,
        lines: Vec<&'static str>,
    }

    impl ScriptedEngine {
        fn new(name: &'static str, lines: Vec<&'static str>) -> Self {
            Self { name, lines }
        }
    }

    impl OcrEngine for ScriptedEngine {
        fn name(&self) -> &str {
            self.name
        }

        fn recognize(&self, image: &Path, variant: VariantKind) -> Result<Vec<OcrReading>, OcrError> {
            assert!(image.exists());
            Ok(self
                .lines
                .iter()
                .enumerate()
                .map(|(line, text)| OcrReading {
                    engine: self.name.to_string(),
                    variant,
                    text: text.to_string(),
                    confidence: 0.9,
                    line,
                    bounds: None,
                })
                .collect())
        }
    }

    fn sample_image(dir: &Path) -> std::path::PathBuf {
        let image = GrayImage::from_fn(24, 12, |x, _| if x % 4 == 0 { Luma([20]) } else { Luma([220]) });
        let path = dir.join("chip.png");
        image.save(&path).unwrap();
        path
    }

    fn reading(engine: &str, text: &str, line: usize) -> OcrReading {
        OcrReading {
            engine: engine.to_string(),
            variant: VariantKind::Original,
            text: text.to_string(),
            confidence: 0.9,
            line,
            bounds: None,
        }
    }

    #[test]
    fn test_analyze_image_runs_engines_on_every_variant() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_image(dir.path());

        let engines: Vec<Box<dyn OcrEngine>> = vec![
            Box::new(ScriptedEngine::new("a", vec!["LM358N", "1831", "TI"])),
            Box::new(ScriptedEngine::new("b", vec!["LM3S8N", "1831", "TI"])),
            Box::new(ScriptedEngine::new("c", vec!["LM358N", "1831", "TI"])),
        ];
        let analyzer = Analyzer::new(AppConfig::default(), Catalog::builtin(), engines).unwrap();

        let outcome = analyzer.analyze_image(&path).unwrap();

        assert_eq!(outcome.marking.part_number.as_deref(), Some("LM358N"));
        assert_eq!(outcome.fused.engines, 3);
        assert_eq!(outcome.fused.texts(), vec!["LM358N", "1831", "TI"]);
        assert!(outcome.catalog_match.is_some());
        assert_eq!(outcome.report.verdict, Verdict::Authentic);
        assert_eq!(outcome.image_path, path.display().to_string());
    }

    #[test]
    fn test_analyze_image_without_engines_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_image(dir.path());
        let analyzer = Analyzer::new(AppConfig::default(), Catalog::builtin(), Vec::new()).unwrap();

        assert!(analyzer.analyze_image(&path).is_err());
    }

    #[test]
    fn test_analyze_missing_image_fails() {
        let engines: Vec<Box<dyn OcrEngine>> = vec![Box::new(ScriptedEngine::new("a", vec!["LM358N"]))];
        let analyzer = Analyzer::new(AppConfig::default(), Catalog::builtin(), engines).unwrap();

        assert!(analyzer.analyze_image(Path::new("/nonexistent/chip.png")).is_err());
    }

    #[test]
    fn test_analyze_readings() {
        let analyzer = Analyzer::new(AppConfig::default(), Catalog::builtin(), Vec::new()).unwrap();
        let readings = vec![
            reading("easyocr", "ATME6A328P", 0),
            reading("easyocr", "AU 1934", 1),
            reading("paddle", "ATMEGA328P", 0),
            reading("paddle", "AU 1934", 1),
            reading("paddle", "zz", 2),
        ];

        let outcome = analyzer.analyze_readings("board.jpg", &readings);
        assert_eq!(outcome.marking.part_number.as_deref(), Some("ATMEGA328P"));
        assert_eq!(outcome.marking.date_code.as_ref().map(|d| d.year), Some(2019));
        assert_eq!(outcome.image_path, "board.jpg");
    }

    #[test]
    fn test_verify_text_unknown_part() {
        let analyzer = Analyzer::new(AppConfig::default(), Catalog::builtin(), Vec::new()).unwrap();
        let outcome = analyzer.verify_text(&["".to_string()]);

        assert_eq!(outcome.report.verdict, Verdict::Unknown);
        assert_eq!(outcome.image_path, TEXT_ONLY_LABEL);
    }

    #[test]
    fn test_invalid_rule_rejected_at_construction() {
        let mut config = AppConfig::default();
        config.rules.push(RuleDefinition {
            id: "broken".to_string(),
            name: "Broken".to_string(),
            enabled: true,
            script: "let = ;".to_string(),
        });

        assert!(Analyzer::new(config, Catalog::builtin(), Vec::new()).is_err());
    }

    #[test]
    fn test_outcome_persists() {
        let analyzer = Analyzer::new(AppConfig::default(), Catalog::builtin(), Vec::new()).unwrap();
        let outcome = analyzer.verify_text(&["NE555P".to_string(), "2105".to_string()]);

        let db = Database::open_in_memory().unwrap();
        let id = db.insert_analysis(&outcome.to_new_analysis().unwrap()).unwrap();
        let stored = db.get_analysis(id).unwrap().unwrap();

        assert_eq!(stored.run_id, outcome.run_id);
        assert_eq!(stored.part_number.as_deref(), Some("NE555P"));
        assert_eq!(stored.is_authentic, outcome.report.is_authentic());
        assert_eq!(stored.official_data["record"]["part_number"], "NE555");
        assert_eq!(stored.extracted_data["marking"]["part_number"], "NE555P");
    }
}
