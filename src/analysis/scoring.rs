//! Authenticity scoring
//!
//! Adds up independently weighted findings about a marking into a score
//! out of 100 and a verdict.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::families::{infer_manufacturer, same_manufacturer};
use super::fusion::FusedText;
use super::parser::{ManufacturerSource, MarkingInfo};
use super::rules::{RuleContext, RulesEngine};
use crate::catalog::{CatalogMatch, MatchKind};
use crate::config::ScoringWeights;

/// Overall judgement on a marking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Authentic,
    Suspicious,
    LikelyCounterfeit,
    /// No part number could be read
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Authentic => "authentic",
            Verdict::Suspicious => "suspicious",
            Verdict::LikelyCounterfeit => "likely counterfeit",
            Verdict::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One scoring observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule that produced the finding (`catalog`, `date_code`, or a user rule id)
    pub rule: String,
    pub points: i32,
    pub message: String,
}

/// Scoring outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticityReport {
    /// 0 - 100
    pub score: u8,
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
}

impl AuthenticityReport {
    pub fn is_authentic(&self) -> bool {
        self.verdict == Verdict::Authentic
    }

    /// Score as a fraction, as stored in the analysis log
    pub fn confidence(&self) -> f64 {
        self.score as f64 / 100.0
    }
}

/// Score a parsed marking
pub fn score_marking(
    marking: &MarkingInfo,
    catalog_match: Option<&CatalogMatch>,
    fused: &FusedText,
    weights: &ScoringWeights,
    rules: &RulesEngine,
    now_year: i32,
) -> AuthenticityReport {
    let mut findings = Vec::new();
    let mut add = |rule: &str, points: i32, message: String| {
        findings.push(Finding {
            rule: rule.to_string(),
            points,
            message,
        })
    };

    // Catalog
    match catalog_match {
        Some(m) => {
            let points = match m.kind {
                MatchKind::Exact => weights.catalog_match,
                MatchKind::Base => (weights.catalog_match as f32 * 0.9).round() as i32,
                MatchKind::Fuzzy => (weights.catalog_match as f32 * m.similarity).round() as i32,
            };
            let how = match m.kind {
                MatchKind::Exact => "exact".to_string(),
                MatchKind::Base => "base part".to_string(),
                MatchKind::Fuzzy => format!("fuzzy, {:.0}% similar", m.similarity * 100.0),
            };
            add(
                "catalog",
                points,
                format!("Matches catalog part {} ({})", m.record.part_number, how),
            );
        }
        None => {
            if let Some(part) = &marking.part_number {
                add("catalog", 0, format!("Part {} not found in catalog", part));
            }
        }
    }

    // Date code
    match &marking.date_code {
        Some(dc) => {
            let record = catalog_match.map(|m| &m.record);
            if dc.year > now_year {
                add(
                    "date_code",
                    weights.future_date_code,
                    format!("Date code {} is in the future ({})", dc.raw, dc.year),
                );
            } else if let Some(first) = record.and_then(|r| r.first_year).filter(|first| dc.year < *first) {
                add(
                    "date_code",
                    weights.date_before_production,
                    format!("Date code {} predates production start ({})", dc.raw, first),
                );
            } else if let Some(last) = record.and_then(|r| r.last_year).filter(|last| dc.year > *last) {
                add(
                    "date_code",
                    weights.date_after_discontinued,
                    format!("Date code {} is after the part was discontinued ({})", dc.raw, last),
                );
            } else {
                add(
                    "date_code",
                    weights.date_code,
                    format!("Date code {} (week {} of {}) is plausible", dc.raw, dc.week, dc.year),
                );
            }
        }
        None => add("date_code", 0, "No date code found".to_string()),
    }

    // OCR quality
    let confidence = fused.mean_confidence();
    add(
        "ocr_confidence",
        (weights.ocr_confidence as f32 * confidence).round() as i32,
        format!("Mean OCR confidence {:.0}%", confidence * 100.0),
    );

    if fused.engines > 1 && fused.agreement < weights.low_agreement_threshold {
        add(
            "agreement",
            weights.low_agreement,
            format!(
                "OCR engines disagree ({:.0}% agreement across {} engines)",
                fused.agreement * 100.0,
                fused.engines
            ),
        );
    }

    // Manufacturer
    if let (Some(printed), Some(ManufacturerSource::Explicit)) =
        (&marking.manufacturer, marking.manufacturer_source)
    {
        let expected = catalog_match
            .map(|m| m.record.manufacturer.clone())
            .or_else(|| marking.part_number.as_deref().and_then(infer_manufacturer).map(str::to_string));

        if let Some(expected) = expected {
            if same_manufacturer(printed, &expected) {
                add(
                    "manufacturer",
                    weights.manufacturer_match,
                    format!("Printed manufacturer {} matches", printed),
                );
            } else {
                add(
                    "manufacturer",
                    weights.manufacturer_mismatch,
                    format!("Printed manufacturer {} but part belongs to {}", printed, expected),
                );
            }
        }
    }

    // User rules
    let context = RuleContext {
        part_number: marking.part_number.clone(),
        manufacturer: marking.manufacturer.clone(),
        date_year: marking.date_code.as_ref().map(|d| d.year),
        date_week: marking.date_code.as_ref().map(|d| d.week),
        lot_code: marking.lot_code.clone(),
        has_catalog_match: catalog_match.is_some(),
        ocr_confidence: confidence,
        agreement: fused.agreement,
        text: marking.lines.join("\n"),
    };
    for result in rules.evaluate(&context) {
        let message = result
            .message
            .unwrap_or_else(|| format!("Rule {} matched", result.rule_id));
        add(&result.rule_id, result.points, message);
    }

    // Rule points can each reach i32::MAX, so sum wide
    let total: i64 = findings.iter().map(|f| i64::from(f.points)).sum();
    let score = total.clamp(0, 100) as u8;

    let verdict = if marking.part_number.is_none() {
        Verdict::Unknown
    } else if score >= weights.authentic_threshold {
        Verdict::Authentic
    } else if score >= weights.suspicious_threshold {
        Verdict::Suspicious
    } else {
        Verdict::LikelyCounterfeit
    };

    AuthenticityReport {
        score,
        verdict,
        findings,
    }
}
