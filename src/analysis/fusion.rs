//! Multi-engine reading fusion
//!
//! Every engine reads every image variant, so one marking line arrives as
//! many slightly different strings. Readings are clustered by similarity
//! and each cluster is voted down to a single consensus line.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use strsim::normalized_levenshtein;
use tracing::debug;

use super::correction::normalize_line;
use crate::vision::OcrReading;

/// One consensus line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedLine {
    /// Consensus text (normalized)
    pub text: String,
    /// Mean confidence of the readings supporting the line
    pub confidence: f32,
    /// Number of distinct engines that read the line
    pub support: usize,
    /// `engine/variant` pairs that contributed
    pub sources: Vec<String>,
}

/// Fusion result for one analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusedText {
    pub lines: Vec<FusedLine>,
    /// Mean share of engines supporting each line (0.0 - 1.0)
    pub agreement: f32,
    /// Distinct engines that produced readings
    pub engines: usize,
    /// Readings considered
    pub reading_count: usize,
}

impl FusedText {
    /// Fused line texts in order
    pub fn texts(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.text.clone()).collect()
    }

    /// Mean line confidence, 0.0 when nothing was read
    pub fn mean_confidence(&self) -> f32 {
        if self.lines.is_empty() {
            return 0.0;
        }
        self.lines.iter().map(|l| l.confidence).sum::<f32>() / self.lines.len() as f32
    }

    /// Wrap manually entered lines, e.g. text typed in by the user
    pub fn from_manual(lines: &[String]) -> Self {
        let lines: Vec<FusedLine> = lines
            .iter()
            .map(|l| normalize_line(l))
            .filter(|l| !l.is_empty())
            .map(|text| FusedLine {
                text,
                confidence: 1.0,
                support: 1,
                sources: vec!["manual".to_string()],
            })
            .collect();
        let agreement = if lines.is_empty() { 0.0 } else { 1.0 };
        Self {
            reading_count: lines.len(),
            lines,
            agreement,
            engines: 1,
        }
    }
}

struct Member<'a> {
    reading: &'a OcrReading,
    text: String,
    weight: f32,
}

struct Cluster<'a> {
    representative: String,
    members: Vec<Member<'a>>,
}

impl Cluster<'_> {
    fn weight(&self) -> f32 {
        self.members.iter().map(|m| m.weight).sum()
    }

    fn position(&self) -> f32 {
        self.members.iter().map(|m| m.reading.line as f32).sum::<f32>() / self.members.len() as f32
    }
}

/// Fuse readings from several engines and variants into consensus lines
///
/// `engine_weights` scales each engine's vote; unknown engines weigh 1.0.
pub fn fuse_readings(
    readings: &[OcrReading],
    engine_weights: &HashMap<String, f32>,
    similarity_threshold: f32,
) -> FusedText {
    let mut members: Vec<Member<'_>> = readings
        .iter()
        .filter_map(|reading| {
            let text = normalize_line(&reading.text);
            if text.is_empty() {
                return None;
            }
            let engine_weight = engine_weights.get(&reading.engine).copied().unwrap_or(1.0);
            Some(Member {
                reading,
                text,
                weight: engine_weight * reading.confidence,
            })
        })
        .collect();

    let reading_count = members.len();
    if members.is_empty() {
        return FusedText::default();
    }

    let engines: BTreeSet<&str> = members.iter().map(|m| m.reading.engine.as_str()).collect();
    let engine_count = engines.len();

    // Strongest readings seed the clusters
    members.sort_by(|a, b| b.weight.total_cmp(&a.weight));

    let mut clusters: Vec<Cluster<'_>> = Vec::new();
    for member in members {
        let best = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (i, normalized_levenshtein(&c.representative, &member.text) as f32))
            .filter(|(_, sim)| *sim >= similarity_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((i, _)) => clusters[i].members.push(member),
            None => clusters.push(Cluster {
                representative: member.text.clone(),
                members: vec![member],
            }),
        }
    }

    clusters.sort_by(|a, b| a.position().total_cmp(&b.position()));

    let lines: Vec<FusedLine> = clusters.iter().map(fuse_cluster).collect();
    let agreement = if lines.is_empty() {
        0.0
    } else {
        lines.iter().map(|l| l.support as f32 / engine_count as f32).sum::<f32>() / lines.len() as f32
    };

    debug!(
        "Fused {} readings from {} engines into {} lines (agreement {:.2})",
        reading_count,
        engine_count,
        lines.len(),
        agreement
    );

    FusedText {
        lines,
        agreement,
        engines: engine_count,
        reading_count,
    }
}

fn fuse_cluster(cluster: &Cluster<'_>) -> FusedLine {
    // Pool votes for identical strings, strongest first
    let mut candidates: Vec<(String, f32)> = Vec::new();
    for member in &cluster.members {
        match candidates.iter_mut().find(|(text, _)| *text == member.text) {
            Some((_, weight)) => *weight += member.weight,
            None => candidates.push((member.text.clone(), member.weight)),
        }
    }
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    let top_len = candidates[0].0.chars().count();
    let same_length: Vec<&(String, f32)> = candidates
        .iter()
        .filter(|(text, _)| text.chars().count() == top_len)
        .collect();

    let text = if same_length.len() > 1 {
        vote_characters(&same_length, top_len)
    } else {
        candidates[0].0.clone()
    };

    let confidence = cluster.members.iter().map(|m| m.reading.confidence).sum::<f32>()
        / cluster.members.len() as f32;
    let support = cluster
        .members
        .iter()
        .map(|m| m.reading.engine.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    let sources = cluster
        .members
        .iter()
        .map(|m| format!("{}/{}", m.reading.engine, m.reading.variant))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    FusedLine {
        text,
        confidence,
        support,
        sources,
    }
}

/// Position-wise weighted character vote; ties go to the strongest candidate
fn vote_characters(candidates: &[&(String, f32)], len: usize) -> String {
    let columns: Vec<Vec<char>> = candidates.iter().map(|(t, _)| t.chars().collect()).collect();

    (0..len)
        .map(|pos| {
            let mut tally: Vec<(char, f32)> = Vec::new();
            for (chars, (_, weight)) in columns.iter().zip(candidates) {
                let c = chars[pos];
                match tally.iter_mut().find(|(t, _)| *t == c) {
                    Some((_, w)) => *w += weight,
                    None => tally.push((c, *weight)),
                }
            }
            let mut best = tally[0];
            for entry in &tally[1..] {
                if entry.1 > best.1 {
                    best = *entry;
                }
            }
            best.0
        })
        .collect()
}
