//! Datasheet reference catalog
//!
//! Known parts with their manufacturer and production window. A small
//! catalog is built in; users can merge their own from JSON or TOML, or
//! download one with `sync`.

pub mod sync;

pub use sync::sync_catalog;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use strsim::normalized_levenshtein;
use thiserror::Error;
use tracing::debug;

const BUILTIN_CATALOG: &str = include_str!("builtin.json");

/// File name of a synced catalog inside the data directory
pub const DEFAULT_CATALOG_FILE: &str = "catalog.json";

/// Minimum similarity for a fuzzy catalog hit
const FUZZY_THRESHOLD: f64 = 0.8;

/// Shortest catalog key allowed to match as a base part number
const MIN_BASE_LEN: usize = 3;

/// Errors raised while loading or fetching catalogs
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON catalog: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML catalog: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported catalog format {0:?} (expected .json or .toml)")]
    UnsupportedFormat(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("offline mode: refusing to download {0}")]
    Offline(String),
}

/// Reference data for one part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Base part number, without package or grade suffixes
    pub part_number: String,
    pub manufacturer: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub packages: Vec<String>,
    /// First production year
    #[serde(default)]
    pub first_year: Option<i32>,
    /// Last production year for discontinued parts
    #[serde(default)]
    pub last_year: Option<i32>,
    #[serde(default)]
    pub datasheet_url: Option<String>,
}

/// How a query matched the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Same part number
    Exact,
    /// Catalog part number is a prefix of the query (ordering suffix stripped)
    Base,
    /// Closest part number by edit distance
    Fuzzy,
}

/// A catalog lookup result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogMatch {
    pub record: PartRecord,
    /// Similarity between query and catalog part number (0.0 - 1.0)
    pub similarity: f32,
    pub kind: MatchKind,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    parts: Vec<PartRecord>,
}

/// Collection of known parts indexed by normalized part number
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    parts: Vec<PartRecord>,
    index: HashMap<String, usize>,
}

/// Uppercase alphanumerics only, so `lm-358` and `LM358` share a key
pub fn normalize_key(part: &str) -> String {
    part.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

impl Catalog {
    /// Build a catalog from records; later duplicates replace earlier ones
    pub fn from_records(records: Vec<PartRecord>) -> Self {
        let mut catalog = Self::default();
        for record in records {
            catalog.insert(record);
        }
        catalog
    }

    /// The catalog shipped with the binary
    pub fn builtin() -> Self {
        match serde_json::from_str::<CatalogFile>(BUILTIN_CATALOG) {
            Ok(file) => Self::from_records(file.parts),
            Err(e) => {
                tracing::error!("Built-in catalog is invalid: {}", e);
                Self::default()
            }
        }
    }

    /// Parse catalog text in the format implied by `extension`
    pub fn parse(content: &str, extension: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = match extension.to_ascii_lowercase().as_str() {
            "json" => serde_json::from_str(content)?,
            "toml" => toml::from_str(content)?,
            other => return Err(CatalogError::UnsupportedFormat(other.to_string())),
        };
        Ok(Self::from_records(file.parts))
    }

    /// Load a catalog from a `.json` or `.toml` file
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let catalog = Self::parse(&content, extension)?;
        debug!("Loaded {} parts from {:?}", catalog.len(), path);
        Ok(catalog)
    }

    /// Add or replace a part
    pub fn insert(&mut self, record: PartRecord) {
        let key = normalize_key(&record.part_number);
        if key.is_empty() {
            return;
        }
        match self.index.get(&key) {
            Some(&i) => self.parts[i] = record,
            None => {
                self.index.insert(key, self.parts.len());
                self.parts.push(record);
            }
        }
    }

    /// Merge another catalog over this one
    pub fn merge(&mut self, other: Catalog) {
        for record in other.parts {
            self.insert(record);
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Find the catalog entry for an extracted part number
    pub fn lookup(&self, part: &str) -> Option<CatalogMatch> {
        let query = normalize_key(part);
        if query.is_empty() {
            return None;
        }

        if let Some(&i) = self.index.get(&query) {
            return Some(CatalogMatch {
                record: self.parts[i].clone(),
                similarity: 1.0,
                kind: MatchKind::Exact,
            });
        }

        let base = self
            .index
            .iter()
            .filter(|(key, _)| key.len() >= MIN_BASE_LEN && query.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len());
        if let Some((key, &i)) = base {
            return Some(CatalogMatch {
                record: self.parts[i].clone(),
                similarity: key.len() as f32 / query.len() as f32,
                kind: MatchKind::Base,
            });
        }

        let fuzzy = self
            .index
            .iter()
            .map(|(key, &i)| (normalized_levenshtein(key, &query), i))
            .filter(|(similarity, _)| *similarity >= FUZZY_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        fuzzy.map(|(similarity, i)| CatalogMatch {
            record: self.parts[i].clone(),
            similarity: similarity as f32,
            kind: MatchKind::Fuzzy,
        })
    }
}
