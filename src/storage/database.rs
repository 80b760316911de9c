//! SQLite database for persistent storage
//!
//! One row is appended per analysis. Rows are never updated.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS analyses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        image_path TEXT NOT NULL,
        part_number TEXT,
        manufacturer TEXT,
        is_authentic INTEGER NOT NULL,
        confidence REAL NOT NULL,
        extracted_data TEXT NOT NULL,
        official_data TEXT NOT NULL,
        verification_data TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_analyses_part
        ON analyses(part_number);
"#;

const SELECT_COLUMNS: &str = "id, run_id, timestamp, image_path, part_number, manufacturer, \
     is_authentic, confidence, extracted_data, official_data, verification_data";

/// An analysis about to be stored
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub image_path: String,
    pub part_number: Option<String>,
    pub manufacturer: Option<String>,
    pub is_authentic: bool,
    /// Authenticity score scaled to 0.0 - 1.0
    pub confidence: f64,
    pub extracted_data: serde_json::Value,
    pub official_data: serde_json::Value,
    pub verification_data: serde_json::Value,
}

/// A stored analysis row
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub image_path: String,
    pub part_number: Option<String>,
    pub manufacturer: Option<String>,
    pub is_authentic: bool,
    pub confidence: f64,
    pub extracted_data: serde_json::Value,
    pub official_data: serde_json::Value,
    pub verification_data: serde_json::Value,
}

/// Aggregate figures over the whole log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisStats {
    pub total: u64,
    pub authentic: u64,
    pub not_authentic: u64,
    pub average_confidence: f64,
}

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        let db = Self { conn };
        db.init_schema()?;
        debug!("Opened analysis database at {:?}", path);
        Ok(db)
    }

    /// Open a throwaway in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to create analysis schema")?;
        Ok(())
    }

    /// Append an analysis, returning its id
    pub fn insert_analysis(&self, analysis: &NewAnalysis) -> Result<i64> {
        self.conn.execute(
            r#"INSERT INTO analyses (run_id, timestamp, image_path, part_number, manufacturer,
                   is_authentic, confidence, extracted_data, official_data, verification_data)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                analysis.run_id,
                analysis.timestamp.to_rfc3339(),
                analysis.image_path,
                analysis.part_number,
                analysis.manufacturer,
                analysis.is_authentic,
                analysis.confidence,
                analysis.extracted_data.to_string(),
                analysis.official_data.to_string(),
                analysis.verification_data.to_string(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Stored analysis {} as row {}", analysis.run_id, id);
        Ok(id)
    }

    /// Fetch one analysis by id
    pub fn get_analysis(&self, id: i64) -> Result<Option<AnalysisRecord>> {
        let sql = format!("SELECT {} FROM analyses WHERE id = ?1", SELECT_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, params![id], record_from_row)
            .optional()?;
        Ok(record)
    }

    /// Most recent analyses, newest first
    pub fn recent_analyses(&self, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let sql = format!(
            "SELECT {} FROM analyses ORDER BY id DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Analyses whose part number contains `part` (case-insensitive), newest first
    pub fn find_by_part(&self, part: &str, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let sql = format!(
            "SELECT {} FROM analyses WHERE UPPER(part_number) LIKE ?1 ORDER BY id DESC LIMIT ?2",
            SELECT_COLUMNS
        );
        let pattern = format!("%{}%", part.to_uppercase());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, limit as i64], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Totals across every stored analysis
    pub fn stats(&self) -> Result<AnalysisStats> {
        let stats = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_authentic), 0), COALESCE(AVG(confidence), 0.0) FROM analyses",
            [],
            |row| {
                let total: i64 = row.get(0)?;
                let authentic: i64 = row.get(1)?;
                let average_confidence: f64 = row.get(2)?;
                Ok(AnalysisStats {
                    total: total as u64,
                    authentic: authentic as u64,
                    not_authentic: (total - authentic) as u64,
                    average_confidence,
                })
            },
        )?;
        Ok(stats)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    let timestamp: String = row.get(2)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(AnalysisRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        timestamp,
        image_path: row.get(3)?,
        part_number: row.get(4)?,
        manufacturer: row.get(5)?,
        is_authentic: row.get(6)?,
        confidence: row.get(7)?,
        extracted_data: json_column(row, 8)?,
        official_data: json_column(row, 9)?,
        verification_data: json_column(row, 10)?,
    })
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(part: &str, authentic: bool, confidence: f64) -> NewAnalysis {
        NewAnalysis {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            image_path: format!("/photos/{}.jpg", part),
            part_number: Some(part.to_string()),
            manufacturer: Some("Texas Instruments".to_string()),
            is_authentic: authentic,
            confidence,
            extracted_data: json!({ "part_number": part }),
            official_data: serde_json::Value::Null,
            verification_data: json!({ "score": (confidence * 100.0) as u8 }),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_analysis(&sample("LM358N", true, 0.85)).unwrap();

        let record = db.get_analysis(id).unwrap().unwrap();
        assert_eq!(record.part_number.as_deref(), Some("LM358N"));
        assert!(record.is_authentic);
        assert!((record.confidence - 0.85).abs() < 1e-9);
        assert_eq!(record.extracted_data["part_number"], "LM358N");
        assert!(record.official_data.is_null());
    }

    #[test]
    fn test_get_missing_returns_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_analysis(42).unwrap().is_none());
    }

    #[test]
    fn test_ids_increase_and_recent_is_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let first = db.insert_analysis(&sample("NE555P", true, 0.9)).unwrap();
        let second = db.insert_analysis(&sample("ATMEGA328P", false, 0.3)).unwrap();
        assert!(second > first);

        let recent = db.recent_analyses(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second);

        let limited = db.recent_analyses(1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_find_by_part_is_case_insensitive() {
        let db = Database::open_in_memory().unwrap();
        db.insert_analysis(&sample("LM358N", true, 0.8)).unwrap();
        db.insert_analysis(&sample("NE555P", true, 0.8)).unwrap();

        let found = db.find_by_part("lm358", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].part_number.as_deref(), Some("LM358N"));
    }

    #[test]
    fn test_stats() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.stats().unwrap(), AnalysisStats::default());

        db.insert_analysis(&sample("LM358N", true, 0.8)).unwrap();
        db.insert_analysis(&sample("NE555P", false, 0.4)).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.authentic, 1);
        assert_eq!(stats.not_authentic, 1);
        assert!((stats.average_confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("analyses.db");

        {
            let db = Database::open(&path).unwrap();
            db.insert_analysis(&sample("LM7805", true, 0.7)).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().unwrap().total, 1);
    }
}
