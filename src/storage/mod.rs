//! Storage Layer
//!
//! Handles persistence of analysis records using SQLite.

pub mod database;

pub use database::{AnalysisRecord, AnalysisStats, Database, NewAnalysis};

use anyhow::Result;
use std::path::PathBuf;

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "chipmark", "chipmark")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Default database location inside the data directory
pub fn default_database_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("analyses.db"))
}
