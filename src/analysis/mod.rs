//! Marking analysis module
//!
//! Turns raw OCR readings into a scored marking: fusion, confusion
//! correction, field parsing and authenticity scoring.

pub mod correction;
pub mod families;
pub mod fusion;
pub mod parser;
pub mod rules;
pub mod scoring;

pub use fusion::{fuse_readings, FusedText};
pub use parser::{parse_marking, MarkingInfo};
pub use rules::RulesEngine;
pub use scoring::{score_marking, AuthenticityReport, Verdict};
