//! Marking field extraction
//!
//! Pulls part number, manufacturer, date code and lot code out of the
//! fused text lines printed on a package.

use chrono::Datelike;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::correction::{correct_date_code, correct_line};
use super::families::{canonical_manufacturer, family_of, infer_manufacturer, MANUFACTURER_ALIASES};

static GENERIC_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Z]{1,6}\d{2,}[A-Z0-9\-/]*|\d{1,2}[A-Z]{1,4}\d{2,}[A-Z0-9\-]*)$")
        .expect("generic part pattern")
});

static DATE_CODE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:DC|D/C)([A-Z0-9]{4,5})$").expect("date code prefix pattern"));

/// Tokens that announce a date code in the following token
const DATE_CODE_MARKERS: &[&str] = &["DC", "D/C", "DATE"];

/// Where the manufacturer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManufacturerSource {
    /// Name or logo text printed on the package
    Explicit,
    /// Derived from the part number prefix
    Inferred,
}

/// Manufacturing date code (YYWW)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateCode {
    /// Code as printed, after correction
    pub raw: String,
    pub year: i32,
    pub week: u32,
}

impl DateCode {
    /// Interpret a corrected `YYWW` code (optionally with a letter suffix)
    ///
    /// Two-digit years up to next year resolve to this century, older
    /// ones to the 1900s back to 1970; anything else is a future year.
    pub fn from_code(code: &str, current_year: i32) -> Option<Self> {
        let digits = code.get(..4)?;
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let yy: i32 = digits[..2].parse().ok()?;
        let week: u32 = digits[2..].parse().ok()?;
        if !(1..=53).contains(&week) {
            return None;
        }

        let current_yy = current_year.rem_euclid(100);
        let century = current_year - current_yy;
        let year = if yy <= current_yy + 1 {
            century + yy
        } else if century - 100 + yy >= 1970 {
            century - 100 + yy
        } else {
            century + yy
        };

        Some(Self {
            raw: code.to_string(),
            year,
            week,
        })
    }
}

/// Fields extracted from a package marking
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkingInfo {
    pub part_number: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_source: Option<ManufacturerSource>,
    pub date_code: Option<DateCode>,
    pub lot_code: Option<String>,
    /// Corrected lines the fields were taken from
    pub lines: Vec<String>,
}

struct Token {
    text: String,
    position: usize,
}

/// Parse marking lines using the current calendar year
pub fn parse_marking(lines: &[String]) -> MarkingInfo {
    parse_marking_at(lines, chrono::Utc::now().year())
}

/// Parse marking lines, resolving two-digit years against `current_year`
pub fn parse_marking_at(lines: &[String], current_year: i32) -> MarkingInfo {
    let lines: Vec<String> = lines
        .iter()
        .map(|l| correct_line(l))
        .filter(|l| !l.is_empty())
        .collect();

    // Explicit manufacturer text, and the words it used up
    let mut manufacturer = None;
    let mut manufacturer_words: HashSet<&str> = HashSet::new();
    for line in &lines {
        let padded = format!(" {} ", line);
        for (alias, _) in MANUFACTURER_ALIASES {
            if padded.contains(&format!(" {} ", alias)) {
                manufacturer_words.extend(alias.split(' '));
            }
        }
        if manufacturer.is_none() {
            manufacturer = canonical_manufacturer(line);
        }
    }

    let tokens: Vec<Token> = lines
        .iter()
        .flat_map(|l| l.split(' '))
        .map(|t| t.trim_matches(|c| matches!(c, '-' | '.' | '/')).to_string())
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(position, text)| Token { text, position })
        .collect();

    let date_code = find_date_code(&tokens, current_year);
    let date_position = date_code.as_ref().map(|(position, _)| *position);
    let date_code = date_code.map(|(_, code)| code);

    let is_free = |t: &Token| {
        Some(t.position) != date_position
            && !manufacturer_words.contains(t.text.as_str())
            && !DATE_CODE_MARKERS.contains(&t.text.as_str())
    };

    let part = find_part_number(tokens.iter().filter(|t| is_free(*t)));
    let part_position = part.as_ref().map(|t| t.position);
    let part_number = part.map(|t| t.text.clone());

    let lot_code = tokens
        .iter()
        .filter(|t| is_free(*t) && Some(t.position) != part_position)
        .find(|t| {
            t.text.len() >= 5
                && t.text.chars().any(|c| c.is_ascii_digit())
                && t.text.chars().any(|c| c.is_ascii_alphabetic())
        })
        .map(|t| t.text.clone());

    let (manufacturer, manufacturer_source) = match manufacturer {
        Some(m) => (Some(m.to_string()), Some(ManufacturerSource::Explicit)),
        None => match part_number.as_deref().and_then(infer_manufacturer) {
            Some(m) => (Some(m.to_string()), Some(ManufacturerSource::Inferred)),
            None => (None, None),
        },
    };

    MarkingInfo {
        part_number,
        manufacturer,
        manufacturer_source,
        date_code,
        lot_code,
        lines,
    }
}

/// Date code token: announced ones (`DC 2231`, `DC2231`) first, else the first valid one
fn find_date_code(tokens: &[Token], current_year: i32) -> Option<(usize, DateCode)> {
    let parse = |text: &str| correct_date_code(text).and_then(|code| DateCode::from_code(&code, current_year));

    for (i, token) in tokens.iter().enumerate() {
        if let Some(caps) = DATE_CODE_PREFIX.captures(&token.text) {
            if let Some(code) = parse(&caps[1]) {
                return Some((token.position, code));
            }
        }
        if DATE_CODE_MARKERS.contains(&token.text.as_str()) {
            if let Some(next) = tokens.get(i + 1) {
                if let Some(code) = parse(&next.text) {
                    return Some((next.position, code));
                }
            }
        }
    }

    tokens
        .iter()
        .filter(|t| t.text.chars().filter(|c| c.is_ascii_digit()).count() >= 3)
        .find_map(|t| parse(&t.text).map(|code| (t.position, code)))
}

/// Best part number candidate: known families beat the generic pattern
fn find_part_number<'a>(tokens: impl Iterator<Item = &'a Token>) -> Option<&'a Token> {
    let mut best: Option<((u8, usize), &Token)> = None;

    for token in tokens {
        let has_digit = token.text.chars().any(|c| c.is_ascii_digit());
        let rank = match family_of(&token.text) {
            Some((prefix, _)) if has_digit && token.text.len() > prefix.len() => (2, prefix.len()),
            _ if token.text.len() >= 4 && GENERIC_PART.is_match(&token.text) => (1, 0),
            _ => continue,
        };
        if best.as_ref().map_or(true, |(r, _)| rank > *r) {
            best = Some((rank, token));
        }
    }

    best.map(|(_, token)| token)
}
