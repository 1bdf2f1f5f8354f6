//! Identifier extraction from operator-supplied files.
//!
//! The file only has to carry a column whose header names the UDISE code;
//! every other column is ignored.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

/// Normalized header names accepted without fuzzy matching.
const EXACT_HEADERS: &[&str] = &[
    "udisecode",
    "schooludisecode",
    "udisecolcode",
    "udiseschcode",
    "schoolcode",
];

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self::new(name, std::fs::read(path)?))
    }

    fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum SourceFileError {
    #[error("unsupported file type '{0}'; upload CSV, TSV, TXT, JSON or a spreadsheet")]
    UnsupportedType(String),
    #[error("could not find a UDISE code column; add a header like 'UDISE_CODE'")]
    MissingIdentifierColumn,
    #[error("no valid UDISE codes found")]
    Empty,
    #[error("invalid JSON file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse delimited file: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to read spreadsheet: {0}")]
    Spreadsheet(#[from] calamine::Error),
}

fn normalize_header(header: &str) -> String {
    header
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// Picks the identifier column: exact known header first, else any header
/// containing both `udise` and `code`.
pub fn find_identifier_column<'a>(headers: impl IntoIterator<Item = &'a str>) -> Option<usize> {
    let normalized = headers
        .into_iter()
        .map(normalize_header)
        .collect::<Vec<_>>();
    normalized
        .iter()
        .position(|h| EXACT_HEADERS.contains(&h.as_str()))
        .or_else(|| {
            normalized
                .iter()
                .position(|h| h.contains("udise") && h.contains("code"))
        })
}

/// Extracts a deduplicated, order-preserving identifier list from `file`.
pub fn parse_identifiers(file: &SourceFile) -> Result<Vec<String>, SourceFileError> {
    let raw = match file.extension().as_str() {
        "json" => identifiers_from_json(&file.bytes)?,
        "csv" | "txt" => identifiers_from_delimited(&file.bytes, sniff_delimiter(&file.bytes))?,
        "tsv" => identifiers_from_delimited(&file.bytes, b'\t')?,
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => identifiers_from_workbook(&file.bytes)?,
        other => return Err(SourceFileError::UnsupportedType(other.to_string())),
    };

    let mut seen = HashSet::new();
    let codes = raw
        .into_iter()
        .map(|code| code.trim().to_string())
        .filter(|code| !code.is_empty())
        .filter(|code| seen.insert(code.clone()))
        .collect::<Vec<_>>();

    if codes.is_empty() {
        return Err(SourceFileError::Empty);
    }
    debug!(file = %file.name, count = codes.len(), "identifiers extracted");
    Ok(codes)
}

fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let tabs = first_line.iter().filter(|b| **b == b'\t').count();
    let commas = first_line.iter().filter(|b| **b == b',').count();
    let semicolons = first_line.iter().filter(|b| **b == b';').count();
    if tabs > commas && tabs >= semicolons {
        b'\t'
    } else if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn identifiers_from_delimited(bytes: &[u8], delimiter: u8) -> Result<Vec<String>, SourceFileError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(SourceFileError::Empty);
    }
    let column =
        find_identifier_column(headers.iter()).ok_or(SourceFileError::MissingIdentifierColumn)?;
    debug!(header = headers.get(column).unwrap_or_default(), "identifier column");

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(value) = record.get(column) {
            out.push(value.to_string());
        }
    }
    Ok(out)
}

/// First worksheet only; its first row is the header row.
fn identifiers_from_workbook(bytes: &[u8]) -> Result<Vec<String>, SourceFileError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;
    let Some(range) = workbook.worksheet_range_at(0) else {
        return Err(SourceFileError::Empty);
    };
    let range = range?;
    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Err(SourceFileError::Empty);
    };

    let headers = header_row.iter().map(cell_text).collect::<Vec<_>>();
    let column = find_identifier_column(headers.iter().map(String::as_str))
        .ok_or(SourceFileError::MissingIdentifierColumn)?;
    debug!(header = %headers[column], "identifier column");

    Ok(rows
        .filter_map(|row| row.get(column).map(cell_text))
        .collect())
}

/// Whole-number floats print without a fraction so numeric codes survive.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

fn identifiers_from_json(bytes: &[u8]) -> Result<Vec<String>, SourceFileError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let rows = match value {
        JsonValue::Array(rows) => rows,
        other => vec![other],
    };
    let Some(first) = rows.first().and_then(JsonValue::as_object) else {
        return Err(SourceFileError::Empty);
    };

    let keys = first.keys().map(String::as_str).collect::<Vec<_>>();
    let column = find_identifier_column(keys.iter().copied())
        .ok_or(SourceFileError::MissingIdentifierColumn)?;
    let key = keys[column].to_string();

    Ok(rows
        .iter()
        .filter_map(|row| match row.get(&key)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}
