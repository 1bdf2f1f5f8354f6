//! CSV export of flat records.

use std::io::Write;

use csv::{QuoteStyle, Terminator, WriterBuilder};
use indexmap::IndexSet;
use udise_core::FlatRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeaderMode {
    /// Columns are the first record's keys; extra keys elsewhere are dropped.
    #[default]
    FirstRecord,
    /// Columns are every key seen, in first-seen order.
    Union,
}

pub fn header_for(records: &[FlatRecord], mode: HeaderMode) -> Vec<String> {
    match mode {
        HeaderMode::FirstRecord => records
            .first()
            .map(|r| r.keys().map(str::to_string).collect())
            .unwrap_or_default(),
        HeaderMode::Union => {
            let mut columns = IndexSet::new();
            for record in records {
                for key in record.keys() {
                    if !columns.contains(key) {
                        columns.insert(key.to_string());
                    }
                }
            }
            columns.into_iter().collect()
        }
    }
}

/// Header row as-is, then one fully quoted row per record. Missing columns
/// and nulls become empty cells. No records writes nothing.
pub fn write_csv<W: Write>(
    records: &[FlatRecord],
    mode: HeaderMode,
    writer: W,
) -> Result<W, csv::Error> {
    let header = header_for(records, mode);
    if header.is_empty() {
        return Ok(writer);
    }

    let mut head = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(writer);
    head.write_record(&header)?;
    let writer = head.into_inner().map_err(|e| e.into_error())?;

    let mut rows = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(writer);
    for record in records {
        rows.write_record(header.iter().map(|column| {
            record
                .get(column)
                .map(|value| value.to_cell())
                .unwrap_or_default()
        }))?;
    }
    Ok(rows.into_inner().map_err(|e| e.into_error())?)
}

pub fn to_csv_string(records: &[FlatRecord], mode: HeaderMode) -> Result<String, csv::Error> {
    let bytes = write_csv(records, mode, Vec::new())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
