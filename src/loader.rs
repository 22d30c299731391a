//! Loading of the unified feed from delimited text or JSON lines.

use crate::error::RelayError;
use crate::models::UnifiedRecord;

use std::io::{BufRead, Read};

/// Read a delimited file with a header row.
///
/// Fails on the first malformed row.
///
/// # Arguments
///
/// * `reader`: Source of the delimited text
/// * `delimiter`: Field separator, `b';'` for the published dataset
pub fn read_csv<R: Read>(reader: R, delimiter: u8) -> Result<Vec<UnifiedRecord>, RelayError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(reader);
    let records = csv_reader
        .deserialize::<UnifiedRecord>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Read line-delimited JSON.
///
/// Blank lines are ignored. Lines that are not a valid record are logged and skipped; only I/O
/// errors abort the load.
pub fn read_json_lines<R: BufRead>(reader: R) -> Result<Vec<UnifiedRecord>, RelayError> {
    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<UnifiedRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                skipped += 1;
                tracing::warn!("Skipping malformed JSON line {}: {}", index + 1, err);
            }
        }
    }
    if skipped > 0 {
        tracing::warn!("Skipped {} malformed JSON lines", skipped);
    }
    Ok(records)
}
