//! Row codec shared by every store backend
//!
//! One record per comma-separated line, fields in schema order, no header.

use vialstat_common::{Record, SelectionParams, StoreError, VialId};

/// Encode a record as one CSV line (without the line terminator)
pub fn encode_row<R: Record>(record: &R) -> Result<String, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .serialize(record)
        .map_err(|e| StoreError::Encoding(e.to_string()))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::Encoding(e.to_string()))?;
    let line = String::from_utf8(bytes).map_err(|e| StoreError::Encoding(e.to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Decode one CSV line into a record of type `R`
pub fn decode_row<R: Record>(vial: VialId, line: &str) -> Result<R, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    match reader.deserialize::<R>().next() {
        Some(Ok(record)) => Ok(record),
        Some(Err(e)) => Err(StoreError::Malformed {
            log: R::KIND.suffix(),
            vial,
            reason: e.to_string(),
        }),
        None => Err(StoreError::Malformed {
            log: R::KIND.suffix(),
            vial,
            reason: "empty row".to_string(),
        }),
    }
}

/// Whether a line is a header or label line rather than a data row.
///
/// Data rows always start with a numeric time.
pub fn is_header_line(line: &str) -> bool {
    let first = line.split(',').next().unwrap_or_default().trim();
    first.parse::<f64>().is_err()
}

/// Decode a header-labeled selection-control table; the newest row wins
pub fn decode_selection_params(
    vial: VialId,
    text: &str,
) -> Result<Option<SelectionParams>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut newest = None;
    for row in reader.deserialize::<SelectionParams>() {
        let params = row.map_err(|e| StoreError::Malformed {
            log: crate::SELECTION_CONTROL_DIR,
            vial,
            reason: e.to_string(),
        })?;
        newest = Some(params);
    }
    Ok(newest)
}

/// Encode selection parameters as a labeled table (header plus one row)
pub fn encode_selection_params(params: &SelectionParams) -> Result<String, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());
    writer
        .serialize(params)
        .map_err(|e| StoreError::Encoding(e.to_string()))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::Encoding(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Encoding(e.to_string()))
}

/// Decode the newest line of a selection-steps file
pub fn decode_steps(vial: VialId, text: &str) -> Result<Option<Vec<f64>>, StoreError> {
    let Some(line) = text.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok(None);
    };

    line.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| {
            field.parse::<f64>().map_err(|e| StoreError::Malformed {
                log: crate::SELECTION_STEPS_DIR,
                vial,
                reason: format!("step {field:?}: {e}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
