//! Delimited text → row batches for `Table::write`.

use csv::ReaderBuilder;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{
    schema::{Row, Value},
    DatumError, Result,
};

#[derive(Debug, Clone, Copy)]
pub struct CsvOptions {
    pub delimiter: u8,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

/// Reads a headed CSV file. Keys are the lower-cased headers; every value is
/// text (typed later against the table's columns) and empty cells are null.
pub fn read_csv(path: &Path, options: CsvOptions) -> Result<Vec<Row>> {
    if !path.exists() {
        return Err(DatumError::Configuration(format!(
            "CSV file not found: {}",
            path.display()
        )));
    }
    read_csv_from(File::open(path)?, options)
}

pub fn read_csv_from<R: Read>(reader: R, options: CsvOptions) -> Result<Vec<Row>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(options.delimiter)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_lowercase())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (name.clone(), value)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}
