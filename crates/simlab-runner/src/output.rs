//! Per-run output readers.
//!
//! A run has produced output iff its backend's artifact exists in the run
//! directory. Both backends yield the same typed records in file order.

use crate::error::{Error, Result};
use crate::layout::RunId;
use crate::schema::{ColumnType, FieldValue, OutputRecord, OutputSchema, OUTPUT_TABLE};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CSV_ARTIFACT: &str = "output.csv";
pub const SQLITE_ARTIFACT: &str = "output.sqlite";

pub trait OutputReader {
    /// File name of the artifact inside a run directory.
    fn artifact_name(&self) -> &'static str;

    fn has_output(&self, run_dir: &Path) -> bool {
        run_dir.join(self.artifact_name()).is_file()
    }

    fn read(&self, run_id: RunId, run_dir: &Path, schema: OutputSchema)
        -> Result<Vec<OutputRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Csv,
    Sqlite,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Sqlite => "sqlite",
        }
    }

    pub fn reader(self) -> Box<dyn OutputReader> {
        match self {
            OutputFormat::Csv => Box::new(CsvOutput),
            OutputFormat::Sqlite => Box::new(SqliteOutput),
        }
    }
}

/// Delimited text with a header row naming the schema's source columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvOutput;

impl OutputReader for CsvOutput {
    fn artifact_name(&self) -> &'static str {
        CSV_ARTIFACT
    }

    fn read(
        &self,
        run_id: RunId,
        run_dir: &Path,
        schema: OutputSchema,
    ) -> Result<Vec<OutputRecord>> {
        let path = run_dir.join(CSV_ARTIFACT);
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)?;
        let columns = schema.columns();

        let headers = rdr.headers()?.clone();
        let expected: Vec<&str> = columns.iter().map(|c| c.source).collect();
        let found: Vec<&str> = headers.iter().map(str::trim).collect();
        if found != expected {
            return Err(Error::malformed(
                run_id,
                format!("{} line 1", path.display()),
                format!(
                    "header {:?} does not match {} columns {:?}",
                    found,
                    schema.as_str(),
                    expected
                ),
            ));
        }

        let mut records = Vec::new();
        for row in rdr.records() {
            let row = row?;
            let line = row.position().map(|p| p.line()).unwrap_or(0);
            if row.len() != columns.len() {
                return Err(Error::malformed(
                    run_id,
                    format!("{} line {}", path.display(), line),
                    format!("expected {} fields, found {}", columns.len(), row.len()),
                ));
            }
            let mut fields = Vec::with_capacity(columns.len());
            for (col, raw) in columns.iter().zip(row.iter()) {
                let value = FieldValue::parse(col.ty, raw).map_err(|msg| {
                    Error::malformed(
                        run_id,
                        format!("{} line {} column {}", path.display(), line, col.source),
                        msg,
                    )
                })?;
                fields.push(value);
            }
            records.push(OutputRecord { fields });
        }
        Ok(records)
    }
}

/// A small per-run SQLite database with an `output` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteOutput;

impl OutputReader for SqliteOutput {
    fn artifact_name(&self) -> &'static str {
        SQLITE_ARTIFACT
    }

    fn read(
        &self,
        run_id: RunId,
        run_dir: &Path,
        schema: OutputSchema,
    ) -> Result<Vec<OutputRecord>> {
        let path = run_dir.join(SQLITE_ARTIFACT);
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let columns = schema.columns();
        let mut stmt = conn.prepare(&schema.select_sql(OUTPUT_TABLE)).map_err(|e| {
            Error::malformed(
                run_id,
                path.display().to_string(),
                format!("cannot read {} table as {}: {}", OUTPUT_TABLE, schema.as_str(), e),
            )
        })?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        let mut index = 0usize;
        while let Some(row) = rows.next()? {
            index += 1;
            let mut fields = Vec::with_capacity(columns.len());
            for (i, col) in columns.iter().enumerate() {
                let value = field_from_sql(col.ty, row.get_ref(i)?).map_err(|msg| {
                    Error::malformed(
                        run_id,
                        format!("{} row {} column {}", path.display(), index, col.name),
                        msg,
                    )
                })?;
                fields.push(value);
            }
            records.push(OutputRecord { fields });
        }
        Ok(records)
    }
}

fn field_from_sql(ty: ColumnType, value: ValueRef<'_>) -> std::result::Result<FieldValue, String> {
    match (ty, value) {
        (_, ValueRef::Null) => Ok(FieldValue::Absent),
        (ColumnType::Integer, ValueRef::Integer(v)) => Ok(FieldValue::Integer(v)),
        (ColumnType::Real, ValueRef::Integer(v)) => Ok(FieldValue::Real(v as f64)),
        (ColumnType::Real, ValueRef::Real(v)) => Ok(FieldValue::Real(v)),
        (ColumnType::Integer, ValueRef::Real(v)) => Err(format!("expected integer, found {}", v)),
        (_, ValueRef::Text(bytes)) => {
            let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
            FieldValue::parse(ty, text)
        }
        (_, ValueRef::Blob(_)) => Err("expected number, found blob".to_string()),
    }
}
