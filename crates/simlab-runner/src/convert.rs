//! Converts a run's delimited output into a per-run SQLite store.

use crate::error::{Error, Result};
use crate::fsutil::{commit_staged, staging_path};
use crate::layout::{RunId, RunLayout};
use crate::output::{CsvOutput, OutputReader, SqliteOutput, SQLITE_ARTIFACT};
use crate::schema::{quote_ident, OutputSchema, OUTPUT_TABLE};
use rusqlite::types::ToSql;
use rusqlite::Connection;
use serde::Serialize;
use std::fs;
use tracing::info;

pub const TIME_INDEX: &str = "output_time_index";

#[derive(Debug, Clone, Serialize)]
pub struct ConvertedRun {
    pub run_id: RunId,
    pub rows: usize,
}

/// Reads `output.csv` of one run and writes `output.sqlite` next to it,
/// indexed on `time`. The store is built under a staging name and renamed
/// into place last, so a half-written store never counts as output.
pub fn convert_run_output(
    layout: &RunLayout,
    run_id: RunId,
    schema: OutputSchema,
) -> Result<ConvertedRun> {
    let run_dir = layout.run_dir(run_id);
    let dest = run_dir.join(SQLITE_ARTIFACT);
    if dest.exists() {
        return Err(Error::precondition(format!(
            "{} already exists",
            dest.display()
        )));
    }
    let records = CsvOutput.read(run_id, &run_dir, schema)?;

    let tmp = staging_path(&dest);
    let written = (|| -> Result<()> {
        let mut conn = Connection::open(&tmp)?;
        let tx = conn.transaction()?;
        tx.execute(&schema.create_table_sql(OUTPUT_TABLE), [])?;
        {
            let mut stmt = tx.prepare(&schema.insert_sql(OUTPUT_TABLE, false))?;
            for record in &records {
                let values: Vec<&dyn ToSql> =
                    record.fields.iter().map(|f| f as &dyn ToSql).collect();
                stmt.execute(values.as_slice())?;
            }
        }
        tx.execute(
            &format!(
                "CREATE INDEX {} ON {} (\"time\")",
                quote_ident(TIME_INDEX),
                quote_ident(OUTPUT_TABLE)
            ),
            [],
        )?;
        tx.commit()?;
        Ok(())
    })();
    if let Err(e) = written.and_then(|()| commit_staged(&tmp, &dest)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    info!(run_id, rows = records.len(), "converted run output");
    Ok(ConvertedRun {
        run_id,
        rows: records.len(),
    })
}

/// Converts every run that has delimited output but no store yet.
pub fn convert_all(layout: &RunLayout, schema: OutputSchema) -> Result<Vec<ConvertedRun>> {
    let mut converted = Vec::new();
    for run_id in layout.list_run_ids()? {
        let run_dir = layout.run_dir(run_id);
        if CsvOutput.has_output(&run_dir) && !SqliteOutput.has_output(&run_dir) {
            converted.push(convert_run_output(layout, run_id, schema)?);
        }
    }
    Ok(converted)
}
