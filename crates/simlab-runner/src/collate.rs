//! Merges every finished run's output into one aggregate store.

use crate::error::{Error, Result};
use crate::layout::{RunId, RunLayout};
use crate::output::OutputReader;
use crate::schema::{quote_ident, OutputSchema, OUTPUT_TABLE, RUN_ID_COLUMN};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const RUN_ID_INDEX: &str = "output_run_id_index";

#[derive(Debug, Clone, Serialize)]
pub struct RunRows {
    pub run_id: RunId,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollationSummary {
    pub destination: PathBuf,
    pub schema: OutputSchema,
    pub runs: Vec<RunRows>,
    pub total_rows: usize,
}

/// Run ids under the layout root whose output artifact exists, ascending.
pub fn runs_with_output(layout: &RunLayout, reader: &dyn OutputReader) -> Result<Vec<RunId>> {
    Ok(layout
        .list_run_ids()?
        .into_iter()
        .filter(|id| reader.has_output(&layout.run_dir(*id)))
        .collect())
}

/// Collates every run with output into the `output` table of `destination`.
///
/// The destination must not already hold an `output` table; collation is not
/// idempotent and refuses rather than duplicate rows. Each run's rows are
/// committed in their own transaction, so an abort leaves every earlier run
/// complete and the failing run absent. The run id index is built once, after
/// the bulk load.
pub fn collate(
    layout: &RunLayout,
    destination: &Path,
    reader: &dyn OutputReader,
    schema: OutputSchema,
) -> Result<CollationSummary> {
    let run_ids = runs_with_output(layout, reader)?;
    info!(
        root = %layout.root().display(),
        runs = run_ids.len(),
        format = reader.artifact_name(),
        "starting collation"
    );

    let mut conn = Connection::open(destination)?;
    if table_exists(&conn, OUTPUT_TABLE)? {
        return Err(Error::precondition(format!(
            "{} already contains an {} table; delete it before collating again",
            destination.display(),
            OUTPUT_TABLE
        )));
    }
    conn.execute(&schema.create_aggregate_table_sql(OUTPUT_TABLE), [])?;

    let insert_sql = schema.insert_sql(OUTPUT_TABLE, true);
    let mut runs = Vec::with_capacity(run_ids.len());
    let mut total_rows = 0usize;
    for run_id in run_ids {
        info!(run_id, "processing run");
        let records = reader.read(run_id, &layout.run_dir(run_id), schema)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&insert_sql)?;
            for record in &records {
                let mut values: Vec<&dyn ToSql> = Vec::with_capacity(record.fields.len() + 1);
                values.push(&run_id);
                values.extend(record.fields.iter().map(|f| f as &dyn ToSql));
                stmt.execute(values.as_slice())?;
            }
        }
        tx.commit()?;
        total_rows += records.len();
        runs.push(RunRows {
            run_id,
            rows: records.len(),
        });
    }

    conn.execute_batch(&format!(
        "CREATE INDEX {} ON {} ({});",
        quote_ident(RUN_ID_INDEX),
        quote_ident(OUTPUT_TABLE),
        quote_ident(RUN_ID_COLUMN)
    ))?;
    info!(runs = runs.len(), rows = total_rows, "collation complete");

    Ok(CollationSummary {
        destination: destination.to_path_buf(),
        schema,
        runs,
        total_rows,
    })
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{CsvOutput, SqliteOutput, CSV_ARTIFACT, SQLITE_ARTIFACT};
    use std::fs;

    const HEADER: &str = "time,row,col,P,beta\n";

    fn write_run(root: &Path, run_id: RunId, body: &str) {
        let dir = root.join(run_id.to_string());
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(CSV_ARTIFACT), format!("{}{}", HEADER, body)).expect("write");
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).expect("count")
    }

    #[test]
    fn aggregate_is_union_of_tagged_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("runs");
        write_run(&root, 3, "0.0,0,0,1,0.1\n1.0,0,0,0,\n");
        write_run(&root, 1, "0.0,1,1,1,0.2\n");
        write_run(&root, 12, "0.0,2,2,1,0.3\n0.5,2,2,0,\n2.5,2,2,1,0.4\n");
        fs::create_dir_all(root.join("4")).expect("run without output");
        fs::create_dir_all(root.join("scratch")).expect("non-run dir");

        let dest = dir.path().join("db.sqlite");
        let summary = collate(
            &RunLayout::new(&root),
            &dest,
            &CsvOutput,
            OutputSchema::StateChanges,
        )
        .expect("collate");

        let ids: Vec<RunId> = summary.runs.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![1, 3, 12]);
        assert_eq!(summary.total_rows, 6);

        let conn = Connection::open(&dest).expect("open");
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output"), 6);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output WHERE run_id = 12"), 3);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output WHERE run_id = 4"), 0);
        assert_eq!(
            count(
                &conn,
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'output_run_id_index'"
            ),
            1
        );
        let beta: Option<f64> = conn
            .query_row(
                "SELECT beta FROM output WHERE run_id = 3 AND time = 1.0",
                [],
                |row| row.get(0),
            )
            .expect("row");
        assert_eq!(beta, None);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_run_directory_is_collated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("runs");
        write_run(&root, 1, "0.0,1,1,1,0.2\n");
        write_run(dir.path(), 77, "0.0,2,2,1,0.3\n");
        std::os::unix::fs::symlink(dir.path().join("77"), root.join("7")).expect("link");

        let dest = dir.path().join("db.sqlite");
        let summary = collate(
            &RunLayout::new(&root),
            &dest,
            &CsvOutput,
            OutputSchema::StateChanges,
        )
        .expect("collate");
        let ids: Vec<RunId> = summary.runs.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![1, 7]);
        assert_eq!(summary.total_rows, 2);
        let conn = Connection::open(&dest).expect("open");
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output WHERE run_id = 7"), 1);
    }

    #[test]
    fn existing_aggregate_table_is_left_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("runs");
        write_run(&root, 1, "0.0,1,1,1,0.2\n");
        let dest = dir.path().join("db.sqlite");
        let layout = RunLayout::new(&root);
        collate(&layout, &dest, &CsvOutput, OutputSchema::StateChanges).expect("first");

        write_run(&root, 2, "0.0,1,1,1,0.2\n");
        let err = collate(&layout, &dest, &CsvOutput, OutputSchema::StateChanges)
            .expect_err("second collation must refuse");
        assert_eq!(err.code(), "precondition_violation");

        let conn = Connection::open(&dest).expect("open");
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output WHERE run_id = 2"), 0);
    }

    #[test]
    fn malformed_run_aborts_and_leaves_earlier_runs_whole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("runs");
        write_run(&root, 1, "0.0,1,1,1,0.2\n1.0,1,1,1,0.3\n");
        write_run(&root, 2, "0.0,1,1,1,0.2\n1.0,1,1,oops,0.3\n");
        write_run(&root, 3, "0.0,1,1,1,0.2\n");
        let dest = dir.path().join("db.sqlite");
        let err = collate(
            &RunLayout::new(&root),
            &dest,
            &CsvOutput,
            OutputSchema::StateChanges,
        )
        .expect_err("must abort");
        assert_eq!(err.code(), "malformed_record");

        let conn = Connection::open(&dest).expect("open");
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output WHERE run_id = 1"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output WHERE run_id = 2"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM output WHERE run_id = 3"), 0);
    }

    #[test]
    fn sqlite_backend_collates_per_run_stores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("runs");
        for run_id in [5, 6] {
            let run_dir = root.join(run_id.to_string());
            fs::create_dir_all(&run_dir).expect("mkdir");
            let conn = Connection::open(run_dir.join(SQLITE_ARTIFACT)).expect("open");
            conn.execute_batch(&OutputSchema::StateChanges.create_table_sql("output"))
                .expect("create");
            conn.execute(
                "INSERT INTO output VALUES (?1, 0, 0, 1, NULL)",
                params![run_id as f64],
            )
            .expect("insert");
        }
        let dest = dir.path().join("aggregate.sqlite");
        let summary = collate(
            &RunLayout::new(&root),
            &dest,
            &SqliteOutput,
            OutputSchema::StateChanges,
        )
        .expect("collate");
        assert_eq!(summary.total_rows, 2);
        let conn = Connection::open(&dest).expect("open");
        let time: f64 = conn
            .query_row("SELECT time FROM output WHERE run_id = 6", [], |row| row.get(0))
            .expect("row");
        assert_eq!(time, 6.0);
    }
}
