use crate::error::{Error, Result};
use crate::layout::RunId;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::path::Path;

pub const RUNS_TABLE: &str = "runs";

/// The run registry: every scheduled run id and its current random seed.
/// Other per-run scheduling columns may exist and are left alone.
#[derive(Debug)]
pub struct Registry {
    conn: Connection,
}

impl Registry {
    /// Opens an existing registry. A missing file is a precondition
    /// violation rather than an empty registry.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::precondition(format!(
                "run registry {} does not exist",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        let registry = Self { conn };
        if !registry.has_runs_table()? {
            return Err(Error::precondition(format!(
                "run registry {} has no {} table",
                path.display(),
                RUNS_TABLE
            )));
        }
        Ok(registry)
    }

    pub fn open_or_create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id INTEGER PRIMARY KEY,
                randomSeed INTEGER
            );",
        )?;
        Ok(Self { conn })
    }

    fn has_runs_table(&self) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![RUNS_TABLE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn run_ids(&self) -> Result<Vec<RunId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_id FROM runs ORDER BY run_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, RunId>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn contains(&self, run_id: RunId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Current seed of a registered run; `None` when the run is registered
    /// without a seed. Unknown runs are an error.
    pub fn seed(&self, run_id: RunId) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT randomSeed FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .ok_or_else(|| Error::precondition(format!("run {} is not registered", run_id)))
    }

    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }
}

pub(crate) fn insert_run(tx: &Transaction<'_>, run_id: RunId, seed: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO runs (run_id, randomSeed) VALUES (?1, ?2)",
        params![run_id, seed],
    )?;
    Ok(())
}

pub(crate) fn update_seed(tx: &Transaction<'_>, run_id: RunId, seed: i64) -> Result<()> {
    let changed = tx.execute(
        "UPDATE runs SET randomSeed = ?1 WHERE run_id = ?2",
        params![seed, run_id],
    )?;
    if changed != 1 {
        return Err(Error::precondition(format!(
            "run {} is not registered",
            run_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_existing_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Registry::open(&dir.path().join("db.sqlite")).expect_err("missing");
        assert_eq!(err.code(), "precondition_violation");
    }

    #[test]
    fn seeds_round_trip_through_transactions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.sqlite");
        let mut reg = Registry::open_or_create(&path).expect("create");
        {
            let tx = reg.transaction().expect("tx");
            insert_run(&tx, 3, 11).expect("insert");
            insert_run(&tx, 1, 10).expect("insert");
            tx.commit().expect("commit");
        }
        let mut reg = Registry::open(&path).expect("reopen");
        assert_eq!(reg.run_ids().expect("ids"), vec![1, 3]);
        assert_eq!(reg.seed(3).expect("seed"), Some(11));
        {
            let tx = reg.transaction().expect("tx");
            update_seed(&tx, 3, 42).expect("update");
            // dropped without commit
        }
        assert_eq!(reg.seed(3).expect("seed"), Some(11));
        let tx = reg.transaction().expect("tx");
        assert!(update_seed(&tx, 9, 1).is_err());
    }

    #[test]
    fn registry_with_extra_columns_is_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.sqlite");
        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(
            "CREATE TABLE runs (run_id INTEGER PRIMARY KEY, randomSeed INTEGER, beta0 REAL);
             INSERT INTO runs VALUES (4, 99, 0.1);",
        )
        .expect("seed");
        drop(conn);
        let reg = Registry::open(&path).expect("open");
        assert!(reg.contains(4).expect("contains"));
        assert_eq!(reg.seed(4).expect("seed"), Some(99));
        assert!(reg.seed(5).is_err());
    }
}
