//! Fixed column sets produced by the simulation and agreed with the reader.

use rusqlite::types::{Null, ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Column name in every relational store.
    pub name: &'static str,
    /// Header name in the delimited output file.
    pub source: &'static str,
    pub ty: ColumnType,
}

const fn int(name: &'static str) -> Column {
    Column {
        name,
        source: name,
        ty: ColumnType::Integer,
    }
}

const fn real(name: &'static str) -> Column {
    Column {
        name,
        source: name,
        ty: ColumnType::Real,
    }
}

const fn renamed(name: &'static str, source: &'static str) -> Column {
    Column {
        name,
        source,
        ty: ColumnType::Real,
    }
}

const TIMESERIES: &[Column] = &[
    real("time"),
    int("H"),
    real("H_lifetime_avg"),
    int("A"),
    real("A_lifetime_avg"),
    int("F"),
    real("F_lifetime_avg"),
    int("D"),
    real("D_lifetime_avg"),
    renamed("beta_mean", "betaMean"),
    renamed("beta_sd", "betaSD"),
    renamed("beta_min", "betaMin"),
    renamed("beta_max", "betaMax"),
    renamed("beta_025", "beta025"),
    renamed("beta_050", "beta050"),
    renamed("beta_100", "beta100"),
    renamed("beta_250", "beta250"),
    renamed("beta_500", "beta500"),
    renamed("beta_750", "beta750"),
    renamed("beta_900", "beta900"),
    renamed("beta_950", "beta950"),
    renamed("beta_975", "beta975"),
];

const STATE_CHANGES: &[Column] = &[
    real("time"),
    int("row"),
    int("col"),
    int("P"),
    real("beta"),
];

pub const OUTPUT_TABLE: &str = "output";
pub const RUN_ID_COLUMN: &str = "run_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSchema {
    /// Periodic population counts, lifetimes and beta quantiles.
    Timeseries,
    /// One row per site whose state changed.
    StateChanges,
}

impl OutputSchema {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputSchema::Timeseries => "timeseries",
            OutputSchema::StateChanges => "state_changes",
        }
    }

    pub fn columns(self) -> &'static [Column] {
        match self {
            OutputSchema::Timeseries => TIMESERIES,
            OutputSchema::StateChanges => STATE_CHANGES,
        }
    }

    fn column_defs(self) -> Vec<String> {
        self.columns()
            .iter()
            .map(|c| format!("{} {}", quote_ident(c.name), c.ty.sql()))
            .collect()
    }

    /// `CREATE TABLE` for a per-run store.
    pub fn create_table_sql(self, table: &str) -> String {
        format!(
            "CREATE TABLE {} ({})",
            quote_ident(table),
            self.column_defs().join(", ")
        )
    }

    /// `CREATE TABLE` for the aggregate store: the run id, then the schema.
    pub fn create_aggregate_table_sql(self, table: &str) -> String {
        let mut defs = vec![format!("{} INTEGER", quote_ident(RUN_ID_COLUMN))];
        defs.extend(self.column_defs());
        format!("CREATE TABLE {} ({})", quote_ident(table), defs.join(", "))
    }

    pub fn insert_sql(self, table: &str, with_run_id: bool) -> String {
        let n = self.columns().len() + usize::from(with_run_id);
        let placeholders = (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>();
        format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(table),
            placeholders.join(", ")
        )
    }

    pub fn select_sql(self, table: &str) -> String {
        let names = self
            .columns()
            .iter()
            .map(|c| quote_ident(c.name))
            .collect::<Vec<_>>();
        format!(
            "SELECT {} FROM {} ORDER BY rowid",
            names.join(", "),
            quote_ident(table)
        )
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One parsed field. `Absent` is "not measured" and is stored as NULL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
    Absent,
}

impl FieldValue {
    /// Parses one textual field as `ty`. Empty text is `Absent`; anything
    /// else that is not a number of the declared type is an error, including
    /// whitespace-only text. Whitespace around a number is tolerated.
    pub fn parse(ty: ColumnType, raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Ok(FieldValue::Absent);
        }
        let text = raw.trim();
        match ty {
            ColumnType::Integer => text
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| format!("expected integer, found {:?}", raw)),
            ColumnType::Real => text
                .parse::<f64>()
                .map(FieldValue::Real)
                .map_err(|_| format!("expected real, found {:?}", raw)),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match *self {
            FieldValue::Integer(v) => ToSqlOutput::from(v),
            FieldValue::Real(v) => ToSqlOutput::from(v),
            FieldValue::Absent => ToSqlOutput::from(Null),
        })
    }
}

/// One output row, fields in schema column order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub fields: Vec<FieldValue>,
}

impl OutputRecord {
    pub fn time(&self) -> Option<f64> {
        match self.fields.first() {
            Some(FieldValue::Real(t)) => Some(*t),
            Some(FieldValue::Integer(t)) => Some(*t as f64),
            _ => None,
        }
    }
}
