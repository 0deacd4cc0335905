//! Collation and failure recovery for batches of independent simulation
//! runs on a shared-filesystem cluster.
//!
//! Every operation takes explicit paths; nothing depends on the current
//! working directory except the resolution of relative paths into the
//! absolute paths baked into job scripts.

pub mod collate;
pub mod config;
pub mod convert;
pub mod detect;
pub mod error;
mod fsutil;
pub mod jobs;
pub mod layout;
pub mod output;
pub mod recovery;
pub mod registry;
pub mod schedule;
pub mod schema;
pub mod submit;

pub use collate::{collate, runs_with_output, CollationSummary, RunRows};
pub use config::ConfigDocument;
pub use convert::{convert_all, convert_run_output, ConvertedRun};
pub use detect::{check_recoverable, detect_failed, status, FailedRuns, StatusReport};
pub use error::{Error, Result};
pub use jobs::JobSettings;
pub use layout::{ExperimentPaths, RunId, RunLayout};
pub use output::{CsvOutput, OutputFormat, OutputReader, SqliteOutput};
pub use recovery::{draw_seed, plan_recovery, RecoveredRun, SubmissionArtifacts};
pub use registry::Registry;
pub use schedule::{schedule_runs, ScheduleSummary, ScheduledRun};
pub use schema::{FieldValue, OutputRecord, OutputSchema};
pub use submit::{list_job_scripts, submit};
