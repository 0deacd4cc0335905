//! Failure detection: registered runs that never produced output.
//!
//! A missing artifact is the only failure signal, so detection is only
//! meaningful once the scheduling batch has drained.

use crate::error::{Error, Result};
use crate::layout::{RunId, RunLayout};
use crate::output::OutputReader;
use crate::registry::Registry;
use serde::Serialize;
use tracing::{info, warn};

/// Failed runs that passed every recovery precondition, ascending.
/// Only `detect_failed` constructs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRuns {
    run_ids: Vec<RunId>,
}

impl FailedRuns {
    pub fn run_ids(&self) -> &[RunId] {
        &self.run_ids
    }

    pub fn len(&self) -> usize {
        self.run_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.run_ids.is_empty()
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.run_ids.binary_search(&run_id).is_ok()
    }
}

/// Registered runs whose output artifact is missing, without any
/// precondition checks.
pub fn find_missing_output(
    registry: &Registry,
    layout: &RunLayout,
    reader: &dyn OutputReader,
) -> Result<Vec<RunId>> {
    Ok(registry
        .run_ids()?
        .into_iter()
        .filter(|id| !reader.has_output(&layout.run_dir(*id)))
        .collect())
}

/// A failed run may be redone only when it has no leftover working
/// directory and still has a config document to rewrite.
pub fn check_recoverable(layout: &RunLayout, run_id: RunId) -> Result<()> {
    let tmp = layout.tmp_dir(run_id);
    if tmp.exists() {
        return Err(Error::precondition(format!(
            "{} needs to be removed before run {} can be redone",
            tmp.display(),
            run_id
        )));
    }
    let config = layout.config_path(run_id);
    if !config.is_file() {
        return Err(Error::precondition(format!(
            "{} does not exist; run {} has nothing to rewrite",
            config.display(),
            run_id
        )));
    }
    Ok(())
}

/// Computes the failed set and validates every member. The first violation
/// aborts the whole pass.
pub fn detect_failed(
    registry: &Registry,
    layout: &RunLayout,
    reader: &dyn OutputReader,
) -> Result<FailedRuns> {
    let run_ids = find_missing_output(registry, layout, reader)?;
    for run_id in &run_ids {
        check_recoverable(layout, *run_id)?;
    }
    info!(failed = ?run_ids, "failure detection complete");
    Ok(FailedRuns { run_ids })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub registered: usize,
    pub with_output: usize,
    pub failed: Vec<RunId>,
    /// Failed runs that still have a `tmp/` working directory.
    pub dirty: Vec<RunId>,
    /// Failed runs without a config document.
    pub missing_config: Vec<RunId>,
}

impl StatusReport {
    pub fn recoverable(&self) -> bool {
        self.dirty.is_empty() && self.missing_config.is_empty()
    }
}

/// Like `detect_failed`, but reports precondition problems instead of
/// stopping at the first one.
pub fn status(
    registry: &Registry,
    layout: &RunLayout,
    reader: &dyn OutputReader,
) -> Result<StatusReport> {
    let registered = registry.run_ids()?.len();
    let failed = find_missing_output(registry, layout, reader)?;
    let mut report = StatusReport {
        registered,
        with_output: registered - failed.len(),
        ..StatusReport::default()
    };
    for &run_id in &failed {
        if layout.tmp_dir(run_id).exists() {
            warn!(run_id, "failed run has a leftover tmp directory");
            report.dirty.push(run_id);
        }
        if !layout.config_path(run_id).is_file() {
            warn!(run_id, "failed run has no config document");
            report.missing_config.push(run_id);
        }
    }
    report.failed = failed;
    Ok(report)
}
