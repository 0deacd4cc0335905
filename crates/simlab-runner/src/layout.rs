//! Filesystem conventions shared by collation, detection and recovery.
//!
//! An experiment directory holds the run registry (`db.sqlite`), the run
//! root (`runs/`) with one directory per integer run id, and the generated
//! submission artifacts.

use crate::error::{Error, Result};
use crate::fsutil;
use std::path::{Path, PathBuf};
use tracing::debug;

pub type RunId = i64;

pub const CONFIG_FILE: &str = "config.json";
pub const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone)]
pub struct ExperimentPaths {
    pub dir: PathBuf,
}

impl ExperimentPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn run_root(&self) -> PathBuf {
        self.dir.join("runs")
    }

    pub fn registry_db(&self) -> PathBuf {
        self.dir.join("db.sqlite")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.dir.join("jobs")
    }

    pub fn submit_script(&self) -> PathBuf {
        self.dir.join("submit.sh")
    }

    pub fn redo_jobs_dir(&self) -> PathBuf {
        self.dir.join("jobs_redo")
    }

    pub fn redo_submit_script(&self) -> PathBuf {
        self.dir.join("submit_redo.sh")
    }

    pub fn layout(&self) -> RunLayout {
        RunLayout::new(self.run_root())
    }
}

/// Maps run ids to `<root>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn config_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join(CONFIG_FILE)
    }

    pub fn tmp_dir(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join(TMP_DIR)
    }

    /// Absolute run directory, as baked into job scripts.
    pub fn absolute_run_dir(&self, run_id: RunId) -> Result<PathBuf> {
        fsutil::absolute(&self.run_dir(run_id))
    }

    /// Run ids of every directory under the root whose name is a canonical
    /// integer, ascending. Anything else (files, `old/`, `007`) is ignored,
    /// since `run_dir` could not map the id back to it.
    pub fn list_run_ids(&self) -> Result<Vec<RunId>> {
        let mut ids = Vec::new();
        let walker = walkdir::WalkDir::new(&self.root).min_depth(1).max_depth(1);
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                match e.into_io_error() {
                    Some(source) => Error::Io { path, source },
                    None => Error::precondition(format!(
                        "cannot list run root {}",
                        self.root.display()
                    )),
                }
            })?;
            // Follows symlinks, so a run directory linked in from scratch
            // space counts the same as a real one.
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            match name.parse::<RunId>() {
                Ok(id) if id.to_string() == name => ids.push(id),
                _ => debug!(entry = %name, "skipping non-run directory"),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}
