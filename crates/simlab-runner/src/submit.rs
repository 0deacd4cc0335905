//! Hands generated job scripts to the batch scheduler.

use crate::error::{Error, IoContext, Result};
use crate::jobs::JobSettings;
use crate::layout::RunId;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// Job scripts in `jobs_dir` (`<run_id>.sbatch`), ordered by run id.
pub fn list_job_scripts(jobs_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut scripts: Vec<(RunId, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(jobs_dir).at(jobs_dir)? {
        let entry = entry.at(jobs_dir)?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("sbatch") {
            continue;
        }
        if let Some(run_id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<RunId>().ok())
        {
            scripts.push((run_id, path));
        }
    }
    scripts.sort_by_key(|(run_id, _)| *run_id);
    Ok(scripts.into_iter().map(|(_, path)| path).collect())
}

/// Submits each script once, in order, and returns the scheduler's reply
/// for each. Stops at the first rejection; scripts already accepted stay
/// submitted.
pub fn submit(scripts: &[PathBuf], settings: &JobSettings) -> Result<Vec<String>> {
    let mut parts = settings.submit_command.split_whitespace();
    let program = parts.next().ok_or_else(|| Error::ExternalToolFailure {
        command: settings.submit_command.clone(),
        script: PathBuf::new(),
        message: "submission command is empty".to_string(),
    })?;
    let args: Vec<&str> = parts.collect();

    let mut replies = Vec::with_capacity(scripts.len());
    for script in scripts {
        let output = Command::new(program)
            .args(&args)
            .arg(script)
            .output()
            .map_err(|e| Error::ExternalToolFailure {
                command: settings.submit_command.clone(),
                script: script.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
                .unwrap_or_else(|| {
                    output
                        .status
                        .code()
                        .map(|c| format!("exited with status {}", c))
                        .unwrap_or_else(|| "terminated by signal".to_string())
                });
            return Err(Error::ExternalToolFailure {
                command: settings.submit_command.clone(),
                script: script.clone(),
                message: stderr_tail,
            });
        }
        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(script = %script.display(), reply = %reply, "submitted");
        replies.push(reply);
    }
    Ok(replies)
}
