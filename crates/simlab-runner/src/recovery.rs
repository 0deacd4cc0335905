//! Recovery: fresh seeds and new submission artifacts for failed runs.

use crate::config::ConfigDocument;
use crate::detect::{check_recoverable, FailedRuns};
use crate::error::{IoContext, Result};
use crate::fsutil::{self, atomic_write_bytes, commit_staged, stage_bytes};
use crate::jobs::{stage_job_batch, JobScript, JobSettings, StagedBatch};
use crate::layout::{ExperimentPaths, RunId};
use crate::registry::{update_seed, Registry};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Seeds are drawn from `1..=MAX_SEED`, the positive range of a signed
/// 32-bit integer the simulation accepts.
pub const MAX_SEED: i64 = i32::MAX as i64;

pub const RECOVERY_MANIFEST: &str = "recovery.json";

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredRun {
    pub run_id: RunId,
    pub previous_seed: Option<i64>,
    pub seed: i64,
    pub run_dir: PathBuf,
    pub script: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionArtifacts {
    pub jobs_dir: PathBuf,
    pub submit_script: PathBuf,
    pub manifest: PathBuf,
    pub generated_at: String,
    pub runs: Vec<RecoveredRun>,
}

impl SubmissionArtifacts {
    pub fn scripts(&self) -> Vec<PathBuf> {
        self.runs.iter().map(|r| r.script.clone()).collect()
    }
}

/// Draws a seed in `1..=MAX_SEED` that differs from `previous`.
pub fn draw_seed<R: Rng + ?Sized>(rng: &mut R, previous: Option<i64>) -> i64 {
    loop {
        let seed = rng.gen_range(1..=MAX_SEED);
        if Some(seed) != previous {
            return seed;
        }
    }
}

struct PlannedRun {
    run_id: RunId,
    previous_seed: Option<i64>,
    seed: i64,
    config_path: PathBuf,
    original: String,
    rewritten: String,
}

/// A config rewrite sitting in its staging file until the registry agrees.
struct StagedConfig<'a> {
    plan: &'a PlannedRun,
    tmp: PathBuf,
    committed: bool,
}

/// Reseeds every failed run and writes the redo batch.
///
/// Nothing is written unless every run passes its preconditions and every
/// config document parses. Registry seeds, config seeds and the redo batch
/// change together: the batch and config rewrites are staged first, the
/// registry update is committed last, and any failure in between restores
/// the original config documents and the previous batch.
pub fn plan_recovery<R: Rng + ?Sized>(
    registry: &mut Registry,
    experiment: &ExperimentPaths,
    failed: &FailedRuns,
    settings: &JobSettings,
    rng: &mut R,
) -> Result<SubmissionArtifacts> {
    let layout = experiment.layout();
    for &run_id in failed.run_ids() {
        check_recoverable(&layout, run_id)?;
    }

    let jobs_dir = fsutil::absolute(&experiment.redo_jobs_dir())?;
    let submit_script = fsutil::absolute(&experiment.redo_submit_script())?;

    let mut plans = Vec::with_capacity(failed.len());
    let mut scripts = Vec::with_capacity(failed.len());
    let mut runs = Vec::with_capacity(failed.len());
    for &run_id in failed.run_ids() {
        let previous_seed = registry.seed(run_id)?;
        let seed = draw_seed(rng, previous_seed);
        let config_path = layout.config_path(run_id);
        let original = fs::read_to_string(&config_path).at(&config_path)?;
        let mut doc = ConfigDocument::parse_file(&config_path, &original)?;
        doc.set_seed(seed);
        let rewritten = doc.render()?;

        let run_dir = layout.absolute_run_dir(run_id)?;
        let script = jobs_dir.join(format!("{}.sbatch", run_id));
        scripts.push(JobScript {
            run_id,
            contents: settings.render_job_script(run_id, &run_dir),
            run_dir: run_dir.clone(),
            path: script.clone(),
        });
        runs.push(RecoveredRun {
            run_id,
            previous_seed,
            seed,
            run_dir,
            script,
        });
        plans.push(PlannedRun {
            run_id,
            previous_seed,
            seed,
            config_path,
            original,
            rewritten,
        });
    }

    let artifacts = SubmissionArtifacts {
        manifest: jobs_dir.join(RECOVERY_MANIFEST),
        jobs_dir,
        submit_script,
        generated_at: Utc::now().to_rfc3339(),
        runs,
    };
    let manifest = manifest_bytes(&artifacts, settings)?;
    let batch = stage_job_batch(
        &artifacts.jobs_dir,
        &artifacts.submit_script,
        &scripts,
        settings,
    )?;
    if let Err(e) = batch.stage_file(RECOVERY_MANIFEST, &manifest) {
        batch.revert();
        return Err(e);
    }

    apply_seeds(registry, &plans, batch)?;
    for plan in &plans {
        info!(
            run_id = plan.run_id,
            previous_seed = ?plan.previous_seed,
            seed = plan.seed,
            "reseeded run"
        );
    }
    info!(
        runs = artifacts.runs.len(),
        submit_script = %artifacts.submit_script.display(),
        "recovery batch written"
    );
    Ok(artifacts)
}

/// Commits the new seeds together with the staged batch. The batch is
/// installed after the config rewrites and before the registry commit, so a
/// failure at any step leaves seeds, configs and the previous batch as they
/// were.
fn apply_seeds(
    registry: &mut Registry,
    plans: &[PlannedRun],
    mut batch: StagedBatch,
) -> Result<()> {
    let mut staged: Vec<StagedConfig<'_>> = Vec::with_capacity(plans.len());
    for plan in plans {
        match stage_bytes(&plan.config_path, plan.rewritten.as_bytes()) {
            Ok(tmp) => staged.push(StagedConfig {
                plan,
                tmp,
                committed: false,
            }),
            Err(e) => {
                discard(&mut staged);
                batch.revert();
                return Err(e);
            }
        }
    }

    let tx = match registry.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            discard(&mut staged);
            batch.revert();
            return Err(e);
        }
    };
    for plan in plans {
        if let Err(e) = update_seed(&tx, plan.run_id, plan.seed) {
            discard(&mut staged);
            batch.revert();
            return Err(e);
        }
    }
    let mut failure = None;
    for entry in staged.iter_mut() {
        if let Err(e) = commit_staged(&entry.tmp, &entry.plan.config_path) {
            failure = Some(e);
            break;
        }
        entry.committed = true;
    }
    if let Some(e) = failure {
        discard(&mut staged);
        batch.revert();
        return Err(e);
    }
    if let Err(e) = batch.install() {
        discard(&mut staged);
        return Err(e);
    }
    if let Err(e) = tx.commit() {
        discard(&mut staged);
        batch.revert();
        return Err(e.into());
    }
    batch.finish();
    Ok(())
}

/// Removes staging files and puts back the original text of any config
/// already renamed into place.
fn discard(staged: &mut [StagedConfig<'_>]) {
    for entry in staged.iter_mut() {
        if entry.committed {
            if let Err(e) =
                atomic_write_bytes(&entry.plan.config_path, entry.plan.original.as_bytes())
            {
                error!(
                    run_id = entry.plan.run_id,
                    path = %entry.plan.config_path.display(),
                    error = %e,
                    "could not restore config document; registry and config may disagree"
                );
            }
            entry.committed = false;
        } else {
            let _ = fs::remove_file(&entry.tmp);
        }
    }
}

fn manifest_bytes(artifacts: &SubmissionArtifacts, settings: &JobSettings) -> Result<Vec<u8>> {
    let payload = json!({
        "schema_version": "recovery_manifest_v1",
        "generated_at": artifacts.generated_at,
        "submit_command": settings.submit_command,
        "submit_script": artifacts.submit_script,
        "runs": artifacts.runs,
    });
    Ok(serde_json::to_vec_pretty(&payload)?)
}

pub fn load_manifest(path: &Path) -> Result<serde_json::Value> {
    let data = fs::read_to_string(path).at(path)?;
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn drawn_seed_is_positive_and_fresh() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let seed = draw_seed(&mut rng, Some(5));
            assert!((1..=MAX_SEED).contains(&seed));
            assert_ne!(seed, 5);
        }
    }
}
