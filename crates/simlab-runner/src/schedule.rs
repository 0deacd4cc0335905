//! Initial scheduling: creates run directories, configs, registry rows and
//! the first job batch.

use crate::config::ConfigDocument;
use crate::error::{Error, IoContext, Result};
use crate::fsutil;
use crate::jobs::{write_job_batch, JobScript, JobSettings};
use crate::layout::{ExperimentPaths, RunId};
use crate::recovery::draw_seed;
use crate::registry::{insert_run, Registry};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledRun {
    pub run_id: RunId,
    pub seed: i64,
    pub run_dir: PathBuf,
    pub script: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSummary {
    pub jobs_dir: PathBuf,
    pub submit_script: PathBuf,
    pub runs: Vec<ScheduledRun>,
}

/// Registers `run_ids`, each with its own copy of `base_config` carrying a
/// fresh seed, and writes `jobs/` plus `submit.sh` for them.
///
/// Every run id must be new to both the registry and the run root; all
/// checks happen before anything is created.
pub fn schedule_runs<R: Rng + ?Sized>(
    experiment: &ExperimentPaths,
    base_config: &ConfigDocument,
    run_ids: &[RunId],
    settings: &JobSettings,
    rng: &mut R,
) -> Result<ScheduleSummary> {
    let mut seen = BTreeSet::new();
    for &run_id in run_ids {
        if !seen.insert(run_id) {
            return Err(Error::precondition(format!(
                "run {} is listed more than once",
                run_id
            )));
        }
    }

    let layout = experiment.layout();
    fsutil::ensure_dir(&experiment.dir)?;
    let mut registry = Registry::open_or_create(&experiment.registry_db())?;
    for &run_id in run_ids {
        if registry.contains(run_id)? {
            return Err(Error::precondition(format!(
                "run {} is already registered",
                run_id
            )));
        }
        let dir = layout.run_dir(run_id);
        if dir.exists() {
            return Err(Error::precondition(format!(
                "{} already exists",
                dir.display()
            )));
        }
    }

    let jobs_dir = fsutil::absolute(&experiment.jobs_dir())?;
    let submit_script = fsutil::absolute(&experiment.submit_script())?;
    let mut runs = Vec::with_capacity(run_ids.len());
    let mut scripts = Vec::with_capacity(run_ids.len());
    let mut created: Vec<PathBuf> = Vec::new();

    let tx = registry.transaction()?;
    let outcome = (|| -> Result<()> {
        for &run_id in run_ids {
            let seed = draw_seed(rng, None);
            let mut config = base_config.clone();
            config.set_seed(seed);

            let dir = layout.run_dir(run_id);
            fs::create_dir_all(&dir).at(&dir)?;
            created.push(dir);
            config.save(&layout.config_path(run_id))?;
            insert_run(&tx, run_id, seed)?;

            let run_dir = layout.absolute_run_dir(run_id)?;
            let script = jobs_dir.join(format!("{}.sbatch", run_id));
            scripts.push(JobScript {
                run_id,
                contents: settings.render_job_script(run_id, &run_dir),
                run_dir: run_dir.clone(),
                path: script.clone(),
            });
            runs.push(ScheduledRun {
                run_id,
                seed,
                run_dir,
                script,
            });
        }
        Ok(())
    })();
    let outcome = outcome.and_then(|()| Ok(tx.commit()?));
    if let Err(e) = outcome {
        for dir in &created {
            let _ = fs::remove_dir_all(dir);
        }
        return Err(e);
    }

    write_job_batch(&jobs_dir, &submit_script, &scripts, settings)?;
    info!(runs = runs.len(), submit_script = %submit_script.display(), "scheduled runs");
    Ok(ScheduleSummary {
        jobs_dir,
        submit_script,
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn scheduling_writes_configs_registry_and_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exp = ExperimentPaths::new(dir.path());
        let base = ConfigDocument::parse(r#"{"L": 100, "randomSeed": null, "logInterval": 1.0}"#)
            .expect("base");
        let mut rng = StdRng::seed_from_u64(3);
        let summary = schedule_runs(&exp, &base, &[1, 2], &JobSettings::default(), &mut rng)
            .expect("schedule");

        let registry = Registry::open(&exp.registry_db()).expect("registry");
        assert_eq!(registry.run_ids().expect("ids"), vec![1, 2]);
        for run in &summary.runs {
            let doc = ConfigDocument::load(&exp.layout().config_path(run.run_id)).expect("config");
            assert_eq!(doc.seed(), Some(run.seed));
            assert_eq!(registry.seed(run.run_id).expect("seed"), Some(run.seed));
            assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["L", "randomSeed", "logInterval"]);
            assert!(run.script.is_file());
        }
        let submit = fs::read_to_string(&summary.submit_script).expect("submit");
        assert_eq!(submit.lines().filter(|l| l.starts_with("sbatch ")).count(), 2);
    }

    #[test]
    fn scheduling_refuses_known_runs_without_side_effects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exp = ExperimentPaths::new(dir.path());
        let base = ConfigDocument::new();
        let mut rng = StdRng::seed_from_u64(3);
        schedule_runs(&exp, &base, &[1], &JobSettings::default(), &mut rng).expect("first");

        let err = schedule_runs(&exp, &base, &[2, 1], &JobSettings::default(), &mut rng)
            .expect_err("run 1 is known");
        assert_eq!(err.code(), "precondition_violation");
        assert!(!exp.layout().run_dir(2).exists());
        let registry = Registry::open(&exp.registry_db()).expect("registry");
        assert_eq!(registry.run_ids().expect("ids"), vec![1]);

        let err = schedule_runs(&exp, &base, &[3, 3], &JobSettings::default(), &mut rng)
            .expect_err("duplicate");
        assert!(err.to_string().contains("more than once"), "{err}");
    }
}
