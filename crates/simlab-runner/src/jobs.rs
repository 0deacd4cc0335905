//! Scheduler job scripts.
//!
//! The job script template is fixed per deployment (`JobSettings`); each
//! rendered script varies only by run id and absolute run directory.

use crate::error::{IoContext, Result};
use crate::fsutil::{
    atomic_write_bytes, commit_staged, ensure_dir, mark_executable, shell_quote, stage_bytes,
    staging_path,
};
use crate::layout::RunId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobSettings {
    pub job_name_prefix: String,
    pub account: Option<String>,
    pub partition: Option<String>,
    pub time: String,
    pub nodes: u32,
    pub ntasks_per_node: u32,
    pub mem_per_cpu: u32,
    pub modules: Vec<String>,
    /// Command run from inside the run directory.
    pub command: String,
    /// Batch submission command, invoked once per job script.
    pub submit_command: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            job_name_prefix: "LUM".to_string(),
            account: Some("pi-pascualmm".to_string()),
            partition: Some("broadwl".to_string()),
            time: "6:00:00".to_string(),
            nodes: 1,
            ntasks_per_node: 1,
            mem_per_cpu: 2000,
            modules: vec!["parallel".to_string(), "java/11.0.1".to_string()],
            command: "./run.sh".to_string(),
            submit_command: "sbatch".to_string(),
        }
    }
}

impl JobSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).at(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn render_job_script(&self, run_id: RunId, run_dir: &Path) -> String {
        let mut out = String::from("#!/bin/bash\n\n");
        out.push_str(&format!(
            "#SBATCH --job-name={}-{}\n\n",
            self.job_name_prefix, run_id
        ));
        if let Some(account) = &self.account {
            out.push_str(&format!("#SBATCH --account={}\n", account));
        }
        if let Some(partition) = &self.partition {
            out.push_str(&format!("#SBATCH --partition={}\n", partition));
        }
        if self.account.is_some() || self.partition.is_some() {
            out.push('\n');
        }
        out.push_str(&format!("#SBATCH --time={}\n", self.time));
        out.push_str(&format!("#SBATCH --nodes={}\n", self.nodes));
        out.push_str(&format!("#SBATCH --ntasks-per-node={}\n", self.ntasks_per_node));
        out.push_str(&format!("#SBATCH --mem-per-cpu={}\n\n", self.mem_per_cpu));
        out.push_str(&format!("#SBATCH --chdir={}\n", run_dir.display()));
        out.push_str("#SBATCH --output=stdout.txt\n");
        out.push_str("#SBATCH --error=stderr.txt\n\n");
        out.push_str("module purge\n\n");
        for module in &self.modules {
            out.push_str(&format!("module load {}\n", module));
        }
        if !self.modules.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.command);
        out.push('\n');
        out
    }

    /// Umbrella script submitting each job script once, in order.
    pub fn render_submit_script(&self, scripts: &[PathBuf]) -> String {
        let mut out = String::from("#!/bin/bash\n\n");
        for script in scripts {
            out.push_str(&format!(
                "{} {}\n",
                self.submit_command,
                shell_quote(&script.to_string_lossy())
            ));
        }
        out
    }
}

/// One job script to be written.
#[derive(Debug, Clone, Serialize)]
pub struct JobScript {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub path: PathBuf,
    #[serde(skip)]
    pub contents: String,
}

/// A job batch written beside its final location, not yet visible under
/// `jobs_dir` or `submit_script`.
///
/// `install` swaps it into place while keeping the previous batch aside;
/// `finish` drops the previous batch and `revert` puts it back.
#[derive(Debug)]
pub(crate) struct StagedBatch {
    jobs_dir: PathBuf,
    staging_dir: PathBuf,
    submit_script: PathBuf,
    submit_tmp: PathBuf,
    previous_submit: Option<Vec<u8>>,
    backup_dir: Option<PathBuf>,
    jobs_installed: bool,
    submit_installed: bool,
}

/// Writes every script of a batch, plus the umbrella submission script, to
/// staging locations. Nothing under `jobs_dir` or at `submit_script` changes.
pub(crate) fn stage_job_batch(
    jobs_dir: &Path,
    submit_script: &Path,
    scripts: &[JobScript],
    settings: &JobSettings,
) -> Result<StagedBatch> {
    let staging_dir = staging_path(jobs_dir);
    let mut batch = StagedBatch {
        jobs_dir: jobs_dir.to_path_buf(),
        submit_script: submit_script.to_path_buf(),
        submit_tmp: PathBuf::new(),
        previous_submit: None,
        backup_dir: None,
        jobs_installed: false,
        submit_installed: false,
        staging_dir,
    };
    if let Err(e) = batch.write(scripts, settings) {
        batch.revert();
        return Err(e);
    }
    Ok(batch)
}

impl StagedBatch {
    fn write(&mut self, scripts: &[JobScript], settings: &JobSettings) -> Result<()> {
        ensure_dir(&self.staging_dir)?;
        for script in scripts {
            let name = script.path.file_name().unwrap_or_default();
            let path = self.staging_dir.join(name);
            fs::write(&path, script.contents.as_bytes()).at(&path)?;
        }
        let paths: Vec<PathBuf> = scripts.iter().map(|s| s.path.clone()).collect();
        let umbrella = settings.render_submit_script(&paths);
        self.submit_tmp = stage_bytes(&self.submit_script, umbrella.as_bytes())?;
        mark_executable(&self.submit_tmp)?;
        if self.submit_script.is_file() {
            self.previous_submit = Some(fs::read(&self.submit_script).at(&self.submit_script)?);
        }
        Ok(())
    }

    /// Adds one more file to the staged jobs directory and returns the path
    /// it will have once installed.
    pub(crate) fn stage_file(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.staging_dir.join(name);
        fs::write(&path, bytes).at(&path)?;
        Ok(self.jobs_dir.join(name))
    }

    /// Moves the staged batch into place. On failure the previous batch is
    /// back where it was and the staged files are gone.
    pub(crate) fn install(&mut self) -> Result<()> {
        if let Err(e) = self.swap() {
            self.rollback();
            return Err(e);
        }
        Ok(())
    }

    fn swap(&mut self) -> Result<()> {
        if self.jobs_dir.exists() {
            let backup = staging_path(&self.jobs_dir.with_extension("old"));
            fs::rename(&self.jobs_dir, &backup).at(&self.jobs_dir)?;
            self.backup_dir = Some(backup);
        }
        fs::rename(&self.staging_dir, &self.jobs_dir).at(&self.jobs_dir)?;
        self.jobs_installed = true;
        commit_staged(&self.submit_tmp, &self.submit_script)?;
        self.submit_installed = true;
        Ok(())
    }

    /// Drops the previous batch kept aside by `install`.
    pub(crate) fn finish(mut self) {
        if let Some(backup) = self.backup_dir.take() {
            if let Err(e) = fs::remove_dir_all(&backup) {
                warn!(
                    path = %backup.display(),
                    error = %e,
                    "could not remove previous job batch"
                );
            }
        }
    }

    /// Discards the staged batch and restores whatever `install` replaced.
    pub(crate) fn revert(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.submit_installed {
            let restored = match &self.previous_submit {
                Some(bytes) => atomic_write_bytes(&self.submit_script, bytes),
                None => fs::remove_file(&self.submit_script).at(&self.submit_script),
            };
            if let Err(e) = restored {
                error!(
                    path = %self.submit_script.display(),
                    error = %e,
                    "could not restore submission script"
                );
            }
            self.submit_installed = false;
        } else if !self.submit_tmp.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.submit_tmp);
        }
        if self.jobs_installed {
            let _ = fs::remove_dir_all(&self.jobs_dir);
            self.jobs_installed = false;
        } else {
            let _ = fs::remove_dir_all(&self.staging_dir);
        }
        if let Some(backup) = self.backup_dir.take() {
            if let Err(e) = fs::rename(&backup, &self.jobs_dir) {
                error!(
                    path = %self.jobs_dir.display(),
                    error = %e,
                    "could not restore previous job batch"
                );
            }
        }
    }
}

/// Replaces `jobs_dir` with `scripts` and rewrites the umbrella submission
/// script. The previous batch stays in place if any write fails.
pub(crate) fn write_job_batch(
    jobs_dir: &Path,
    submit_script: &Path,
    scripts: &[JobScript],
    settings: &JobSettings,
) -> Result<()> {
    let mut batch = stage_job_batch(jobs_dir, submit_script, scripts, settings)?;
    batch.install()?;
    batch.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_script_is_parameterized_by_run_and_dir_only() {
        let settings = JobSettings::default();
        let script = settings.render_job_script(17, Path::new("/scratch/exp/runs/17"));
        assert!(script.starts_with("#!/bin/bash\n\n#SBATCH --job-name=LUM-17\n"));
        assert!(script.contains("#SBATCH --account=pi-pascualmm\n#SBATCH --partition=broadwl\n"));
        assert!(script.contains("#SBATCH --chdir=/scratch/exp/runs/17\n"));
        assert!(script.contains("module purge\n\nmodule load parallel\nmodule load java/11.0.1\n\n./run.sh\n"));
        assert_eq!(
            script,
            settings.render_job_script(17, Path::new("/scratch/exp/runs/17"))
        );
    }

    #[test]
    fn submit_script_lists_every_job() {
        let settings = JobSettings::default();
        let scripts = vec![
            PathBuf::from("/scratch/exp/jobs_redo/2.sbatch"),
            PathBuf::from("/scratch/my exp/jobs_redo/5.sbatch"),
        ];
        assert_eq!(
            settings.render_submit_script(&scripts),
            "#!/bin/bash\n\nsbatch /scratch/exp/jobs_redo/2.sbatch\nsbatch '/scratch/my exp/jobs_redo/5.sbatch'\n"
        );
    }

    #[test]
    fn settings_load_from_yaml_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.yaml");
        fs::write(
            &path,
            "job_name_prefix: SIR\naccount: null\ntime: '1:00:00'\nmodules: [java/17]\n",
        )
        .expect("write");
        let settings = JobSettings::load(&path).expect("load");
        assert_eq!(settings.job_name_prefix, "SIR");
        assert_eq!(settings.account, None);
        assert_eq!(settings.partition.as_deref(), Some("broadwl"));
        assert_eq!(settings.submit_command, "sbatch");
        let script = settings.render_job_script(1, Path::new("/x/runs/1"));
        assert!(!script.contains("--account"));
        assert!(script.contains("module load java/17\n"));
    }

    fn batch(dir: &Path, run_ids: &[RunId]) -> Vec<JobScript> {
        let settings = JobSettings::default();
        run_ids
            .iter()
            .map(|&run_id| {
                let run_dir = dir.join("runs").join(run_id.to_string());
                JobScript {
                    run_id,
                    contents: settings.render_job_script(run_id, &run_dir),
                    path: dir.join("jobs").join(format!("{}.sbatch", run_id)),
                    run_dir,
                }
            })
            .collect()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn write_job_batch_replaces_previous_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jobs = dir.path().join("jobs");
        let submit = dir.path().join("submit.sh");
        let settings = JobSettings::default();
        write_job_batch(&jobs, &submit, &batch(dir.path(), &[1, 2]), &settings).expect("first");
        write_job_batch(&jobs, &submit, &batch(dir.path(), &[3]), &settings).expect("second");

        assert_eq!(entries(&jobs), vec!["3.sbatch"]);
        assert_eq!(entries(dir.path()), vec!["jobs", "submit.sh"]);
        let umbrella = fs::read_to_string(&submit).expect("umbrella");
        assert_eq!(umbrella.lines().filter(|l| l.starts_with("sbatch ")).count(), 1);
    }

    #[test]
    fn reverted_batch_leaves_previous_batch_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jobs = dir.path().join("jobs");
        let submit = dir.path().join("submit.sh");
        let settings = JobSettings::default();
        write_job_batch(&jobs, &submit, &batch(dir.path(), &[1, 2]), &settings).expect("first");
        let umbrella = fs::read_to_string(&submit).expect("umbrella");

        let mut staged =
            stage_job_batch(&jobs, &submit, &batch(dir.path(), &[3]), &settings).expect("stage");
        staged.stage_file("extra.json", b"{}").expect("extra");
        assert_eq!(entries(&jobs), vec!["1.sbatch", "2.sbatch"]);
        staged.install().expect("install");
        assert_eq!(entries(&jobs), vec!["3.sbatch", "extra.json"]);
        staged.revert();

        assert_eq!(entries(&jobs), vec!["1.sbatch", "2.sbatch"]);
        assert_eq!(fs::read_to_string(&submit).expect("umbrella"), umbrella);
        assert_eq!(entries(dir.path()), vec!["jobs", "submit.sh"]);
    }

    #[test]
    fn failed_install_keeps_previous_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jobs = dir.path().join("jobs");
        let submit = dir.path().join("submit.sh");
        let settings = JobSettings::default();
        write_job_batch(&jobs, &submit, &batch(dir.path(), &[1]), &settings).expect("first");
        fs::remove_file(&submit).expect("rm");
        fs::create_dir(&submit).expect("block submit script");

        let err = write_job_batch(&jobs, &submit, &batch(dir.path(), &[2]), &settings)
            .expect_err("submit script path is a directory");
        assert_eq!(err.code(), "io_error");
        assert_eq!(entries(&jobs), vec!["1.sbatch"]);
        assert!(submit.is_dir());
        assert_eq!(entries(dir.path()), vec!["jobs", "submit.sh"]);
    }

    #[test]
    fn unknown_settings_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.yaml");
        fs::write(&path, "acount: typo\n").expect("write");
        assert!(JobSettings::load(&path).is_err());
    }
}
