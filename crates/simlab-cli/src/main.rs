use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use simlab_runner::{
    ExperimentPaths, JobSettings, OutputFormat, OutputSchema, Registry, RunId, RunLayout,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "simlab",
    version = "0.3.0",
    about = "Collate and recover batches of simulation runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    #[value(name = "csv")]
    Csv,
    #[value(name = "sqlite")]
    Sqlite,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Sqlite => OutputFormat::Sqlite,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchemaArg {
    #[value(name = "timeseries")]
    Timeseries,
    #[value(name = "state-changes")]
    StateChanges,
}

impl From<SchemaArg> for OutputSchema {
    fn from(value: SchemaArg) -> Self {
        match value {
            SchemaArg::Timeseries => OutputSchema::Timeseries,
            SchemaArg::StateChanges => OutputSchema::StateChanges,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct ExperimentArgs {
    /// Experiment directory holding `db.sqlite` and `runs/`.
    #[arg(long, default_value = ".")]
    experiment: PathBuf,
    /// Run root, if not `<experiment>/runs`.
    #[arg(long)]
    root: Option<PathBuf>,
    /// Run registry, if not `<experiment>/db.sqlite`.
    #[arg(long)]
    db: Option<PathBuf>,
}

impl ExperimentArgs {
    fn paths(&self) -> ExperimentPaths {
        ExperimentPaths::new(&self.experiment)
    }

    fn layout(&self) -> RunLayout {
        match &self.root {
            Some(root) => RunLayout::new(root),
            None => self.paths().layout(),
        }
    }

    fn registry_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(|| self.paths().registry_db())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register new runs and write their configs and job scripts.
    Schedule {
        #[command(flatten)]
        exp: ExperimentArgs,
        #[arg(long)]
        base_config: PathBuf,
        /// Run ids, e.g. `1-100` or `1,4,7-9`.
        #[arg(long)]
        runs: String,
        #[arg(long)]
        job_settings: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Convert delimited run output into per-run SQLite stores.
    Convert {
        #[command(flatten)]
        exp: ExperimentArgs,
        #[arg(long, value_enum, default_value = "timeseries")]
        schema: SchemaArg,
        #[arg(long)]
        run_id: Option<RunId>,
        #[arg(long)]
        json: bool,
    },
    /// Merge every run's output into one aggregate table.
    Collate {
        #[command(flatten)]
        exp: ExperimentArgs,
        /// Aggregate store, if not the run registry.
        #[arg(long)]
        destination: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "sqlite")]
        format: FormatArg,
        #[arg(long, value_enum, default_value = "timeseries")]
        schema: SchemaArg,
        #[arg(long)]
        json: bool,
    },
    /// Report runs with and without output, and what blocks recovery.
    Status {
        #[command(flatten)]
        exp: ExperimentArgs,
        #[arg(long, value_enum, default_value = "csv")]
        format: FormatArg,
        #[arg(long)]
        json: bool,
    },
    /// List failed runs, failing if any of them cannot be redone.
    Detect {
        #[command(flatten)]
        exp: ExperimentArgs,
        #[arg(long, value_enum, default_value = "csv")]
        format: FormatArg,
        #[arg(long)]
        json: bool,
    },
    /// Reseed failed runs and write the redo job batch.
    Recover {
        #[command(flatten)]
        exp: ExperimentArgs,
        #[arg(long, value_enum, default_value = "csv")]
        format: FormatArg,
        #[arg(long)]
        job_settings: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Hand the generated job scripts to the scheduler.
    Submit {
        #[command(flatten)]
        exp: ExperimentArgs,
        /// Submit `jobs_redo/` instead of `jobs/`.
        #[arg(long)]
        redo: bool,
        #[arg(long)]
        job_settings: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("simlab=info,simlab_runner=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<simlab_runner::Error>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Schedule {
            exp,
            base_config,
            runs,
            job_settings,
            json,
        } => {
            let run_ids = parse_run_ids(&runs)?;
            let base = simlab_runner::ConfigDocument::load(&base_config)?;
            let settings = load_job_settings(job_settings.as_ref())?;
            let summary = simlab_runner::schedule_runs(
                &exp.paths(),
                &base,
                &run_ids,
                &settings,
                &mut rand::thread_rng(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "schedule",
                    "schedule": summary,
                })));
            }
            println!("scheduled: {}", summary.runs.len());
            println!("jobs_dir: {}", summary.jobs_dir.display());
            println!("submit_script: {}", summary.submit_script.display());
        }
        Commands::Convert {
            exp,
            schema,
            run_id,
            json,
        } => {
            let layout = exp.layout();
            let converted = match run_id {
                Some(id) => vec![simlab_runner::convert_run_output(&layout, id, schema.into())?],
                None => simlab_runner::convert_all(&layout, schema.into())?,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "convert",
                    "converted": converted,
                })));
            }
            for run in &converted {
                println!("converted: {} ({} rows)", run.run_id, run.rows);
            }
        }
        Commands::Collate {
            exp,
            destination,
            format,
            schema,
            json,
        } => {
            let destination = destination.unwrap_or_else(|| exp.registry_path());
            let reader = OutputFormat::from(format).reader();
            let summary = simlab_runner::collate(
                &exp.layout(),
                &destination,
                reader.as_ref(),
                schema.into(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collate",
                    "collation": summary,
                })));
            }
            println!("destination: {}", summary.destination.display());
            println!("runs: {}", summary.runs.len());
            println!("rows: {}", summary.total_rows);
        }
        Commands::Status { exp, format, json } => {
            let registry = Registry::open(&exp.registry_path())?;
            let reader = OutputFormat::from(format).reader();
            let report = simlab_runner::status(&registry, &exp.layout(), reader.as_ref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "status": report,
                    "recoverable": report.recoverable(),
                })));
            }
            println!("registered: {}", report.registered);
            println!("with_output: {}", report.with_output);
            println!("failed: {:?}", report.failed);
            if !report.dirty.is_empty() {
                println!("tmp_dir_present: {:?}", report.dirty);
            }
            if !report.missing_config.is_empty() {
                println!("config_missing: {:?}", report.missing_config);
            }
        }
        Commands::Detect { exp, format, json } => {
            let registry = Registry::open(&exp.registry_path())?;
            let reader = OutputFormat::from(format).reader();
            let failed = simlab_runner::detect_failed(&registry, &exp.layout(), reader.as_ref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "detect",
                    "failed": failed.run_ids(),
                })));
            }
            println!("failed: {:?}", failed.run_ids());
        }
        Commands::Recover {
            exp,
            format,
            job_settings,
            json,
        } => {
            let settings = load_job_settings(job_settings.as_ref())?;
            let mut registry = Registry::open(&exp.registry_path())?;
            let reader = OutputFormat::from(format).reader();
            let paths = exp.paths();
            let layout = exp.layout();
            if layout.root() != paths.run_root().as_path() {
                return Err(anyhow!(
                    "recover writes jobs relative to the experiment; --root must be <experiment>/runs"
                ));
            }
            let failed = simlab_runner::detect_failed(&registry, &layout, reader.as_ref())?;
            let artifacts = simlab_runner::plan_recovery(
                &mut registry,
                &paths,
                &failed,
                &settings,
                &mut rand::thread_rng(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "recover",
                    "recovery": artifacts,
                })));
            }
            println!("failed: {:?}", failed.run_ids());
            println!("jobs_dir: {}", artifacts.jobs_dir.display());
            println!("submit_script: {}", artifacts.submit_script.display());
            println!("next: {}", artifacts.submit_script.display());
        }
        Commands::Submit {
            exp,
            redo,
            job_settings,
            json,
        } => {
            let settings = load_job_settings(job_settings.as_ref())?;
            let paths = exp.paths();
            let jobs_dir = if redo {
                paths.redo_jobs_dir()
            } else {
                paths.jobs_dir()
            };
            let scripts = simlab_runner::list_job_scripts(&jobs_dir)?;
            let replies = simlab_runner::submit(&scripts, &settings)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "submit",
                    "scripts": scripts,
                    "replies": replies,
                })));
            }
            for (script, reply) in scripts.iter().zip(&replies) {
                println!("{}: {}", script.display(), reply);
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Schedule { json, .. }
        | Commands::Convert { json, .. }
        | Commands::Collate { json, .. }
        | Commands::Status { json, .. }
        | Commands::Detect { json, .. }
        | Commands::Recover { json, .. }
        | Commands::Submit { json, .. } => *json,
    }
}

fn load_job_settings(path: Option<&PathBuf>) -> Result<JobSettings> {
    match path {
        Some(p) => Ok(JobSettings::load(p)?),
        None => Ok(JobSettings::default()),
    }
}

/// Parses `1-5,8,10-12` into a sorted, de-duplicated list of run ids.
fn parse_run_ids(raw: &str) -> Result<Vec<RunId>> {
    let mut out = BTreeSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: RunId = lo
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid run range '{}'", part))?;
                let hi: RunId = hi
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid run range '{}'", part))?;
                if lo > hi {
                    return Err(anyhow!("invalid run range '{}': start after end", part));
                }
                out.extend(lo..=hi);
            }
            None => {
                out.insert(
                    part.parse()
                        .map_err(|_| anyhow!("invalid run id '{}'", part))?,
                );
            }
        }
    }
    if out.is_empty() {
        return Err(anyhow!("no run ids given"));
    }
    Ok(out.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_lists_accept_ranges_and_singles() {
        assert_eq!(parse_run_ids("1-3,7, 5").expect("parse"), vec![1, 2, 3, 5, 7]);
        assert_eq!(parse_run_ids("4,4,2-4").expect("parse"), vec![2, 3, 4]);
        assert!(parse_run_ids("5-2").is_err());
        assert!(parse_run_ids("a").is_err());
        assert!(parse_run_ids(" , ").is_err());
    }

    #[test]
    fn every_command_parses() {
        Cli::try_parse_from(["simlab", "collate", "--experiment", "/x", "--format", "csv", "--schema", "state-changes"])
            .expect("collate");
        Cli::try_parse_from(["simlab", "recover", "--json"]).expect("recover");
        Cli::try_parse_from(["simlab", "submit", "--redo"]).expect("submit");
        Cli::try_parse_from(["simlab", "schedule", "--base-config", "c.json", "--runs", "1-4"])
            .expect("schedule");
        assert!(Cli::try_parse_from(["simlab", "collate", "--format", "parquet"]).is_err());
    }
}
