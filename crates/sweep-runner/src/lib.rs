//! Distributed execution of experiment sweeps: expands a sweep file into jobs,
//! dispatches them over remote hosts under a wall-clock limit, classifies the
//! outcomes, and folds them into persisted result sets.

pub mod channel;
pub mod config;
pub mod job;
pub mod notify;
pub mod parse;
pub mod probe;
pub mod scheduler;

pub use channel::{ExecutionChannel, ExecutionOutcome, Host, LocalChannel, SshChannel, SshOptions};
pub use config::{SweepFile, Transport};
pub use job::{jobs_for, Job};
pub use notify::{LogNotifier, Notifier, NotifyConfig, WebhookNotifier};
pub use parse::{extract_payload, parse_outcome, PayloadError, SENTINEL};
pub use probe::{admit_hosts, parse_idle_percent, probe_host, ProbeConfig, ProbeVerdict};
pub use scheduler::{BatchReport, Scheduler, SchedulerError};

use anyhow::{anyhow, Context, Result};
use chrono::{Local, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use sweep_core::{
    default_output_path, load_results, merge, save_results, write_manifest, Configuration,
    OutcomeCounts, PersistOptions, ResultSet, RunManifest,
};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only dispatch the first `limit` configurations.
    pub limit: Option<usize>,
    pub output: Option<PathBuf>,
    /// Prior results to merge the new batch into.
    pub previous: Option<PathBuf>,
    pub skip_build: bool,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub job_count: usize,
    pub admitted_hosts: Vec<String>,
    pub jobs_per_host: BTreeMap<String, usize>,
    /// Tallies of this batch only.
    pub batch_counts: OutcomeCounts,
    /// Tallies of the written file, after merging.
    pub total_counts: OutcomeCounts,
    pub results_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
}

pub fn run_build_command(command: &str, dir: &Path) -> Result<()> {
    info!(command = command, dir = %dir.display(), "building project");
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .status()
        .with_context(|| format!("failed to start build command: {}", command))?;
    if !status.success() {
        return Err(anyhow!(
            "build command failed ({}): {}",
            status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            command
        ));
    }
    Ok(())
}

pub fn generate_configurations(
    file: &SweepFile,
    limit: Option<usize>,
) -> Result<Vec<Configuration>> {
    let mut configs = file.configurations()?;
    if let Some(limit) = limit {
        configs.truncate(limit);
    }
    Ok(configs)
}

/// Runs the whole sweep described by `file`.
pub fn run_sweep(file: &SweepFile, options: &RunOptions) -> Result<RunSummary> {
    let configs = generate_configurations(file, options.limit)?;
    info!(count = configs.len(), tag = %file.tag, "generated configurations");
    let previous = options
        .previous
        .as_deref()
        .map(load_results)
        .transpose()?;
    execute(file, configs, previous, options)
}

/// Re-runs only the configurations that failed in `previous_path` and merges
/// the new rows over the old ones.
pub fn retry_failures(
    file: &SweepFile,
    previous_path: &Path,
    options: &RunOptions,
) -> Result<RunSummary> {
    let previous = load_results(previous_path)?;
    let mut failed = previous.failed_configurations();
    if let Some(limit) = options.limit {
        failed.truncate(limit);
    }
    info!(
        failed = failed.len(),
        total = previous.len(),
        path = %previous_path.display(),
        "selected failed configurations"
    );
    if failed.is_empty() {
        return Ok(RunSummary {
            run_id: new_run_id(),
            job_count: 0,
            admitted_hosts: Vec::new(),
            jobs_per_host: BTreeMap::new(),
            batch_counts: OutcomeCounts::default(),
            total_counts: previous.counts(),
            results_path: None,
            manifest_path: None,
        });
    }
    execute(file, failed, Some(previous), options)
}

/// Folds result files left to right with identity-based merging.
pub fn merge_result_files(
    inputs: &[PathBuf],
    output: &Path,
    persist: &PersistOptions,
) -> Result<OutcomeCounts> {
    let mut merged = ResultSet::new();
    for input in inputs {
        let set = load_results(input)?;
        info!(path = %input.display(), records = set.len(), "merging");
        merged = merge(merged, set);
    }
    save_results(output, &merged, persist)?;
    info!(path = %output.display(), records = merged.len(), "merged results saved");
    Ok(merged.counts())
}

fn new_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

fn execute(
    file: &SweepFile,
    configs: Vec<Configuration>,
    previous: Option<ResultSet>,
    options: &RunOptions,
) -> Result<RunSummary> {
    if configs.is_empty() {
        return Err(anyhow!("no configurations to run"));
    }
    if let Some(build) = file.build_command.as_deref() {
        if !options.skip_build {
            run_build_command(build, &file.base_dir)?;
        }
    }

    let run_id = new_run_id();
    let jobs = jobs_for(&configs, &file.command, file.timeout());
    let mut scheduler = Scheduler::new(file.channel(), file.hosts())
        .with_notifier(file.notify.build());
    if let Some(probe) = &file.probe {
        scheduler = scheduler.with_probe(probe.clone());
    }
    let report = scheduler.run(jobs)?;

    let results = match previous {
        Some(old) => merge(old, report.results),
        None => report.results,
    };
    let results_path = match &options.output {
        Some(path) => path.clone(),
        None => default_output_path(&file.resolve(&file.output_dir), &file.tag, Local::now()),
    };
    save_results(&results_path, &results, &file.persist)?;
    let total_counts = results.counts();
    let manifest = RunManifest::new(
        &run_id,
        &file.tag,
        &configs,
        report.admitted_hosts.clone(),
        report.counts,
        &results_path,
    );
    let manifest_path = write_manifest(&results_path, &manifest)?;
    info!(
        path = %results_path.display(),
        records = results.len(),
        "results saved"
    );

    Ok(RunSummary {
        run_id,
        job_count: configs.len(),
        admitted_hosts: report.admitted_hosts,
        jobs_per_host: report.jobs_per_host,
        batch_counts: report.counts,
        total_counts,
        results_path: Some(results_path),
        manifest_path: Some(manifest_path),
    })
}
