use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use sweep_core::{atomic_write_bytes, OutcomeCounts, PersistOptions};
use sweep_runner::{ProbeConfig, ProbeVerdict, RunOptions, RunSummary, SweepFile};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version = "0.3.0", about = "Distributed experiment sweep runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand the sweep file into its configuration list.
    Generate {
        sweep: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run the health probe against every configured host.
    Probe {
        sweep: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Run {
        sweep: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Merge the new batch into this earlier results file.
        #[arg(long)]
        previous: Option<PathBuf>,
        #[arg(long)]
        skip_build: bool,
        #[arg(long)]
        json: bool,
    },
    /// Re-run only the failed configurations of an earlier results file.
    Retry {
        sweep: PathBuf,
        #[arg(long)]
        previous: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        skip_build: bool,
        #[arg(long)]
        json: bool,
    },
    Merge {
        #[arg(short, long = "inputs", num_args = 1.., required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long, default_value = "merged_results.json")]
        output: PathBuf,
        #[arg(long = "drop-field")]
        drop_fields: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
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
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Generate {
            sweep,
            limit,
            out,
            json,
        } => {
            let file = SweepFile::load(&sweep)?;
            let configs = sweep_runner::generate_configurations(&file, limit)?;
            let configs_json = serde_json::to_value(&configs)?;
            if let Some(out) = &out {
                atomic_write_bytes(out, &serde_json::to_vec_pretty(&configs_json)?)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate",
                    "count": configs.len(),
                    "out": out.as_ref().map(|p| p.display().to_string()),
                    "configurations": configs_json,
                })));
            }
            match &out {
                Some(out) => {
                    println!("configurations: {}", configs.len());
                    println!("wrote: {}", out.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&configs_json)?),
            }
        }
        Commands::Probe { sweep, json } => {
            let file = SweepFile::load(&sweep)?;
            let probe = file.probe.clone().unwrap_or_else(ProbeConfig::default);
            let channel = file.channel();
            let mut rows = Vec::new();
            for host in file.hosts() {
                let verdict = sweep_runner::probe_host(channel.as_ref(), &host, &probe);
                rows.push((host.name, verdict));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "probe",
                    "min_idle_percent": probe.min_idle_percent,
                    "hosts": rows.iter().map(|(h, v)| verdict_to_json(h, v)).collect::<Vec<_>>(),
                })));
            }
            for (host, verdict) in &rows {
                println!("{}: {}", host, verdict_text(verdict));
            }
        }
        Commands::Run {
            sweep,
            limit,
            out,
            previous,
            skip_build,
            json,
        } => {
            let file = SweepFile::load(&sweep)?;
            let options = RunOptions {
                limit,
                output: out,
                previous,
                skip_build,
            };
            let summary = sweep_runner::run_sweep(&file, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": summary_to_json(&summary),
                })));
            }
            print_summary(&summary);
        }
        Commands::Retry {
            sweep,
            previous,
            limit,
            out,
            skip_build,
            json,
        } => {
            let file = SweepFile::load(&sweep)?;
            let options = RunOptions {
                limit,
                output: out,
                previous: None,
                skip_build,
            };
            let summary = sweep_runner::retry_failures(&file, &previous, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "retry",
                    "previous": previous.display().to_string(),
                    "run": summary_to_json(&summary),
                })));
            }
            if summary.job_count == 0 {
                println!("nothing to retry: {}", previous.display());
            }
            print_summary(&summary);
        }
        Commands::Merge {
            inputs,
            output,
            drop_fields,
            json,
        } => {
            let persist = PersistOptions { drop_fields };
            let counts = sweep_runner::merge_result_files(&inputs, &output, &persist)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "merge",
                    "inputs": inputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                    "output": output.display().to_string(),
                    "counts": counts_to_json(&counts),
                })));
            }
            println!("merged: {}", inputs.len());
            println!("records: {}", counts.total);
            println!("wrote: {}", output.display());
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
        Commands::Generate { json, .. }
        | Commands::Probe { json, .. }
        | Commands::Run { json, .. }
        | Commands::Retry { json, .. }
        | Commands::Merge { json, .. } => *json,
    }
}

fn counts_to_json(counts: &OutcomeCounts) -> Value {
    json!({
        "total": counts.total,
        "succeeded": counts.succeeded,
        "timed_out": counts.timed_out,
        "failed": counts.failed,
    })
}

fn summary_to_json(summary: &RunSummary) -> Value {
    json!({
        "run_id": summary.run_id,
        "job_count": summary.job_count,
        "admitted_hosts": summary.admitted_hosts,
        "jobs_per_host": summary.jobs_per_host,
        "batch": counts_to_json(&summary.batch_counts),
        "total": counts_to_json(&summary.total_counts),
        "results_path": summary.results_path.as_ref().map(|p| p.display().to_string()),
        "manifest_path": summary.manifest_path.as_ref().map(|p| p.display().to_string()),
    })
}

fn print_summary(summary: &RunSummary) {
    println!("run_id: {}", summary.run_id);
    println!("jobs: {}", summary.job_count);
    if !summary.admitted_hosts.is_empty() {
        println!("hosts: {}", summary.admitted_hosts.join(", "));
    }
    for (host, count) in &summary.jobs_per_host {
        println!("  {}: {} jobs", host, count);
    }
    println!(
        "batch: {} succeeded, {} timed out, {} failed",
        summary.batch_counts.succeeded, summary.batch_counts.timed_out, summary.batch_counts.failed
    );
    println!(
        "total: {} succeeded, {} timed out, {} failed of {}",
        summary.total_counts.succeeded,
        summary.total_counts.timed_out,
        summary.total_counts.failed,
        summary.total_counts.total
    );
    if let Some(path) = &summary.results_path {
        println!("results: {}", path.display());
    }
    if let Some(path) = &summary.manifest_path {
        println!("manifest: {}", path.display());
    }
}

fn verdict_text(verdict: &ProbeVerdict) -> String {
    match verdict {
        ProbeVerdict::Idle(idle) => format!("idle {}%", idle),
        ProbeVerdict::Busy(idle) => format!("busy (idle {}%)", idle),
        ProbeVerdict::Unreadable(output) => format!("unreadable probe output: {}", output),
        ProbeVerdict::Unreachable(kind) => format!("unreachable ({})", kind),
    }
}

fn verdict_to_json(host: &str, verdict: &ProbeVerdict) -> Value {
    let idle = match verdict {
        ProbeVerdict::Idle(idle) | ProbeVerdict::Busy(idle) => Some(*idle),
        _ => None,
    };
    json!({
        "host": host,
        "admitted": verdict.admitted(),
        "idle_percent": idle,
        "detail": verdict_text(verdict),
    })
}
