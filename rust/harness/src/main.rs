//! Sweep Harness CLI
//!
//! Runs resumable inference benchmark sweeps on accelerator hosts and turns
//! the collected traces into comparison reports.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use regex::Regex;
use sweep_config::TrialStatus;
use sweep_harness::{
    TimeoutEstimator,
    config::HarnessConfig,
    enumerate::{Validity, enumerate},
    host::Host,
    scheduler::Scheduler,
    state::{CheckpointStore, now_timestamp},
};
use sweep_trace::{MetricsConfig, MetricsResult, SummaryReport, analyze_dir, compute_metrics, load_trace};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sweep-harness", about = "Accelerator inference sweep harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) a sweep
    RunSweep {
        /// Path to the sweep description
        #[arg(default_value = "sweep.toml")]
        config: String,
    },

    /// Compute metrics for a trace, an artifact directory or a saved summary.json
    Analyze {
        /// Trace file, artifact root directory, or summary.json
        input: PathBuf,

        /// Write summary.json, summary.csv and communication.csv here
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Peak link bandwidth (bytes per trace time unit) for utilization
        #[arg(long)]
        peak_bandwidth: Option<f64>,

        /// Regex naming output-producing compute ops
        #[arg(long)]
        output_op: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the planned trials without running anything
    Plan {
        /// Path to the sweep description
        #[arg(default_value = "sweep.toml")]
        config: String,
    },

    /// Show checkpointed trial status
    Status {
        /// Path to the checkpoint file
        #[arg(short, long, default_value = "./sweep_checkpoint.jsonl")]
        checkpoint: String,

        /// Only list trials with this status
        #[arg(long, value_enum)]
        only: Option<TrialStatus>,
    },

    /// Mark trials pending so the next run executes them again
    Reset {
        /// Path to the checkpoint file
        #[arg(short, long, default_value = "./sweep_checkpoint.jsonl")]
        checkpoint: String,

        /// Trial ids to reset
        trials: Vec<String>,
    },

    /// Rewrite the checkpoint log with one entry per trial
    Compact {
        /// Path to the checkpoint file
        #[arg(short, long, default_value = "./sweep_checkpoint.jsonl")]
        checkpoint: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::RunSweep { config } => run_sweep(&config).await,

        Commands::Analyze {
            input,
            out,
            peak_bandwidth,
            output_op,
            json,
        } => {
            let metrics_config = MetricsConfig {
                peak_bandwidth,
                output_op: output_op.as_deref().map(Regex::new).transpose()?,
            };
            analyze(&input, out.as_deref(), &metrics_config, json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Plan { config } => {
            plan(&config)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status { checkpoint, only } => {
            let store = CheckpointStore::new(&checkpoint);
            let snapshot = store.load()?;

            if snapshot.is_empty() {
                println!("No trials in checkpoint file.");
                return Ok(ExitCode::SUCCESS);
            }

            println!("=== Trial Status ===");
            println!();

            let mut entries: Vec<_> = snapshot
                .entries()
                .filter(|e| only.is_none_or(|s| e.status == s))
                .collect();
            entries.sort_by(|a, b| a.trial_id.cmp(&b.trial_id));

            for entry in &entries {
                print!("{}: {}", entry.trial_id, entry.status.label());
                if entry.attempts > 1 {
                    print!(" [attempts: {}]", entry.attempts);
                }
                println!(" ({})", entry.recorded_at);
            }

            println!();
            println!("{} trial(s), {} log line(s)", entries.len(), snapshot.lines);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Reset { checkpoint, trials } => Ok(reset(&checkpoint, &trials)),

        Commands::Compact { checkpoint } => {
            let store = CheckpointStore::new(&checkpoint);
            let kept = store.compact()?;
            println!("Compacted {checkpoint}: {kept} entries");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_sweep(config: &str) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let harness_config = HarnessConfig::load(config)?;
    let settings = &harness_config.harness;

    let host = Host::new(
        settings.context.host.as_str(),
        settings.host.stop_on_complete,
        settings.host.stop.clone(),
    );

    // Check host stop config and fail early if misconfigured
    if let Some(warning) = host.check_config() {
        eprintln!("ERROR: {warning}");
        eprintln!("Fix the configuration or set [harness.host] stop_on_complete = false");
        return Err(warning.into());
    }

    println!("Starting sweep with config: {config}");
    if host.is_available() {
        println!("Host stop on completion: enabled");
    }

    let trials = enumerate(&harness_config.sweep);
    let store = CheckpointStore::new(&settings.checkpoint_file);
    let scheduler = Scheduler::from_config(&harness_config, &store)?.with_progress(true);
    let summary = scheduler.run(&trials).await?;

    println!();
    println!("=== Sweep Complete ===");
    for outcome in &summary.outcomes {
        let status = if outcome.status == TrialStatus::Pending {
            "DEFERRED (unknown error)"
        } else {
            outcome.status.label()
        };
        let previous = if outcome.previously_resolved {
            " [previous run]"
        } else {
            ""
        };
        match outcome.artifact_path {
            Some(ref path) => {
                println!("{}: {status}{previous} -> {}", outcome.trial_id, path.display());
            }
            None => println!("{}: {status}{previous}", outcome.trial_id),
        }
    }
    println!();
    println!("Total: {}", summary.total);
    println!("Succeeded: {}", summary.succeeded);
    println!("Skipped (invalid): {}", summary.skipped_invalid);
    println!("Skipped (oom): {}", summary.skipped_oom);
    println!("Failed: {}", summary.failed);
    println!("Deferred: {}", summary.deferred);
    println!("Previously resolved: {}", summary.previously_resolved);
    println!("Executions: {}", summary.executions);

    if !summary.is_clean() {
        return Ok(ExitCode::FAILURE);
    }

    // Stop the host if enabled and everything resolved
    if host.is_available() {
        println!();
        println!("All trials resolved. Stopping host {}...", host.name());
        if let Err(e) = host.stop() {
            eprintln!("Warning: Failed to stop host: {e}");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Reset each trial; fails if any of them could not be reset.
fn reset(checkpoint: &str, trials: &[String]) -> ExitCode {
    let store = CheckpointStore::new(checkpoint);
    let ts = now_timestamp();
    let mut errors = 0;

    for trial_id in trials {
        match store.reset(trial_id, &ts) {
            Ok(true) => println!("Reset: {trial_id}"),
            Ok(false) => println!("Not found: {trial_id}"),
            Err(e) => {
                eprintln!("Error resetting {trial_id}: {e}");
                errors += 1;
            }
        }
    }

    if errors > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn plan(config: &str) -> Result<(), Box<dyn std::error::Error>> {
    let harness_config = HarnessConfig::load(config)?;
    let settings = &harness_config.harness;
    let snapshot = CheckpointStore::new(&settings.checkpoint_file).load()?;
    let budget = TimeoutEstimator {
        base_secs: settings.timeout_base_secs,
        secs_per_billion_params: settings.timeout_secs_per_billion_params,
        ..TimeoutEstimator::default()
    };

    let trials = enumerate(&harness_config.sweep);
    println!("=== Sweep Plan ({} trials) ===", trials.len());

    for model in &harness_config.sweep.models {
        println!();
        println!(
            "{} (fan-out {}, timeout {}s)",
            model.id,
            model.fan_out,
            budget.timeout(model).as_secs()
        );

        let mut last_degree = None;
        for trial in trials.iter().filter(|t| t.spec.model_id == model.id) {
            let degree = trial.spec.parallelism;
            if last_degree != Some(degree) {
                last_degree = Some(degree);
                match budget.weights_per_device(model, degree) {
                    Some(estimate) => println!("  tp{degree}: {}", estimate.breakdown()),
                    None => println!("  tp{degree}"),
                }
            }

            let id = trial.spec.id();
            let status = match &trial.validity {
                Validity::Invalid { reason } => format!("SKIPPED (invalid: {reason})"),
                Validity::Valid => snapshot
                    .status(&id)
                    .map_or("PENDING", TrialStatus::label)
                    .to_string(),
            };
            println!("    {id}: {status}");
        }
    }

    let runnable = trials
        .iter()
        .filter(|t| t.is_valid())
        .filter(|t| {
            !snapshot.status(&t.spec.id()).is_some_and(|s| {
                matches!(
                    s,
                    TrialStatus::Succeeded | TrialStatus::SkippedOom | TrialStatus::SkippedInvalid
                )
            })
        })
        .count();
    println!();
    println!("{runnable} trial(s) left to run");
    Ok(())
}

fn analyze(
    input: &Path,
    out: Option<&Path>,
    config: &MetricsConfig,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let is_summary = input
        .file_name()
        .is_some_and(|name| name == "summary.json");

    let report = if input.is_dir() {
        analyze_dir(input, config)?
    } else if is_summary {
        SummaryReport::load(input)?
    } else {
        let trace = load_trace(input)?;
        let metrics = compute_metrics(&trace, config);
        if json {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        } else {
            print_metrics(input, &metrics);
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render_table());
    }

    if let Some(dir) = out {
        for path in report.write_all(dir)? {
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

fn print_metrics(path: &Path, metrics: &MetricsResult) {
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));

    println!("=== {} ===", path.display());
    println!(
        "Events: {} ({} compute, {} communication, {} output)",
        metrics.event_count,
        metrics.compute_events,
        metrics.communication_events,
        metrics.output_events
    );
    println!("Span: {:.3}", metrics.span);
    println!("Time to first output: {}", fmt(metrics.time_to_first_output));
    if let Some(ref tpot) = metrics.time_per_output_step {
        println!(
            "Time per output step: mean {:.3}, std {:.3}, min {:.3}, max {:.3} (n={})",
            tpot.mean, tpot.std, tpot.min, tpot.max, tpot.count
        );
    }
    println!("Communication ratio: {}", fmt(metrics.communication_ratio));
    if let Some(ref bw) = metrics.bandwidth {
        println!(
            "Bandwidth: mean {:.3}, aggregate {:.3}, utilization {}",
            bw.per_event.mean,
            bw.aggregate,
            fmt(bw.utilization)
        );
    }
    if let Some(ref intervals) = metrics.intervals {
        println!(
            "Traffic burstiness (CV): {}",
            fmt(intervals.coefficient_of_variation)
        );
    }
    println!("Idle time: {:.3}", metrics.idle_time);
    if !metrics.traffic.is_empty() {
        println!();
        println!("{:<32} {:>16} {:>8} {:>14}", "op", "bytes", "count", "duration");
        for op in &metrics.traffic {
            println!(
                "{:<32} {:>16} {:>8} {:>14.3}",
                op.op_name, op.bytes, op.count, op.total_duration
            );
        }
    }
}
