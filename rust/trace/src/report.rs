//! Cross-trial aggregation and export.
//!
//! Walks transferred artifact directories for `metadata.json` sidecars, runs
//! [`compute_metrics`] over every trace a sidecar lists, and averages the
//! results per (model, parallelism, batch).

use std::{
    collections::{BTreeMap, HashMap},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sweep_config::TrialSpec;

use crate::{
    event::TraceError,
    load::load_trace,
    metrics::{MetricsConfig, MetricsResult, OpTraffic, compute_metrics},
};

/// The part of an artifact sidecar the report needs.
#[derive(Debug, Clone, Deserialize)]
struct Sidecar {
    trial_id: String,
    spec: TrialSpec,
    #[serde(default)]
    trace_files: Vec<String>,
}

/// Metrics for one trace of one trial.
#[derive(Debug, Clone)]
pub struct TrialMetrics {
    pub trial_id: String,
    pub spec: TrialSpec,
    pub trace_file: PathBuf,
    pub metrics: MetricsResult,
}

/// Averaged metrics for one (model, parallelism, batch) key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryEntry {
    pub model_id: String,
    pub parallelism: usize,
    pub batch_size: usize,
    /// Number of traces averaged into this entry.
    pub samples: usize,
    pub time_to_first_output: Option<f64>,
    pub time_per_output_step: Option<f64>,
    pub time_per_output_step_std: Option<f64>,
    pub communication_ratio: Option<f64>,
    pub bandwidth_mean: Option<f64>,
    pub bandwidth_aggregate: Option<f64>,
    pub utilization: Option<f64>,
    pub burstiness: Option<f64>,
    pub idle_time: f64,
    pub span: f64,
    /// Traffic totals across all samples, in first-occurrence order.
    pub traffic: Vec<OpTraffic>,
}

/// Aggregated report over a set of trials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryReport {
    pub generated_at: String,
    pub entries: Vec<SummaryEntry>,
}

/// Load and measure every trace referenced by sidecars under `root`.
///
/// Traces that fail to load are logged and left out.
pub fn collect(root: impl AsRef<Path>, config: &MetricsConfig) -> Result<Vec<TrialMetrics>, ReportError> {
    let root = root.as_ref();
    let pattern = format!(
        "{}/**/metadata.json",
        glob::Pattern::escape(&root.display().to_string())
    );
    let mut sidecars: Vec<PathBuf> = glob::glob(&pattern)?
        .filter_map(std::result::Result::ok)
        .collect();
    sidecars.sort();

    let mut trials = Vec::new();
    for sidecar_path in sidecars {
        let content = std::fs::read_to_string(&sidecar_path)
            .map_err(|e| ReportError::Io(sidecar_path.clone(), e))?;
        let sidecar: Sidecar = serde_json::from_str(&content)
            .map_err(|e| ReportError::Parse(sidecar_path.clone(), e.to_string()))?;
        let dir = sidecar_path.parent().unwrap_or(root);

        if sidecar.trace_files.is_empty() {
            tracing::warn!("{}: sidecar lists no trace files", sidecar.trial_id);
        }
        for file in &sidecar.trace_files {
            let path = dir.join(file);
            match load_trace(&path) {
                Ok(trace) => trials.push(TrialMetrics {
                    trial_id: sidecar.trial_id.clone(),
                    spec: sidecar.spec.clone(),
                    metrics: compute_metrics(&trace, config),
                    trace_file: path,
                }),
                Err(e) => tracing::warn!("{}: skipping trace: {e}", sidecar.trial_id),
            }
        }
    }
    Ok(trials)
}

/// [`collect`] followed by [`SummaryReport::from_trials`].
pub fn analyze_dir(root: impl AsRef<Path>, config: &MetricsConfig) -> Result<SummaryReport, ReportError> {
    let root = root.as_ref();
    let trials = collect(root, config)?;
    if trials.is_empty() {
        return Err(ReportError::Empty(root.to_path_buf()));
    }
    Ok(SummaryReport::from_trials(&trials))
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn mean_of<F>(samples: &[&MetricsResult], f: F) -> Option<f64>
where
    F: Fn(&MetricsResult) -> Option<f64>,
{
    mean(samples.iter().filter_map(|m| f(m)))
}

fn merge_traffic(samples: &[&MetricsResult]) -> Vec<OpTraffic> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<OpTraffic> = Vec::new();
    for op in samples.iter().flat_map(|m| &m.traffic) {
        if let Some(&i) = index.get(&op.op_name) {
            merged[i].bytes += op.bytes;
            merged[i].count += op.count;
            merged[i].total_duration += op.total_duration;
        } else {
            index.insert(op.op_name.clone(), merged.len());
            merged.push(op.clone());
        }
    }
    merged
}

impl SummaryEntry {
    fn from_samples(key: &(String, usize, usize), samples: &[&MetricsResult]) -> Self {
        Self {
            model_id: key.0.clone(),
            parallelism: key.1,
            batch_size: key.2,
            samples: samples.len(),
            time_to_first_output: mean_of(samples, |m| m.time_to_first_output),
            time_per_output_step: mean_of(samples, |m| {
                m.time_per_output_step.as_ref().map(|d| d.mean)
            }),
            time_per_output_step_std: mean_of(samples, |m| {
                m.time_per_output_step.as_ref().map(|d| d.std)
            }),
            communication_ratio: mean_of(samples, |m| m.communication_ratio),
            bandwidth_mean: mean_of(samples, |m| m.bandwidth.as_ref().map(|b| b.per_event.mean)),
            bandwidth_aggregate: mean_of(samples, |m| m.bandwidth.as_ref().map(|b| b.aggregate)),
            utilization: mean_of(samples, |m| m.bandwidth.as_ref().and_then(|b| b.utilization)),
            burstiness: mean_of(samples, |m| {
                m.intervals.as_ref().and_then(|i| i.coefficient_of_variation)
            }),
            idle_time: mean_of(samples, |m| Some(m.idle_time)).unwrap_or(0.0),
            span: mean_of(samples, |m| Some(m.span)).unwrap_or(0.0),
            traffic: merge_traffic(samples),
        }
    }
}

impl SummaryReport {
    /// Group trials by (model, parallelism, batch), sorted by that key.
    #[must_use]
    pub fn from_trials(trials: &[TrialMetrics]) -> Self {
        let mut groups: BTreeMap<(String, usize, usize), Vec<&MetricsResult>> = BTreeMap::new();
        for trial in trials {
            groups
                .entry((
                    trial.spec.model_id.clone(),
                    trial.spec.parallelism,
                    trial.spec.batch_size,
                ))
                .or_default()
                .push(&trial.metrics);
        }
        Self {
            generated_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            entries: groups
                .iter()
                .map(|(key, samples)| SummaryEntry::from_samples(key, samples))
                .collect(),
        }
    }

    /// Read a previously written `summary.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ReportError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| ReportError::Parse(path.to_path_buf(), e.to_string()))
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ReportError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, json + "\n").map_err(|e| ReportError::Io(path.to_path_buf(), e))
    }

    /// One row per key with the averaged scalar metrics.
    pub fn write_summary_csv(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let path = path.as_ref();
        let io_err = |e| ReportError::Io(path.to_path_buf(), e);
        let mut f = std::fs::File::create(path).map_err(io_err)?;
        writeln!(
            f,
            "model,parallelism,batch_size,samples,ttft,tpot_mean,tpot_std,comm_ratio,\
             bandwidth_mean,bandwidth_aggregate,utilization,burstiness,idle_time,span"
        )
        .map_err(io_err)?;
        for e in &self.entries {
            writeln!(
                f,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                escape_csv(&e.model_id),
                e.parallelism,
                e.batch_size,
                e.samples,
                opt(e.time_to_first_output),
                opt(e.time_per_output_step),
                opt(e.time_per_output_step_std),
                opt(e.communication_ratio),
                opt(e.bandwidth_mean),
                opt(e.bandwidth_aggregate),
                opt(e.utilization),
                opt(e.burstiness),
                e.idle_time,
                e.span,
            )
            .map_err(io_err)?;
        }
        Ok(())
    }

    /// Long form: one row per (key, communication op).
    pub fn write_communication_csv(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let path = path.as_ref();
        let io_err = |e| ReportError::Io(path.to_path_buf(), e);
        let mut f = std::fs::File::create(path).map_err(io_err)?;
        writeln!(f, "model,parallelism,batch_size,op_name,bytes,count,total_duration")
            .map_err(io_err)?;
        for e in &self.entries {
            for op in &e.traffic {
                writeln!(
                    f,
                    "{},{},{},{},{},{},{}",
                    escape_csv(&e.model_id),
                    e.parallelism,
                    e.batch_size,
                    escape_csv(&op.op_name),
                    op.bytes,
                    op.count,
                    op.total_duration,
                )
                .map_err(io_err)?;
            }
        }
        Ok(())
    }

    /// Write `summary.json`, `summary.csv` and `communication.csv` into `dir`.
    pub fn write_all(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, ReportError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| ReportError::Io(dir.to_path_buf(), e))?;
        let json = dir.join("summary.json");
        let summary = dir.join("summary.csv");
        let comm = dir.join("communication.csv");
        self.write_json(&json)?;
        self.write_summary_csv(&summary)?;
        self.write_communication_csv(&comm)?;
        Ok(vec![json, summary, comm])
    }

    /// Fixed-width table for terminal output.
    #[must_use]
    pub fn render_table(&self) -> String {
        let width = self
            .entries
            .iter()
            .map(|e| e.model_id.len())
            .max()
            .unwrap_or(5)
            .max(5);
        let mut out = format!(
            "{:width$}  {:>3}  {:>5}  {:>3}  {:>12}  {:>12}  {:>10}  {:>12}\n",
            "model", "tp", "batch", "n", "ttft", "tpot", "comm", "bandwidth"
        );
        for e in &self.entries {
            out.push_str(&format!(
                "{:width$}  {:>3}  {:>5}  {:>3}  {:>12}  {:>12}  {:>10}  {:>12}\n",
                e.model_id,
                e.parallelism,
                e.batch_size,
                e.samples,
                fixed(e.time_to_first_output, 3),
                fixed(e.time_per_output_step, 3),
                fixed(e.communication_ratio, 4),
                fixed(e.bandwidth_mean, 2),
            ));
        }
        out
    }
}

fn opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x}")).unwrap_or_default()
}

fn fixed(v: Option<f64>, precision: usize) -> String {
    v.map_or_else(|| "-".to_string(), |x| format!("{x:.precision$}"))
}

fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Errors raised while building or writing a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),
    #[error("failed to read/write {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, String),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("no trial artifacts with traces found under {0}")]
    Empty(PathBuf),
}
