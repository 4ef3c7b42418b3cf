//! Benchmark metrics derived from a single trace.
//!
//! Everything here is a pure function of the trace and [`MetricsConfig`]:
//! sums run in event order and grouping preserves first-occurrence order, so
//! recomputing from the same input gives bit-identical results.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::{Category, Trace, TraceEvent};

/// Knobs for metric computation.
#[derive(Clone, Debug, Default)]
pub struct MetricsConfig {
    /// Peak link bandwidth in bytes per trace time unit. Enables utilization.
    pub peak_bandwidth: Option<f64>,
    /// Compute ops whose name matches are treated as output-producing, in
    /// addition to events carrying the `output` flag.
    pub output_op: Option<Regex>,
}

impl MetricsConfig {
    fn is_output(&self, event: &TraceEvent) -> bool {
        event.category == Category::Compute
            && (event.output
                || self
                    .output_op
                    .as_ref()
                    .is_some_and(|re| re.is_match(&event.op_name)))
    }
}

/// Summary statistics over a sample set.
///
/// Variance is the sample variance (n - 1 denominator) and is zero for a
/// single sample.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Distribution {
    pub count: usize,
    pub mean: f64,
    pub variance: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl Distribution {
    #[must_use]
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = if samples.len() > 1 {
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count: samples.len(),
            mean,
            variance,
            std: variance.sqrt(),
            min,
            max,
        })
    }
}

/// Achieved bandwidth of communication events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BandwidthStats {
    /// Per-event bytes / duration.
    pub per_event: Distribution,
    /// Total bytes / total duration over the same events.
    pub aggregate: f64,
    /// `per_event.mean / peak_bandwidth`, when a peak is configured.
    pub utilization: Option<f64>,
}

/// Traffic attributed to one communication op.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OpTraffic {
    pub op_name: String,
    /// Sum of known byte counts.
    pub bytes: u64,
    pub count: usize,
    pub total_duration: f64,
}

/// Gaps between the starts of consecutive communication events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IntervalStats {
    pub gaps: Distribution,
    /// `std / mean`; high values mean bursty traffic. `None` when the mean gap is zero.
    pub coefficient_of_variation: Option<f64>,
}

/// Metrics for one trace.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricsResult {
    pub event_count: usize,
    pub compute_events: usize,
    pub communication_events: usize,
    pub output_events: usize,
    /// From submission (or earliest start) to the latest event end.
    pub span: f64,
    pub compute_time: f64,
    pub communication_time: f64,
    pub time_to_first_output: Option<f64>,
    pub time_per_output_step: Option<Distribution>,
    /// Communication time over compute time; `Some(0.0)` without communication,
    /// `None` when there is communication but no compute to compare against.
    pub communication_ratio: Option<f64>,
    pub bandwidth: Option<BandwidthStats>,
    pub traffic: Vec<OpTraffic>,
    pub intervals: Option<IntervalStats>,
    pub idle_time: f64,
}

/// Compute all metrics for `trace`.
#[must_use]
pub fn compute_metrics(trace: &Trace, config: &MetricsConfig) -> MetricsResult {
    let events = &trace.events;
    let origin = trace
        .submitted_at
        .or_else(|| events.iter().map(|e| e.start).reduce(f64::min));
    let window_end = events.iter().map(TraceEvent::end).reduce(f64::max);

    let compute: Vec<&TraceEvent> = events
        .iter()
        .filter(|e| e.category == Category::Compute)
        .collect();
    let comm: Vec<&TraceEvent> = events
        .iter()
        .filter(|e| e.category == Category::Communication)
        .collect();

    let compute_time: f64 = compute.iter().map(|e| e.duration).sum();
    let communication_time: f64 = comm.iter().map(|e| e.duration).sum();

    let outputs: Vec<&TraceEvent> = events.iter().filter(|e| config.is_output(e)).collect();
    let time_to_first_output = match (
        outputs.iter().map(|e| e.end()).reduce(f64::min),
        origin,
    ) {
        (Some(first), Some(origin)) => Some(first - origin),
        _ => None,
    };

    // Sharded steps emit their output op on every device; time steps on one.
    let step_device = outputs.iter().map(|e| e.device_id).min();
    let mut step_ends: Vec<f64> = outputs
        .iter()
        .filter(|e| Some(e.device_id) == step_device)
        .map(|e| e.end())
        .collect();
    step_ends.sort_by(f64::total_cmp);
    let steps: Vec<f64> = step_ends.windows(2).map(|w| w[1] - w[0]).collect();

    let span = match (origin, window_end) {
        (Some(start), Some(end)) => (end - start).max(0.0),
        _ => 0.0,
    };
    let idle_time = match origin {
        Some(start) => (span - busy_time(events, start)).max(0.0),
        None => 0.0,
    };

    MetricsResult {
        event_count: events.len(),
        compute_events: compute.len(),
        communication_events: comm.len(),
        output_events: outputs.len(),
        span,
        compute_time,
        communication_time,
        time_to_first_output,
        time_per_output_step: Distribution::from_samples(&steps),
        communication_ratio: communication_ratio(comm.len(), communication_time, compute_time),
        bandwidth: bandwidth(&comm, config.peak_bandwidth),
        traffic: traffic_by_op(&comm),
        intervals: intervals(&comm),
        idle_time,
    }
}

fn communication_ratio(comm_events: usize, comm_time: f64, compute_time: f64) -> Option<f64> {
    if comm_events == 0 {
        Some(0.0)
    } else if compute_time > 0.0 {
        Some(comm_time / compute_time)
    } else {
        None
    }
}

fn bandwidth(comm: &[&TraceEvent], peak: Option<f64>) -> Option<BandwidthStats> {
    let measured: Vec<(u64, f64)> = comm
        .iter()
        .filter(|e| e.duration > 0.0)
        .filter_map(|e| e.bytes_transferred.map(|b| (b, e.duration)))
        .collect();
    let rates: Vec<f64> = measured.iter().map(|(b, d)| *b as f64 / d).collect();
    let per_event = Distribution::from_samples(&rates)?;

    let total_bytes: f64 = measured.iter().map(|(b, _)| *b as f64).sum();
    let total_duration: f64 = measured.iter().map(|(_, d)| d).sum();
    let utilization = peak.filter(|p| *p > 0.0).map(|p| per_event.mean / p);

    Some(BandwidthStats {
        aggregate: total_bytes / total_duration,
        per_event,
        utilization,
    })
}

fn traffic_by_op(comm: &[&TraceEvent]) -> Vec<OpTraffic> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut traffic: Vec<OpTraffic> = Vec::new();
    for event in comm {
        let slot = *index.entry(event.op_name.as_str()).or_insert_with(|| {
            traffic.push(OpTraffic {
                op_name: event.op_name.clone(),
                bytes: 0,
                count: 0,
                total_duration: 0.0,
            });
            traffic.len() - 1
        });
        let entry = &mut traffic[slot];
        entry.bytes += event.bytes_transferred.unwrap_or(0);
        entry.count += 1;
        entry.total_duration += event.duration;
    }
    traffic
}

fn intervals(comm: &[&TraceEvent]) -> Option<IntervalStats> {
    let gaps: Vec<f64> = comm.windows(2).map(|w| w[1].start - w[0].start).collect();
    let gaps = Distribution::from_samples(&gaps)?;
    let coefficient_of_variation = (gaps.mean > 0.0).then(|| gaps.std / gaps.mean);
    Some(IntervalStats {
        gaps,
        coefficient_of_variation,
    })
}

/// Length of the union of compute and communication intervals, across all
/// devices, clipped to start at `origin`.
fn busy_time(events: &[TraceEvent], origin: f64) -> f64 {
    let mut intervals: Vec<(f64, f64)> = events
        .iter()
        .filter(|e| e.category != Category::Idle)
        .map(|e| (e.start.max(origin), e.end()))
        .filter(|(s, e)| e > s)
        .collect();
    intervals.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut busy = 0.0;
    let mut current: Option<(f64, f64)> = None;
    for (start, end) in intervals {
        current = match current {
            Some((cs, ce)) if start <= ce => Some((cs, ce.max(end))),
            Some((cs, ce)) => {
                busy += ce - cs;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((cs, ce)) = current {
        busy += ce - cs;
    }
    busy
}
