#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

//! Trace metrics engine.
//!
//! Parses traces recorded during inference trials and derives latency,
//! per-step timing and inter-device communication statistics from them.

pub mod event;
pub mod load;
pub mod metrics;
pub mod report;

pub use event::{Category, Trace, TraceError, TraceEvent};
pub use load::{is_trace_file, load_trace, parse_trace};
pub use metrics::{
    BandwidthStats, Distribution, IntervalStats, MetricsConfig, MetricsResult, OpTraffic,
    compute_metrics,
};
pub use report::{ReportError, SummaryEntry, SummaryReport, TrialMetrics, analyze_dir, collect};
