#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

//! Accelerator Inference Sweep Harness
//!
//! Enumerates (model, parallelism, batch) trials, runs them one at a time on
//! a remote execution context, retries infrastructure failures, skips
//! configurations that cannot fit, moves traces home and checkpoints every
//! resolved trial so an interrupted sweep picks up where it stopped.

pub mod budget;
pub mod classify;
pub mod clock;
pub mod config;
pub mod enumerate;
pub mod host;
pub mod policy;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod template;
pub mod transfer;

pub use budget::TimeoutEstimator;
pub use classify::{Classification, FailureKind, SignatureClassifier, SignatureRule};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HarnessConfig, SweepDescription};
pub use enumerate::{PlannedTrial, Validity, enumerate};
pub use host::{CommandProbe, HealthProbe, Host, ProbeSchedule, await_ready};
pub use policy::{AttemptState, OomFrontier, RetryPolicy, Verdict};
pub use runner::{CommandContext, ExecutionContext, LaunchOutput, TrialExecutor, TrialResult};
pub use scheduler::{Scheduler, SweepSummary};
pub use state::{CheckpointEntry, CheckpointStore};
pub use transfer::{ArtifactMetadata, CommandHop, Hop, TransferPipeline};
