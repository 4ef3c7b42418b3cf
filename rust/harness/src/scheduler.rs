//! The sweep loop.
//!
//! Trials run one at a time in enumeration order: every trial claims the
//! whole accelerator group. Each trial is filtered against the checkpoint
//! and the OOM frontier, then driven through its [`AttemptState`] until it
//! reaches a terminal status or is deferred.

use std::{path::PathBuf, sync::Arc, time::Duration};

use indicatif::{ProgressBar, ProgressStyle};
use sweep_config::{TrialSpec, TrialStatus};

use crate::{
    budget::TimeoutEstimator,
    classify::FailureKind,
    clock::{Clock, SystemClock},
    config::{ConfigError, HarnessConfig},
    enumerate::{PlannedTrial, Validity},
    host::{CommandProbe, HealthProbe, HostError, ProbeSchedule, await_ready},
    policy::{AttemptState, OomFrontier, Phase, RetryPolicy, Verdict},
    runner::{CommandContext, ExecutorError, TrialExecutor, TrialResult},
    state::{CheckpointError, CheckpointSnapshot, CheckpointStore, now_timestamp},
    transfer::{CommandHop, Hop, TransferError, TransferPipeline, read_metadata},
};

/// Drives a planned sweep to completion.
pub struct Scheduler<'a> {
    store: &'a CheckpointStore,
    executor: TrialExecutor,
    transfer: TransferPipeline,
    probe: Option<Box<dyn HealthProbe>>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    probe_schedule: ProbeSchedule,
    settle_grace: Duration,
    show_progress: bool,
}

/// Terminal status of one planned trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecOutcome {
    pub trial_id: String,
    /// `Pending` when the trial was deferred.
    pub status: TrialStatus,
    /// Resolved by an earlier run; nothing was done this time.
    pub previously_resolved: bool,
    /// Local artifact directory of a trial that succeeded in this run.
    pub artifact_path: Option<PathBuf>,
}

/// Result of a sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped_invalid: usize,
    pub skipped_oom: usize,
    pub failed: usize,
    /// Unknown failures left unmarked.
    pub deferred: usize,
    /// Subset of the counts above that an earlier run already resolved.
    pub previously_resolved: usize,
    /// Executor invocations, retries included.
    pub executions: usize,
    /// One per planned trial, in enumeration order.
    pub outcomes: Vec<SpecOutcome>,
}

impl SweepSummary {
    fn push(
        &mut self,
        trial_id: String,
        status: TrialStatus,
        previously_resolved: bool,
        artifact_path: Option<PathBuf>,
    ) {
        match status {
            TrialStatus::Succeeded => self.succeeded += 1,
            TrialStatus::SkippedInvalid => self.skipped_invalid += 1,
            TrialStatus::SkippedOom => self.skipped_oom += 1,
            TrialStatus::Failed => self.failed += 1,
            TrialStatus::Pending | TrialStatus::Running => self.deferred += 1,
        }
        if previously_resolved {
            self.previously_resolved += 1;
        }
        self.outcomes.push(SpecOutcome {
            trial_id,
            status,
            previously_resolved,
            artifact_path,
        });
    }

    /// No trial failed or was deferred.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.deferred == 0
    }
}

impl<'a> Scheduler<'a> {
    #[must_use]
    pub fn new(
        store: &'a CheckpointStore,
        executor: TrialExecutor,
        transfer: TransferPipeline,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            executor,
            transfer,
            probe: None,
            clock,
            policy: RetryPolicy::default(),
            probe_schedule: ProbeSchedule::default(),
            settle_grace: Duration::ZERO,
            show_progress: false,
        }
    }

    /// Gate dispatch on host readiness.
    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn HealthProbe>, schedule: ProbeSchedule) -> Self {
        self.probe = Some(probe);
        self.probe_schedule = schedule;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_settle_grace(mut self, settle_grace: Duration) -> Self {
        self.settle_grace = settle_grace;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Wire up the command-driven context, hops and probe from configuration.
    pub fn from_config(
        config: &HarnessConfig,
        store: &'a CheckpointStore,
    ) -> Result<Self, SchedulerError> {
        let settings = &config.harness;
        let clock = SystemClock::shared();

        let context = CommandContext::new(
            settings.context.host.as_str(),
            settings.context.launch.clone(),
            settings.context.teardown.clone(),
            settings.context.remote_dir.as_str(),
            &settings.log_dir,
        )
        .with_rust_log(settings.rust_log.clone())
        .with_idle_timeout(settings.idle_timeout_secs.map(Duration::from_secs));

        let budget = TimeoutEstimator {
            base_secs: settings.timeout_base_secs,
            secs_per_billion_params: settings.timeout_secs_per_billion_params,
            ..TimeoutEstimator::default()
        };
        let executor = TrialExecutor::new(
            Arc::new(context),
            config.classifier()?,
            &budget,
            &config.sweep.models,
        );

        let hops: Vec<Box<dyn Hop>> = settings
            .transfer
            .hops
            .iter()
            .map(|hop| {
                Box::new(CommandHop::new(
                    hop.name.as_str(),
                    hop.command.clone(),
                    settings.context.host.as_str(),
                    settings.context.remote_dir.as_str(),
                    settings.transfer.staging_dir.as_str(),
                )) as Box<dyn Hop>
            })
            .collect();
        let transfer = TransferPipeline::new(&settings.artifact_root, hops, clock.clone())
            .with_retries(
                settings.transfer.max_retries,
                Duration::from_secs(settings.transfer.backoff_base_secs),
            )
            .with_host(settings.context.host.as_str());

        let mut scheduler = Self::new(store, executor, transfer, clock)
            .with_policy(RetryPolicy {
                max_retries: settings.max_retries,
                backoff_base: Duration::from_secs(settings.backoff_base_secs),
                backoff_max: Duration::from_secs(settings.backoff_max_secs),
            })
            .with_settle_grace(Duration::from_secs(settings.settle_grace_secs));

        if let Some(ref probe) = settings.probe {
            let command =
                CommandProbe::new(&probe.command, &settings.context.host, &probe.ready_pattern)?;
            scheduler = scheduler.with_probe(
                Box::new(command),
                ProbeSchedule {
                    max_attempts: probe.max_attempts,
                    interval: Duration::from_secs(probe.interval_secs),
                    ..ProbeSchedule::default()
                },
            );
        }

        Ok(scheduler)
    }

    /// Run every planned trial that is not already resolved.
    pub async fn run(&self, trials: &[PlannedTrial]) -> Result<SweepSummary, SchedulerError> {
        let snapshot = self.store.load()?;
        let mut frontier = OomFrontier::rebuild(
            trials.iter().filter(|t| t.is_valid()).map(|t| &t.spec),
            &snapshot,
        );

        let mut summary = SweepSummary {
            total: trials.len(),
            ..SweepSummary::default()
        };
        let mut host_ready = self.probe.is_none();
        let pb = self.progress_bar(trials.len());

        for trial in trials {
            let trial_id = trial.spec.id();
            pb.set_message(trial_id.clone());

            if let Validity::Invalid { ref reason } = trial.validity {
                tracing::debug!("{trial_id}: skipped ({reason})");
                summary.push(trial_id, TrialStatus::SkippedInvalid, false, None);
                pb.inc(1);
                continue;
            }

            if let Some(status) = previously_resolved(&snapshot, &trial_id) {
                tracing::debug!("{trial_id}: already {status}");
                summary.push(trial_id, status, true, None);
                pb.inc(1);
                continue;
            }

            let (status, artifact_path) = if frontier.blocks(&trial.spec) {
                tracing::info!(
                    "{trial_id}: SKIPPED (oom), batch {} already exhausted memory",
                    frontier
                        .limit(&trial.spec.model_id, trial.spec.parallelism)
                        .unwrap_or_default()
                );
                (self.record(&trial_id, TrialStatus::SkippedOom, 0)?, None)
            } else if self.transfer.is_complete(&trial_id) {
                let local_dir = self.transfer.local_dir(&trial_id);
                let attempts = read_metadata(&local_dir)
                    .ok()
                    .flatten()
                    .map_or(1, |m| m.attempts);
                tracing::info!("{trial_id}: adopting completed artifacts");
                let status = self.record(&trial_id, TrialStatus::Succeeded, attempts)?;
                (status, Some(local_dir))
            } else {
                self.drive(&trial.spec, &mut frontier, &mut summary, &mut host_ready)
                    .await?
            };

            summary.push(trial_id, status, false, artifact_path);
            pb.inc(1);
        }

        pb.finish_with_message("sweep finished");
        Ok(summary)
    }

    /// Run one trial through its attempt state machine.
    ///
    /// Returns `Pending` when the trial was deferred, and the artifact
    /// directory when it succeeded.
    async fn drive(
        &self,
        spec: &TrialSpec,
        frontier: &mut OomFrontier,
        summary: &mut SweepSummary,
        host_ready: &mut bool,
    ) -> Result<(TrialStatus, Option<PathBuf>), SchedulerError> {
        let trial_id = spec.id();
        let mut state = AttemptState::new();
        state.needs_probe = !*host_ready;
        let mut executed: Option<TrialResult> = None;

        loop {
            let now = self.clock.now_ms();
            if !state.is_eligible(now) {
                self.clock.sleep(state.remaining(now)).await;
            }
            if state.needs_probe {
                if let Some(ref probe) = self.probe {
                    let polls =
                        await_ready(probe.as_ref(), self.clock.as_ref(), self.probe_schedule)
                            .await?;
                    tracing::info!("Host ready after {polls} probe(s)");
                }
                state.probe_confirmed();
                *host_ready = true;
            }

            let attempt = state.begin_attempt();

            if state.phase == Phase::Execute {
                tracing::info!("{trial_id}: starting (attempt {attempt})");
                self.transfer.discard_partial(&trial_id)?;
                summary.executions += 1;
                let result = self.executor.execute(spec, attempt).await?;
                self.settle().await;

                match result.status {
                    TrialStatus::Succeeded => {
                        tracing::info!(
                            "{trial_id}: workload finished in {:.1}s",
                            result.wall_clock_secs
                        );
                        state.executed();
                        executed = Some(result);
                    }
                    TrialStatus::SkippedOom => {
                        tracing::warn!("{trial_id}: SKIPPED (oom)");
                        frontier.observe(spec);
                        return Ok((self.record(&trial_id, TrialStatus::SkippedOom, attempt)?, None));
                    }
                    TrialStatus::SkippedInvalid => {
                        tracing::warn!("{trial_id}: SKIPPED (invalid configuration)");
                        return Ok((
                            self.record(&trial_id, TrialStatus::SkippedInvalid, attempt)?,
                            None,
                        ));
                    }
                    _ => {
                        let kind = result.error_kind.unwrap_or(FailureKind::Unknown);
                        match state.on_failure(&self.policy, kind, self.clock.now_ms()) {
                            Verdict::Retry { after } => {
                                tracing::warn!(
                                    "{trial_id}: attempt {attempt} failed ({kind}), retrying in {}s",
                                    after.as_secs()
                                );
                                continue;
                            }
                            Verdict::Fail => {
                                tracing::error!(
                                    "{trial_id}: FAILED ({kind}) after {attempt} attempts"
                                );
                                return Ok((
                                    self.record(&trial_id, TrialStatus::Failed, attempt)?,
                                    None,
                                ));
                            }
                            Verdict::Defer => {
                                tracing::error!(
                                    "{trial_id}: attempt {attempt} exited with {:?}, unrecognised failure; leaving unmarked\n{}",
                                    result.exit_code,
                                    result.diagnostics.as_deref().unwrap_or_default()
                                );
                                return Ok((TrialStatus::Pending, None));
                            }
                            Verdict::SkipOom => {
                                frontier.observe(spec);
                                return Ok((
                                    self.record(&trial_id, TrialStatus::SkippedOom, attempt)?,
                                    None,
                                ));
                            }
                            Verdict::SkipInvalid => {
                                return Ok((
                                    self.record(&trial_id, TrialStatus::SkippedInvalid, attempt)?,
                                    None,
                                ));
                            }
                        }
                    }
                }
            }

            let Some(ref result) = executed else {
                continue;
            };
            match self.transfer.transfer(spec, result).await {
                Ok(path) => {
                    tracing::info!("{trial_id}: completed ({})", path.display());
                    let finished = TrialResult {
                        attempt: state.attempts,
                        artifact_path: Some(path),
                        ..result.clone()
                    };
                    self.record(&trial_id, finished.status, finished.attempt)?;
                    return Ok((finished.status, finished.artifact_path));
                }
                Err(e) => {
                    match state.on_failure(
                        &self.policy,
                        FailureKind::TransientInfra,
                        self.clock.now_ms(),
                    ) {
                        Verdict::Retry { after } => {
                            tracing::warn!(
                                "{trial_id}: transfer failed ({e}), retrying transfer in {}s",
                                after.as_secs()
                            );
                        }
                        _ => {
                            tracing::error!("{trial_id}: FAILED, transfer gave up: {e}");
                            return Ok((
                                self.record(&trial_id, TrialStatus::Failed, state.attempts)?,
                                None,
                            ));
                        }
                    }
                }
            }
        }
    }

    fn record(
        &self,
        trial_id: &str,
        status: TrialStatus,
        attempts: u32,
    ) -> Result<TrialStatus, SchedulerError> {
        self.store
            .record(trial_id, status, &now_timestamp(), attempts)?;
        Ok(status)
    }

    async fn settle(&self) {
        if !self.settle_grace.is_zero() {
            self.clock.sleep(self.settle_grace).await;
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {msg:60} [{wide_bar:.cyan/blue}] {pos:>4}/{len:4}")
        {
            // plain characters survive every remote terminal
            pb.set_style(style.progress_chars("#*-"));
        }
        pb
    }
}

/// Terminal status carried over from an earlier run. `failed` is retried.
fn previously_resolved(snapshot: &CheckpointSnapshot, trial_id: &str) -> Option<TrialStatus> {
    snapshot.status(trial_id).filter(|status| {
        matches!(
            status,
            TrialStatus::Succeeded | TrialStatus::SkippedOom | TrialStatus::SkippedInvalid
        )
    })
}

/// Errors that abort a sweep.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
