//! Retry policy, per-trial attempt state and the OOM frontier.

use std::{collections::HashMap, time::Duration};

use sweep_config::{TrialSpec, TrialStatus};

use crate::{classify::FailureKind, state::CheckpointSnapshot};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry { after: Duration },
    SkipInvalid,
    SkipOom,
    Fail,
    /// Unknown failure: log it and leave the trial unmarked.
    Defer,
}

/// Bounded exponential-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt - 1)`, capped at `backoff_max`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Decide after `attempts` attempts (including the one that just failed).
    #[must_use]
    pub fn decide(&self, kind: FailureKind, attempts: u32) -> Verdict {
        match kind {
            FailureKind::Invalid => Verdict::SkipInvalid,
            FailureKind::Oom => Verdict::SkipOom,
            FailureKind::TransientInfra | FailureKind::Timeout => {
                if attempts <= self.max_retries {
                    Verdict::Retry {
                        after: self.backoff(attempts),
                    }
                } else {
                    Verdict::Fail
                }
            }
            FailureKind::Unknown => Verdict::Defer,
        }
    }
}

/// Which step of a trial the next attempt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Execute,
    /// The workload succeeded; only the artifact transfer remains.
    Transfer,
}

/// Per-trial retry state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptState {
    pub attempts: u32,
    pub phase: Phase,
    pub next_eligible_at_ms: u64,
    /// Host readiness must be confirmed before the next dispatch.
    pub needs_probe: bool,
    pub last_error: Option<FailureKind>,
}

impl Default for AttemptState {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempts: 0,
            phase: Phase::Execute,
            next_eligible_at_ms: 0,
            needs_probe: false,
            last_error: None,
        }
    }

    #[must_use]
    pub fn is_eligible(&self, now_ms: u64) -> bool {
        now_ms >= self.next_eligible_at_ms
    }

    /// Time left until the backoff has elapsed.
    #[must_use]
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.next_eligible_at_ms.saturating_sub(now_ms))
    }

    /// Start the next attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn probe_confirmed(&mut self) {
        self.needs_probe = false;
    }

    /// The workload succeeded; further attempts only retry the transfer.
    pub fn executed(&mut self) {
        self.phase = Phase::Transfer;
    }

    /// Record a failed attempt and return what the policy says to do next.
    pub fn on_failure(&mut self, policy: &RetryPolicy, kind: FailureKind, now_ms: u64) -> Verdict {
        self.last_error = Some(kind);
        let verdict = policy.decide(kind, self.attempts);
        if let Verdict::Retry { after } = verdict {
            let wait = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
            self.next_eligible_at_ms = now_ms.saturating_add(wait);
            self.needs_probe = true;
        }
        verdict
    }
}

/// Smallest batch size known to exhaust memory, per (model, parallelism).
///
/// OOM propagates along batch size only; a different parallelism degree for
/// the same model has its own frontier.
#[derive(Debug, Clone, Default)]
pub struct OomFrontier {
    limits: HashMap<(String, usize), usize>,
}

impl OomFrontier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from checkpoint entries so the frontier survives restarts.
    #[must_use]
    pub fn rebuild<'a>(
        specs: impl IntoIterator<Item = &'a TrialSpec>,
        snapshot: &CheckpointSnapshot,
    ) -> Self {
        let mut frontier = Self::new();
        for spec in specs {
            if snapshot.status(&spec.id()) == Some(TrialStatus::SkippedOom) {
                frontier.observe(spec);
            }
        }
        frontier
    }

    /// Record an OOM at `spec`; returns whether the frontier moved.
    pub fn observe(&mut self, spec: &TrialSpec) -> bool {
        let key = (spec.model_id.clone(), spec.parallelism);
        match self.limits.get(&key) {
            Some(&limit) if limit <= spec.batch_size => false,
            _ => {
                self.limits.insert(key, spec.batch_size);
                true
            }
        }
    }

    /// Whether `spec` is at or above a known OOM batch size for its pair.
    #[must_use]
    pub fn blocks(&self, spec: &TrialSpec) -> bool {
        self.limit(&spec.model_id, spec.parallelism)
            .is_some_and(|limit| spec.batch_size >= limit)
    }

    #[must_use]
    pub fn limit(&self, model_id: &str, parallelism: usize) -> Option<usize> {
        self.limits
            .get(&(model_id.to_string(), parallelism))
            .copied()
    }
}
