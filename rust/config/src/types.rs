//! Model descriptors and trial status enums.

use serde::{Deserialize, Serialize};

/// A model under test.
///
/// `fan_out` is the architecture count a parallelism degree has to divide
/// evenly (attention heads, or KV heads for grouped-query models). The
/// optional lists override the sweep-wide parallelism degrees and batch sizes
/// for this model only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub fan_out: usize,
    /// Parameter count in billions (drives the timeout budget).
    #[serde(default)]
    pub params_b: Option<f64>,
    #[serde(default)]
    pub parallelism: Option<Vec<usize>>,
    #[serde(default)]
    pub batch_sizes: Option<Vec<usize>>,
    /// Hard per-trial timeout, overriding the size-derived budget.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ModelDescriptor {
    #[must_use]
    pub fn new(id: impl Into<String>, fan_out: usize) -> Self {
        Self {
            id: id.into(),
            fan_out,
            params_b: None,
            parallelism: None,
            batch_sizes: None,
            timeout_secs: None,
        }
    }

    /// Whether `degree` shards this model evenly.
    #[must_use]
    pub fn accepts_degree(&self, degree: usize) -> bool {
        degree != 0 && self.fan_out % degree == 0
    }
}

/// Status of a trial.
///
/// `Running` only exists inside the orchestrator; it is never persisted.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    SkippedInvalid,
    SkippedOom,
    Failed,
}

impl TrialStatus {
    /// Succeeded, skipped or failed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    #[must_use]
    pub fn is_skip(self) -> bool {
        matches!(self, Self::SkippedInvalid | Self::SkippedOom)
    }

    /// Upper-case label used in status listings.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::SkippedInvalid => "SKIPPED (invalid)",
            Self::SkippedOom => "SKIPPED (oom)",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::SkippedInvalid => write!(f, "skipped_invalid"),
            Self::SkippedOom => write!(f, "skipped_oom"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TrialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" | "success" | "completed" => Ok(Self::Succeeded),
            "skipped_invalid" | "invalid" => Ok(Self::SkippedInvalid),
            "skipped_oom" | "oom" => Ok(Self::SkippedOom),
            "failed" => Ok(Self::Failed),
            _ => Err(format!(
                "unknown trial status '{s}'. Use: pending, succeeded, skipped_invalid, \
                 skipped_oom, failed"
            )),
        }
    }
}
