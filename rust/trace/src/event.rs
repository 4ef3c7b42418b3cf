//! Trace event model.

use serde::{Deserialize, Serialize};

/// What a traced interval was doing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Compute,
    Communication,
    Idle,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Communication => write!(f, "communication"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// One timed interval on one device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub start: f64,
    pub duration: f64,
    #[serde(default)]
    pub device_id: u64,
    pub category: Category,
    pub op_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
    /// Set on compute events that emit an output unit (token).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub output: bool,
}

impl TraceEvent {
    #[must_use]
    pub fn new(category: Category, op_name: impl Into<String>, start: f64, duration: f64) -> Self {
        Self {
            start,
            duration,
            device_id: 0,
            category,
            op_name: op_name.into(),
            bytes_transferred: None,
            output: false,
        }
    }

    #[must_use]
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_device(mut self, device_id: u64) -> Self {
        self.device_id = device_id;
        self
    }

    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.output = true;
        self
    }

    #[must_use]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// An ordered event stream from one trial.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    /// When the request was submitted, in the same time base as the events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<f64>,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    /// Validate and order events by start time.
    ///
    /// The sort is stable, so events sharing a start keep their recorded order.
    pub fn new(submitted_at: Option<f64>, mut events: Vec<TraceEvent>) -> Result<Self, TraceError> {
        if let Some(t) = submitted_at
            && !t.is_finite()
        {
            return Err(TraceError::Invalid(format!("submitted_at is not finite: {t}")));
        }
        for (i, event) in events.iter().enumerate() {
            if !event.start.is_finite() {
                return Err(TraceError::Invalid(format!(
                    "event {i} ({}) has non-finite start",
                    event.op_name
                )));
            }
            if !event.duration.is_finite() || event.duration < 0.0 {
                return Err(TraceError::Invalid(format!(
                    "event {i} ({}) has invalid duration {}",
                    event.op_name, event.duration
                )));
            }
        }
        events.sort_by(|a, b| a.start.total_cmp(&b.start));
        Ok(Self {
            submitted_at,
            events,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Errors raised while reading a trace.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to read trace {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to decompress trace {0}: {1}")]
    Decompress(std::path::PathBuf, std::io::Error),
    #[error("failed to parse trace {0}: {1}")]
    Parse(std::path::PathBuf, String),
    #[error("unrecognized trace format in {0}")]
    UnknownFormat(std::path::PathBuf),
    #[error("invalid trace: {0}")]
    Invalid(String),
}
