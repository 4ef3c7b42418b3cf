//! Failure classification from captured diagnostics.
//!
//! Rules are plain data: an ordered list of (kind, regex) pairs. The first
//! rule that matches anywhere in the text decides the kind. Configured rules
//! are consulted before the built-ins, so a new accelerator runtime only
//! needs new `[[harness.signatures]]` entries.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Failure taxonomy driving the retry policy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Structurally impossible configuration.
    Invalid,
    /// Accelerator memory exhausted.
    Oom,
    /// Infrastructure hiccup worth retrying (busy device, dropped connection, preemption).
    TransientInfra,
    Timeout,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid"),
            Self::Oom => write!(f, "oom"),
            Self::TransientInfra => write!(f, "transient_infra"),
            Self::Timeout => write!(f, "timeout"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A signature as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignatureRule {
    pub kind: FailureKind,
    pub pattern: String,
}

const DEFAULT_SIGNATURES: &[(FailureKind, &str)] = &[
    (FailureKind::Oom, r"RESOURCE_EXHAUSTED"),
    (FailureKind::Oom, r"(?i)out of memory"),
    (FailureKind::Oom, r"\bOOM\b"),
    (FailureKind::Oom, r"(?i)failed to allocate"),
    (FailureKind::Oom, r"(?i)attempting to allocate .*bytes"),
    (FailureKind::Oom, r"(?i)\bHBM\b.*(exhaust|exceed|insufficient)"),
    (FailureKind::Invalid, r"(?i)not divisible by"),
    (FailureKind::Invalid, r"(?i)must be divisible"),
    (FailureKind::TransientInfra, r"(?i)connection (refused|reset|closed|timed out)"),
    (FailureKind::TransientInfra, r"Device or resource busy"),
    (FailureKind::TransientInfra, r"(?i)preempt"),
    (FailureKind::TransientInfra, r"(?i)TPU initialization failed"),
    (FailureKind::TransientInfra, r"(?i)no route to host"),
    (FailureKind::TransientInfra, r"(?i)broken pipe"),
    (FailureKind::TransientInfra, r"(?i)container name .* is already in use"),
    (FailureKind::TransientInfra, r"(?i)container .* is not running"),
    (FailureKind::TransientInfra, r"(?i)ssh.*\b(exit|exited with) (status|code) 255"),
];

struct Signature {
    kind: FailureKind,
    regex: Regex,
}

/// Result of classifying a diagnostics blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    /// The text the winning rule matched, if any rule did.
    pub matched: Option<String>,
}

/// Ordered signature rules.
#[derive(Default)]
pub struct SignatureClassifier {
    signatures: Vec<Signature>,
}

impl SignatureClassifier {
    /// A classifier with no rules; everything is `Unknown`.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in rules only.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut classifier = Self::empty();
        for (kind, pattern) in DEFAULT_SIGNATURES {
            if let Ok(regex) = Regex::new(pattern) {
                classifier.signatures.push(Signature { kind: *kind, regex });
            }
        }
        classifier
    }

    /// Configured rules first, then the built-ins.
    pub fn from_rules(rules: &[SignatureRule]) -> Result<Self, regex::Error> {
        let mut classifier = Self::empty();
        for rule in rules {
            classifier.push(rule.kind, &rule.pattern)?;
        }
        classifier.signatures.extend(Self::with_defaults().signatures);
        Ok(classifier)
    }

    /// Append a rule at the lowest priority.
    pub fn push(&mut self, kind: FailureKind, pattern: &str) -> Result<(), regex::Error> {
        self.signatures.push(Signature {
            kind,
            regex: Regex::new(pattern)?,
        });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    #[must_use]
    pub fn classify(&self, text: &str) -> Classification {
        self.signatures
            .iter()
            .find_map(|s| {
                s.regex.find(text).map(|m| Classification {
                    kind: s.kind,
                    matched: Some(m.as_str().to_string()),
                })
            })
            .unwrap_or(Classification {
                kind: FailureKind::Unknown,
                matched: None,
            })
    }
}
