//! Trial identity.

use serde::{Deserialize, Serialize};

/// One point of the sweep: a model at a fixed parallelism degree, batch size
/// and sequence shape.
///
/// Immutable once enumerated. [`TrialSpec::id`] is the canonical identifier
/// used for checkpoint entries and artifact directory names.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrialSpec {
    pub model_id: String,
    pub parallelism: usize,
    pub batch_size: usize,
    pub input_length: usize,
    pub output_length: usize,
}

impl TrialSpec {
    #[must_use]
    pub fn new(
        model_id: impl Into<String>,
        parallelism: usize,
        batch_size: usize,
        input_length: usize,
        output_length: usize,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            parallelism,
            batch_size,
            input_length,
            output_length,
        }
    }

    /// Canonical identifier, e.g. `meta-llama--Llama-3.1-8B_tp4_bs16_in128_out128`.
    #[must_use]
    pub fn id(&self) -> String {
        format!(
            "{}_tp{}_bs{}_in{}_out{}",
            model_slug(&self.model_id),
            self.parallelism,
            self.batch_size,
            self.input_length,
            self.output_length
        )
    }

    /// The (model, parallelism) pair OOM propagation is scoped to.
    #[must_use]
    pub fn pair(&self) -> (&str, usize) {
        (&self.model_id, self.parallelism)
    }
}

impl std::fmt::Display for TrialSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tp={} bs={} in={} out={}",
            self.model_id, self.parallelism, self.batch_size, self.input_length, self.output_length
        )
    }
}

/// Filesystem-safe form of a model id: `/` becomes `--`, anything outside
/// `[A-Za-z0-9._-]` becomes `_`.
#[must_use]
pub fn model_slug(model_id: &str) -> String {
    let mut slug = String::with_capacity(model_id.len() + 4);
    for c in model_id.chars() {
        match c {
            '/' => slug.push_str("--"),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => slug.push(c),
            _ => slug.push('_'),
        }
    }
    slug
}
