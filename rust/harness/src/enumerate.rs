//! Expansion of a sweep description into concrete trials.

use std::cmp::Reverse;

use sweep_config::{ModelDescriptor, TrialSpec};

use crate::config::SweepDescription;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Structurally impossible; never executed.
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTrial {
    pub spec: TrialSpec,
    pub validity: Validity,
}

impl PlannedTrial {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }
}

/// Every (model, parallelism, batch) combination in execution order.
///
/// Models keep their declaration order; within a model, parallelism degrees
/// run largest first and batch sizes smallest first, so an OOM at some batch
/// size is seen before any larger batch for the same degree.
#[must_use]
pub fn enumerate(description: &SweepDescription) -> Vec<PlannedTrial> {
    let mut trials = Vec::new();
    for model in &description.models {
        let mut degrees = model
            .parallelism
            .clone()
            .unwrap_or_else(|| description.parallelism.clone());
        degrees.sort_unstable_by_key(|&d| Reverse(d));
        degrees.dedup();

        let mut batches = model
            .batch_sizes
            .clone()
            .unwrap_or_else(|| description.batch_sizes.clone());
        batches.sort_unstable();
        batches.dedup();

        for &degree in &degrees {
            for &batch in &batches {
                let spec = TrialSpec::new(
                    &model.id,
                    degree,
                    batch,
                    description.input_length,
                    description.output_length,
                );
                let validity = validate(model, &spec);
                trials.push(PlannedTrial { spec, validity });
            }
        }
    }
    trials
}

fn validate(model: &ModelDescriptor, spec: &TrialSpec) -> Validity {
    let reason = if !model.accepts_degree(spec.parallelism) {
        format!(
            "parallelism {} does not divide fan-out {}",
            spec.parallelism, model.fan_out
        )
    } else if spec.batch_size == 0 {
        "batch size is 0".to_string()
    } else if spec.input_length == 0 || spec.output_length == 0 {
        "sequence length is 0".to_string()
    } else {
        return Validity::Valid;
    };
    Validity::Invalid { reason }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn description(models: Vec<ModelDescriptor>) -> SweepDescription {
        SweepDescription {
            input_length: 128,
            output_length: 128,
            parallelism: vec![1, 8, 4, 4],
            batch_sizes: vec![16, 1, 8, 1],
            models,
        }
    }

    fn ids(trials: &[PlannedTrial]) -> Vec<(usize, usize)> {
        trials
            .iter()
            .map(|t| (t.spec.parallelism, t.spec.batch_size))
            .collect()
    }

    #[test]
    fn test_order_and_dedup() {
        let trials = enumerate(&description(vec![ModelDescriptor::new("m", 8)]));
        assert_eq!(
            ids(&trials),
            [
                (8, 1),
                (8, 8),
                (8, 16),
                (4, 1),
                (4, 8),
                (4, 16),
                (1, 1),
                (1, 8),
                (1, 16)
            ]
        );
        assert!(trials.iter().all(PlannedTrial::is_valid));
    }

    #[test]
    fn test_deterministic() {
        let desc = description(vec![ModelDescriptor::new("a", 8), ModelDescriptor::new("b", 4)]);
        assert_eq!(enumerate(&desc), enumerate(&desc));
        let trials = enumerate(&desc);
        assert_eq!(trials[0].spec.model_id, "a");
        assert_eq!(trials.last().unwrap().spec.model_id, "b");
    }

    #[test_case(12, 8, false ; "8 does not divide 12")]
    #[test_case(12, 4, true ; "4 divides 12")]
    #[test_case(12, 0, false ; "zero degree")]
    #[test_case(14, 4, false ; "fourteen heads")]
    fn test_divisibility(fan_out: usize, degree: usize, valid: bool) {
        let desc = SweepDescription {
            parallelism: vec![degree],
            batch_sizes: vec![1],
            ..description(vec![ModelDescriptor::new("m", fan_out)])
        };
        let trials = enumerate(&desc);
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].is_valid(), valid);
    }

    #[test]
    fn test_zero_batch_invalid() {
        let desc = SweepDescription {
            batch_sizes: vec![0, 2],
            ..description(vec![ModelDescriptor::new("m", 8)])
        };
        let trials = enumerate(&desc);
        assert!(matches!(
            &trials[0].validity,
            Validity::Invalid { reason } if reason.contains("batch")
        ));
        assert!(trials[1].is_valid());
    }

    #[test]
    fn test_model_overrides() {
        let model = ModelDescriptor {
            parallelism: Some(vec![2]),
            batch_sizes: Some(vec![64, 32]),
            ..ModelDescriptor::new("m", 8)
        };
        let trials = enumerate(&description(vec![model]));
        assert_eq!(ids(&trials), [(2, 32), (2, 64)]);
    }
}
