//! Per-trial resource budgets.
//!
//! - Timeout: a fixed base plus a per-billion-parameter allowance for weight
//!   loading and compilation, unless the model sets `timeout_secs`.
//! - Weights per device: parameter bytes split evenly over the parallelism
//!   degree. A floor for device memory, not a prediction of peak usage
//!   (KV cache and activations come on top).

use std::time::Duration;

use sweep_config::ModelDescriptor;

/// Derives timeouts and weight-memory estimates from model size.
#[derive(Debug, Clone)]
pub struct TimeoutEstimator {
    pub base_secs: u64,
    pub secs_per_billion_params: u64,
    /// Bytes per parameter (2 for bf16).
    pub bytes_per_param: u64,
}

impl Default for TimeoutEstimator {
    fn default() -> Self {
        Self {
            base_secs: 600,
            secs_per_billion_params: 60,
            bytes_per_param: 2,
        }
    }
}

/// Weight memory estimate for one (model, parallelism) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightEstimate {
    pub total_bytes: u64,
    pub per_device_bytes: u64,
    pub parallelism: usize,
}

impl WeightEstimate {
    #[must_use]
    pub fn per_device_gb(&self) -> f64 {
        self.per_device_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    #[must_use]
    pub fn breakdown(&self) -> String {
        format!(
            "Weights: {:.2} GB total, {:.2} GB/device over {} device(s)",
            self.total_bytes as f64 / 1e9,
            self.per_device_bytes as f64 / 1e9,
            self.parallelism
        )
    }
}

impl TimeoutEstimator {
    /// Timeout for one attempt of any trial of `model`.
    #[must_use]
    pub fn timeout(&self, model: &ModelDescriptor) -> Duration {
        if let Some(secs) = model.timeout_secs {
            return Duration::from_secs(secs);
        }
        let per_param = model
            .params_b
            .filter(|p| p.is_finite() && *p > 0.0)
            .map_or(0, |p| (p * self.secs_per_billion_params as f64).ceil() as u64);
        Duration::from_secs(self.base_secs + per_param)
    }

    /// `None` when the model does not declare its size or `parallelism` is zero.
    #[must_use]
    pub fn weights_per_device(
        &self,
        model: &ModelDescriptor,
        parallelism: usize,
    ) -> Option<WeightEstimate> {
        let params_b = model.params_b.filter(|p| p.is_finite() && *p > 0.0)?;
        if parallelism == 0 {
            return None;
        }
        let total_bytes = (params_b * 1e9).ceil() as u64 * self.bytes_per_param;
        let per_device_bytes = total_bytes.div_ceil(parallelism as u64);
        Some(WeightEstimate {
            total_bytes,
            per_device_bytes,
            parallelism,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(params_b: Option<f64>) -> ModelDescriptor {
        ModelDescriptor {
            params_b,
            ..ModelDescriptor::new("m", 8)
        }
    }

    #[test]
    fn test_timeout_scales_with_size() {
        let est = TimeoutEstimator::default();
        assert_eq!(est.timeout(&model(None)), Duration::from_secs(600));
        assert_eq!(est.timeout(&model(Some(8.0))), Duration::from_secs(1080));
        assert_eq!(est.timeout(&model(Some(0.5))), Duration::from_secs(630));
        assert!(est.timeout(&model(Some(70.0))) > est.timeout(&model(Some(8.0))));
    }

    #[test]
    fn test_timeout_override() {
        let est = TimeoutEstimator::default();
        let m = ModelDescriptor {
            timeout_secs: Some(42),
            ..model(Some(70.0))
        };
        assert_eq!(est.timeout(&m), Duration::from_secs(42));
    }

    #[test]
    fn test_weights_per_device() {
        let est = TimeoutEstimator::default();
        let w = est.weights_per_device(&model(Some(8.0)), 4).unwrap();
        assert_eq!(w.total_bytes, 16_000_000_000);
        assert_eq!(w.per_device_bytes, 4_000_000_000);
        assert!(w.per_device_gb() > 3.7 && w.per_device_gb() < 3.8);

        assert!(est.weights_per_device(&model(None), 4).is_none());
        assert!(est.weights_per_device(&model(Some(8.0)), 0).is_none());
    }
}
