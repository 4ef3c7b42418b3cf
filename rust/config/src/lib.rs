//! Types shared between the sweep harness and trace analysis crates.

mod trial;
mod types;

pub use trial::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_trial_id_is_stable() {
        let spec = TrialSpec::new("meta-llama/Llama-3.1-8B-Instruct", 4, 16, 128, 256);
        assert_eq!(spec.id(), "meta-llama--Llama-3.1-8B-Instruct_tp4_bs16_in128_out256");
        assert_eq!(spec.id(), spec.clone().id());
    }

    #[test]
    fn test_trial_id_distinguishes_every_field() {
        let base = TrialSpec::new("Qwen/Qwen3-4B", 2, 8, 128, 128);
        let variants = [
            TrialSpec::new("Qwen/Qwen3-32B", 2, 8, 128, 128),
            TrialSpec::new("Qwen/Qwen3-4B", 4, 8, 128, 128),
            TrialSpec::new("Qwen/Qwen3-4B", 2, 16, 128, 128),
            TrialSpec::new("Qwen/Qwen3-4B", 2, 8, 256, 128),
            TrialSpec::new("Qwen/Qwen3-4B", 2, 8, 128, 256),
        ];
        for v in &variants {
            assert_ne!(base.id(), v.id());
        }
    }

    #[test_case("Qwen/Qwen3-4B", "Qwen--Qwen3-4B" ; "org slash")]
    #[test_case("local model:v1", "local_model_v1" ; "spaces and colon")]
    #[test_case("deepseek-v2-lite", "deepseek-v2-lite" ; "already safe")]
    fn test_model_slug(input: &str, expected: &str) {
        assert_eq!(model_slug(input), expected);
    }

    #[test]
    fn test_accepts_degree() {
        let model = ModelDescriptor::new("m", 8);
        assert!(model.accepts_degree(1));
        assert!(model.accepts_degree(8));
        assert!(!model.accepts_degree(3));
        assert!(!model.accepts_degree(16));
        assert!(!model.accepts_degree(0));
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::from_str::<TrialStatus>("\"skipped_oom\"").unwrap(),
            TrialStatus::SkippedOom
        );
        assert_eq!(
            serde_json::to_string(&TrialStatus::SkippedInvalid).unwrap(),
            "\"skipped_invalid\""
        );
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("failed".parse::<TrialStatus>().unwrap(), TrialStatus::Failed);
        assert_eq!("skipped-oom".parse::<TrialStatus>().unwrap(), TrialStatus::SkippedOom);
        assert_eq!("SUCCEEDED".parse::<TrialStatus>().unwrap(), TrialStatus::Succeeded);
        assert!("bogus".parse::<TrialStatus>().is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TrialStatus::Pending.is_terminal());
        assert!(!TrialStatus::Running.is_terminal());
        assert!(TrialStatus::Succeeded.is_terminal());
        assert!(TrialStatus::SkippedOom.is_terminal());
        assert!(TrialStatus::Failed.is_terminal());
    }
}
