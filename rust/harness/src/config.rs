//! Configuration parsing for the sweep harness.

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};
use sweep_config::ModelDescriptor;

use crate::classify::{SignatureClassifier, SignatureRule};

/// Top-level configuration loaded from TOML (raw, before merging).
#[derive(Debug, Clone, Deserialize)]
struct RawHarnessConfig {
    pub harness: HarnessSettings,
    pub sweep: SweepSettings,
    #[serde(default = "empty_table")]
    pub defaults: toml::Value,
    #[serde(default)]
    pub models: Vec<toml::Value>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Top-level configuration after merging defaults into models.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub harness: HarnessSettings,
    pub sweep: SweepDescription,
}

/// Sweep-wide axes from the `[sweep]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SweepSettings {
    input_length: usize,
    output_length: usize,
    parallelism: Vec<usize>,
    batch_sizes: Vec<usize>,
}

/// Declarative description of a sweep: the axes plus the models to run.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepDescription {
    pub input_length: usize,
    pub output_length: usize,
    pub parallelism: Vec<usize>,
    pub batch_sizes: Vec<usize>,
    pub models: Vec<ModelDescriptor>,
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Path to the JSON Lines checkpoint log.
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,
    /// Root directory for transferred artifacts.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: String,
    /// Per-trial stdout/stderr logs go under `{log_dir}/{trial_id}/`.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Retries for transient failures and timeouts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    /// Pause after every execution so the accelerators are released before
    /// the next dispatch.
    #[serde(default = "default_settle_grace")]
    pub settle_grace_secs: u64,
    /// Kill a trial if no stdout/stderr activity at all within this many seconds.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default = "default_timeout_base")]
    pub timeout_base_secs: u64,
    #[serde(default = "default_timeout_per_billion")]
    pub timeout_secs_per_billion_params: u64,
    /// `RUST_LOG` value to pass to child processes.
    #[serde(default)]
    pub rust_log: Option<String>,
    pub context: ContextSettings,
    #[serde(default)]
    pub probe: Option<ProbeSettings>,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub host: HostSettings,
    /// Extra failure signatures, consulted before the built-ins.
    #[serde(default)]
    pub signatures: Vec<SignatureRule>,
}

/// Command templates for the execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub launch: Vec<String>,
    #[serde(default)]
    pub teardown: Vec<String>,
    /// Where the workload writes its trace inside the context.
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub command: Vec<String>,
    #[serde(default = "default_ready_pattern")]
    pub ready_pattern: String,
    #[serde(default = "default_probe_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_transfer_backoff")]
    pub backoff_base_secs: u64,
    #[serde(default)]
    pub hops: Vec<HopSettings>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_transfer_backoff(),
            hops: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopSettings {
    pub name: String,
    pub command: Vec<String>,
}

/// Host shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostSettings {
    /// Whether to stop the host once every trial resolved without failure.
    #[serde(default)]
    pub stop_on_complete: bool,
    #[serde(default)]
    pub stop: Vec<String>,
}

fn default_checkpoint_file() -> String {
    "./sweep_checkpoint.jsonl".to_string()
}

fn default_artifact_root() -> String {
    "./artifacts".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    10
}

fn default_backoff_max() -> u64 {
    300
}

fn default_settle_grace() -> u64 {
    5
}

fn default_timeout_base() -> u64 {
    600
}

fn default_timeout_per_billion() -> u64 {
    60
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_remote_dir() -> String {
    "/tmp/traces/{trial_id}".to_string()
}

fn default_ready_pattern() -> String {
    "READY".to_string()
}

fn default_probe_attempts() -> u32 {
    20
}

fn default_probe_interval() -> u64 {
    15
}

fn default_staging_dir() -> String {
    "/tmp/staging/{trial_id}".to_string()
}

fn default_transfer_backoff() -> u64 {
    5
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file, merging defaults into each model.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawHarnessConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let models: Vec<ModelDescriptor> = raw
            .models
            .iter()
            .map(|model| {
                merge_toml(&raw.defaults, model)
                    .try_into()
                    .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let config = Self {
            harness: raw.harness,
            sweep: SweepDescription {
                input_length: raw.sweep.input_length,
                output_length: raw.sweep.output_length,
                parallelism: raw.sweep.parallelism,
                batch_sizes: raw.sweep.batch_sizes,
                models,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.harness.context.launch.is_empty() {
            return Err(ConfigError::Invalid(
                "[harness.context] launch command is empty".into(),
            ));
        }
        if self.sweep.models.is_empty() {
            return Err(ConfigError::Invalid("no [[models]] configured".into()));
        }

        let mut seen = HashSet::new();
        for model in &self.sweep.models {
            if model.fan_out == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model {} has fan_out = 0",
                    model.id
                )));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "model {} is listed twice",
                    model.id
                )));
            }
        }

        for hop in &self.harness.transfer.hops {
            if hop.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "transfer hop {} has an empty command",
                    hop.name
                )));
            }
        }

        self.classifier()?;
        Ok(())
    }

    /// Configured signatures followed by the built-ins.
    pub fn classifier(&self) -> Result<SignatureClassifier, ConfigError> {
        SignatureClassifier::from_rules(&self.harness.signatures)
            .map_err(|e| ConfigError::Invalid(format!("bad failure signature: {e}")))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::classify::FailureKind;

    const MINIMAL: &str = r#"
[harness.context]
launch = ["run-bench", "{model}"]

[sweep]
input_length = 128
output_length = 64
parallelism = [4, 1]
batch_sizes = [1, 8]

[[models]]
id = "org/a"
fan_out = 8
"#;

    fn parse_config(toml_str: &str) -> HarnessConfig {
        // Write to unique temp file since load() reads from file
        let dir = tempdir().unwrap();
        let path = dir.path().join("sweep.toml");
        std::fs::write(&path, toml_str).unwrap();
        HarnessConfig::load(&path).unwrap()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config(MINIMAL);
        assert_eq!(config.harness.checkpoint_file, "./sweep_checkpoint.jsonl");
        assert_eq!(config.harness.max_retries, 3);
        assert_eq!(config.harness.context.host, "localhost");
        assert_eq!(config.harness.context.remote_dir, "/tmp/traces/{trial_id}");
        assert_eq!(config.harness.transfer.staging_dir, "/tmp/staging/{trial_id}");
        assert!(config.harness.probe.is_none());
        assert!(!config.harness.host.stop_on_complete);
        assert_eq!(config.sweep.input_length, 128);
        assert_eq!(config.sweep.parallelism, [4, 1]);
        assert_eq!(config.sweep.models, [ModelDescriptor::new("org/a", 8)]);
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse_config(
            r#"
[harness]
max_retries = 5
idle_timeout_secs = 900

[harness.context]
host = "tpu-v5e-8"
launch = ["gcloud", "ssh", "{host}"]

[harness.probe]
command = ["gcloud", "describe", "{host}"]

[harness.transfer]
hops = [
  { name = "context-to-host", command = ["scp", "a", "b"] },
  { name = "host-to-local", command = ["scp", "b", "c"] },
]

[[harness.signatures]]
kind = "oom"
pattern = "(?i)hbm exhausted"

[sweep]
input_length = 128
output_length = 128
parallelism = [8, 4]
batch_sizes = [1, 8]

[defaults]
params_b = 8.0
fan_out = 8

[[models]]
id = "a"

[[models]]
id = "b"
fan_out = 32
params_b = 70.0
batch_sizes = [1]
"#,
        );
        assert_eq!(config.harness.max_retries, 5);
        assert_eq!(config.harness.idle_timeout_secs, Some(900));
        let probe = config.harness.probe.as_ref().unwrap();
        assert_eq!(probe.ready_pattern, "READY");
        assert_eq!(probe.max_attempts, 20);
        assert_eq!(config.harness.transfer.hops.len(), 2);

        let models = &config.sweep.models;
        assert_eq!(models[0].fan_out, 8);
        assert_eq!(models[0].params_b, Some(8.0));
        assert_eq!(models[1].fan_out, 32); // Overridden
        assert_eq!(models[1].params_b, Some(70.0));
        assert_eq!(models[1].batch_sizes.as_deref(), Some(&[1][..]));

        let classifier = config.classifier().unwrap();
        assert_eq!(classifier.classify("HBM exhausted").kind, FailureKind::Oom);
    }

    #[test]
    fn test_rejects_invalid() {
        let no_launch = MINIMAL.replace(r#"launch = ["run-bench", "{model}"]"#, "launch = []");
        assert!(matches!(
            HarnessConfig::parse(&no_launch),
            Err(ConfigError::Invalid(_))
        ));

        let duplicate = format!("{MINIMAL}\n[[models]]\nid = \"org/a\"\nfan_out = 4\n");
        assert!(matches!(
            HarnessConfig::parse(&duplicate),
            Err(ConfigError::Invalid(_))
        ));

        let zero_fan_out = MINIMAL.replace("fan_out = 8", "fan_out = 0");
        assert!(matches!(
            HarnessConfig::parse(&zero_fan_out),
            Err(ConfigError::Invalid(_))
        ));

        let bad_signature =
            format!("{MINIMAL}\n[[harness.signatures]]\nkind = \"oom\"\npattern = \"(\"\n");
        assert!(matches!(
            HarnessConfig::parse(&bad_signature),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            HarnessConfig::load("/nonexistent/sweep.toml"),
            Err(ConfigError::Io(..))
        ));
    }

    #[test]
    fn test_merge_toml_deep() {
        let base: toml::Value = toml::from_str("a = 1\n[t]\nx = 1\ny = 2").unwrap();
        let overlay: toml::Value = toml::from_str("b = 2\n[t]\ny = 3").unwrap();
        let merged = merge_toml(&base, &overlay);
        assert_eq!(merged["a"].as_integer(), Some(1));
        assert_eq!(merged["b"].as_integer(), Some(2));
        assert_eq!(merged["t"]["x"].as_integer(), Some(1));
        assert_eq!(merged["t"]["y"].as_integer(), Some(3));
    }
}
