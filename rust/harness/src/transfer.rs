//! Artifact transfer from the execution context to local storage.
//!
//! A transfer is a sequence of hops (context → intermediate host → local
//! disk). Each hop is retried on its own, and finished hops are recorded in
//! `transfer.json` inside the trial's local directory so a later attempt
//! resumes where the previous one stopped. Writing `metadata.json` is the
//! last step; its presence marks the artifact complete.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sweep_config::TrialSpec;
use tokio::process::Command;

use crate::{
    clock::Clock, policy::RetryPolicy, runner::TrialResult, state::now_timestamp,
    template::TemplateVars,
};

pub const METADATA_FILE: &str = "metadata.json";
pub const TRANSFER_LOG: &str = "transfer.json";

/// One leg of an artifact transfer. Must be idempotent.
#[async_trait]
pub trait Hop: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, spec: &TrialSpec, local_dir: &Path) -> Result<(), TransferError>;
}

/// A hop backed by a command template.
///
/// Placeholders: the trial's own plus `{host}`, `{remote_dir}`,
/// `{staging_dir}` and `{local_dir}`.
pub struct CommandHop {
    name: String,
    command: Vec<String>,
    host: String,
    remote_dir: String,
    staging_dir: String,
}

impl CommandHop {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        host: impl Into<String>,
        remote_dir: impl Into<String>,
        staging_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            host: host.into(),
            remote_dir: remote_dir.into(),
            staging_dir: staging_dir.into(),
        }
    }

    fn render(&self, spec: &TrialSpec, local_dir: &Path) -> Vec<String> {
        let vars = TemplateVars::for_trial(spec).with("host", self.host.as_str());
        let remote_dir = vars.render(&self.remote_dir);
        let staging_dir = vars.render(&self.staging_dir);
        vars.with("remote_dir", remote_dir)
            .with("staging_dir", staging_dir)
            .with("local_dir", local_dir.display().to_string())
            .render_all(&self.command)
    }
}

#[async_trait]
impl Hop for CommandHop {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, spec: &TrialSpec, local_dir: &Path) -> Result<(), TransferError> {
        let args = self.render(spec, local_dir);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| TransferError::Hop(self.name.clone(), "empty command".into()))?;
        tracing::debug!("Hop {}: {}", self.name, args.join(" "));

        let output = Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TransferError::Hop(self.name.clone(), format!("spawn {program}: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TransferError::Hop(
                self.name.clone(),
                format!("exit {:?}: {}", output.status.code(), stderr.trim()),
            ))
        }
    }
}

/// Hops already finished for the current execution of one trial.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TransferLog {
    completed: Vec<String>,
}

/// Sidecar written next to the transferred traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub trial_id: String,
    pub spec: TrialSpec,
    pub host: String,
    pub started_at: String,
    pub finished_at: String,
    pub wall_clock_secs: f64,
    pub attempts: u32,
    /// Trace files relative to the artifact directory.
    pub trace_files: Vec<String>,
    pub hops: Vec<String>,
    pub transferred_at: String,
}

pub struct TransferPipeline {
    artifact_root: PathBuf,
    hops: Vec<Box<dyn Hop>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    host: String,
}

impl TransferPipeline {
    #[must_use]
    pub fn new(artifact_root: impl AsRef<Path>, hops: Vec<Box<dyn Hop>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            artifact_root: artifact_root.as_ref().to_path_buf(),
            hops,
            clock,
            retry: RetryPolicy {
                max_retries: 3,
                backoff_base: Duration::from_secs(5),
                backoff_max: Duration::from_secs(300),
            },
            host: String::new(),
        }
    }

    /// Per-hop retry budget.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff_base: Duration) -> Self {
        self.retry.max_retries = max_retries;
        self.retry.backoff_base = backoff_base;
        self
    }

    /// Host name recorded in the sidecar.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn local_dir(&self, trial_id: &str) -> PathBuf {
        self.artifact_root.join(trial_id)
    }

    /// Whether a previous transfer for `trial_id` ran to completion.
    #[must_use]
    pub fn is_complete(&self, trial_id: &str) -> bool {
        self.local_dir(trial_id).join(METADATA_FILE).is_file()
    }

    /// Forget hop progress and traces from an earlier execution of `trial_id`.
    ///
    /// Must be called before the workload runs again: finished hops in
    /// `transfer.json` describe the old execution's artifacts.
    pub fn discard_partial(&self, trial_id: &str) -> Result<(), TransferError> {
        let dir = self.local_dir(trial_id);
        if !dir.is_dir() {
            return Ok(());
        }
        let log_path = dir.join(TRANSFER_LOG);
        match std::fs::remove_file(&log_path) {
            Ok(()) => tracing::info!("{trial_id}: discarding partial transfer"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(TransferError::Io(log_path, e)),
        }
        for file in list_trace_files(&dir)? {
            let path = dir.join(file);
            std::fs::remove_file(&path).map_err(|e| TransferError::Io(path.clone(), e))?;
        }
        Ok(())
    }

    /// Run the remaining hops for a successful trial and write its sidecar.
    pub async fn transfer(
        &self,
        spec: &TrialSpec,
        result: &TrialResult,
    ) -> Result<PathBuf, TransferError> {
        let trial_id = spec.id();
        let dir = self.local_dir(&trial_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::Io(dir.clone(), e))?;

        let log_path = dir.join(TRANSFER_LOG);
        let mut log: TransferLog = read_json(&log_path)?.unwrap_or_default();

        for hop in &self.hops {
            if log.completed.iter().any(|h| h == hop.name()) {
                tracing::debug!("{trial_id}: hop {} already done", hop.name());
                continue;
            }
            self.run_hop(hop.as_ref(), spec, &dir).await?;
            log.completed.push(hop.name().to_string());
            write_json_atomic(&log_path, &log)?;
        }

        let trace_files = list_trace_files(&dir)?;
        if trace_files.is_empty() {
            tracing::warn!("{trial_id}: no trace files found in {}", dir.display());
        }

        let metadata = ArtifactMetadata {
            trial_id: trial_id.clone(),
            spec: spec.clone(),
            host: self.host.clone(),
            started_at: result.started_at.clone(),
            finished_at: result.finished_at.clone(),
            wall_clock_secs: result.wall_clock_secs,
            attempts: result.attempt,
            trace_files,
            hops: log.completed,
            transferred_at: now_timestamp(),
        };
        write_json_atomic(&dir.join(METADATA_FILE), &metadata)?;
        tracing::info!("{trial_id}: artifacts stored in {}", dir.display());
        Ok(dir)
    }

    async fn run_hop(
        &self,
        hop: &dyn Hop,
        spec: &TrialSpec,
        dir: &Path,
    ) -> Result<(), TransferError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match hop.run(spec, dir).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt <= self.retry.max_retries => {
                    let wait = self.retry.backoff(attempt);
                    tracing::warn!(
                        "{}: hop {} attempt {attempt} failed ({e}), retrying in {}s",
                        spec.id(),
                        hop.name(),
                        wait.as_secs()
                    );
                    self.clock.sleep(wait).await;
                }
                Err(e) => {
                    return Err(TransferError::Exhausted(
                        hop.name().to_string(),
                        attempt,
                        Box::new(e),
                    ));
                }
            }
        }
    }
}

/// Read the sidecar of a transferred artifact.
pub fn read_metadata(dir: impl AsRef<Path>) -> Result<Option<ArtifactMetadata>, TransferError> {
    read_json(&dir.as_ref().join(METADATA_FILE))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, TransferError> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| TransferError::Json(path.to_path_buf(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TransferError::Io(path.to_path_buf(), e)),
    }
}

/// Write via a temp file in the same directory, then rename over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), TransferError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|e| TransferError::Json(path.to_path_buf(), e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&tmp, content).map_err(|e| TransferError::Io(tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| TransferError::Io(path.to_path_buf(), e))
}

/// Trace files under `dir`, relative and sorted.
fn list_trace_files(dir: &Path) -> Result<Vec<String>, TransferError> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.display().to_string()));
    let entries = glob::glob(&pattern).map_err(|e| TransferError::Glob(e.to_string()))?;
    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(sweep_trace::is_trace_file)
        })
        .filter_map(|p| {
            p.strip_prefix(dir)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("io error at {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("invalid json in {0}: {1}")]
    Json(PathBuf, serde_json::Error),
    #[error("bad glob pattern: {0}")]
    Glob(String),
    #[error("hop {0} failed: {1}")]
    Hop(String, String),
    #[error("hop {0} gave up after {1} attempts: {2}")]
    Exhausted(String, u32, #[source] Box<TransferError>),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use sweep_config::TrialStatus;

    use super::*;
    use crate::clock::ManualClock;

    /// Fails `failures` times, then writes `file` into the local dir.
    struct FlakyHop {
        name: &'static str,
        failures: u32,
        calls: Arc<AtomicU32>,
        file: Option<&'static str>,
    }

    #[async_trait]
    impl Hop for FlakyHop {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _spec: &TrialSpec, local_dir: &Path) -> Result<(), TransferError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TransferError::Hop(self.name.into(), "scp: lost connection".into()));
            }
            if let Some(file) = self.file {
                std::fs::write(local_dir.join(file), "{\"events\": []}").unwrap();
            }
            Ok(())
        }
    }

    fn hop(name: &'static str, failures: u32, file: Option<&'static str>) -> (Box<dyn Hop>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Box::new(FlakyHop {
                name,
                failures,
                calls: calls.clone(),
                file,
            }),
            calls,
        )
    }

    fn result(spec: &TrialSpec) -> TrialResult {
        TrialResult {
            spec: spec.clone(),
            status: TrialStatus::Succeeded,
            attempt: 2,
            error_kind: None,
            exit_code: Some(0),
            diagnostics: None,
            started_at: "2026-01-01T00:00:00Z".into(),
            finished_at: "2026-01-01T00:10:00Z".into(),
            wall_clock_secs: 600.0,
            artifact_path: None,
        }
    }

    #[tokio::test]
    async fn test_transfer_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let (h1, c1) = hop("context-to-host", 0, None);
        let (h2, c2) = hop("host-to-local", 0, Some("trace.json"));
        let pipeline = TransferPipeline::new(dir.path(), vec![h1, h2], clock).with_host("tpu-1");
        let spec = TrialSpec::new("m", 1, 8, 16, 16);

        assert!(!pipeline.is_complete(&spec.id()));
        let local = pipeline.transfer(&spec, &result(&spec)).await.unwrap();
        assert_eq!(local, dir.path().join(spec.id()));
        assert!(pipeline.is_complete(&spec.id()));
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);

        let meta = read_metadata(&local).unwrap().unwrap();
        assert_eq!(meta.trial_id, spec.id());
        assert_eq!(meta.host, "tpu-1");
        assert_eq!(meta.attempts, 2);
        assert_eq!(meta.trace_files, ["trace.json"]);
        assert_eq!(meta.hops, ["context-to-host", "host-to-local"]);
    }

    #[tokio::test]
    async fn test_hop_retried_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let (h1, c1) = hop("a", 2, Some("t.json"));
        let pipeline = TransferPipeline::new(dir.path(), vec![h1], clock.clone())
            .with_retries(3, Duration::from_secs(5));
        let spec = TrialSpec::new("m", 1, 1, 1, 1);

        pipeline.transfer(&spec, &result(&spec)).await.unwrap();
        assert_eq!(c1.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            [Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[tokio::test]
    async fn test_completed_hops_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let spec = TrialSpec::new("m", 1, 1, 1, 1);

        // First hop succeeds, second never does.
        let (h1, c1) = hop("a", 0, None);
        let (h2, _) = hop("b", u32::MAX, None);
        let pipeline =
            TransferPipeline::new(dir.path(), vec![h1, h2], clock.clone()).with_retries(1, Duration::from_secs(1));
        let err = pipeline.transfer(&spec, &result(&spec)).await.unwrap_err();
        assert!(matches!(err, TransferError::Exhausted(ref name, 2, _) if name == "b"));
        assert!(!pipeline.is_complete(&spec.id()));

        // A new pipeline over the same directory only reruns the second hop.
        let (h1_again, c1_again) = hop("a", 0, None);
        let (h2_fixed, c2_fixed) = hop("b", 0, Some("trace.json.zst"));
        let pipeline = TransferPipeline::new(dir.path(), vec![h1_again, h2_fixed], clock);
        pipeline.transfer(&spec, &result(&spec)).await.unwrap();
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c1_again.load(Ordering::SeqCst), 0);
        assert_eq!(c2_fixed.load(Ordering::SeqCst), 1);
        assert!(pipeline.is_complete(&spec.id()));
    }

    #[tokio::test]
    async fn test_discard_partial_restarts_hops() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let spec = TrialSpec::new("m", 1, 1, 1, 1);

        let (h1, _) = hop("a", 0, Some("old.trace.json"));
        let (h2, _) = hop("b", u32::MAX, None);
        let pipeline = TransferPipeline::new(dir.path(), vec![h1, h2], clock.clone())
            .with_retries(0, Duration::from_secs(1));
        pipeline.transfer(&spec, &result(&spec)).await.unwrap_err();

        pipeline.discard_partial(&spec.id()).unwrap();
        let local = pipeline.local_dir(&spec.id());
        assert!(!local.join(TRANSFER_LOG).exists());
        assert!(!local.join("old.trace.json").exists());

        let (h1_again, c1_again) = hop("a", 0, None);
        let (h2_fixed, _) = hop("b", 0, Some("trace.json"));
        let pipeline = TransferPipeline::new(dir.path(), vec![h1_again, h2_fixed], clock);
        pipeline.transfer(&spec, &result(&spec)).await.unwrap();
        assert_eq!(c1_again.load(Ordering::SeqCst), 1, "first hop runs again");
        let meta = read_metadata(&local).unwrap().unwrap();
        assert_eq!(meta.trace_files, ["trace.json"]);
    }

    #[test]
    fn test_discard_partial_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline =
            TransferPipeline::new(dir.path(), Vec::new(), Arc::new(ManualClock::new(0)));
        pipeline.discard_partial("never-ran").unwrap();
    }

    #[test]
    fn test_list_trace_files_excludes_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("plugins/profile")).unwrap();
        std::fs::write(dir.path().join("plugins/profile/host.trace.json.zst"), b"").unwrap();
        std::fs::write(dir.path().join("plugins/profile/host.trace.json.gz"), b"").unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), b"{}").unwrap();
        std::fs::write(dir.path().join(TRANSFER_LOG), b"{}").unwrap();
        std::fs::write(dir.path().join("stdout.log"), b"").unwrap();
        assert_eq!(
            list_trace_files(dir.path()).unwrap(),
            [
                "a.json",
                "plugins/profile/host.trace.json.gz",
                "plugins/profile/host.trace.json.zst"
            ]
        );
    }

    #[test]
    fn test_command_hop_render() {
        let hop = CommandHop::new(
            "context-to-host",
            vec![
                "scp".into(),
                "{host}:{remote_dir}/*".into(),
                "{staging_dir}".into(),
                "{local_dir}".into(),
            ],
            "tpu-1",
            "/tmp/traces/{trial_id}",
            "/tmp/staging/{trial_id}",
        );
        let spec = TrialSpec::new("m", 2, 4, 8, 8);
        let args = hop.render(&spec, Path::new("/data/x"));
        let id = spec.id();
        assert_eq!(
            args,
            [
                "scp".to_string(),
                format!("tpu-1:/tmp/traces/{id}/*"),
                format!("/tmp/staging/{id}"),
                "/data/x".to_string(),
            ]
        );
    }

    #[test]
    fn test_read_metadata_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_metadata(dir.path()).unwrap().is_none());
        std::fs::write(dir.path().join(METADATA_FILE), b"{not json").unwrap();
        assert!(matches!(read_metadata(dir.path()), Err(TransferError::Json(..))));
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_command_hop_failure() {
        let dir = tempfile::tempdir().unwrap();
        let hop = CommandHop::new("h", vec!["sh".into(), "-c".into(), "echo nope >&2; exit 1".into()], "x", "/r", "/s");
        let err = hop.run(&TrialSpec::new("m", 1, 1, 1, 1), dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
