//! Trial execution against a remote or containerized context.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use sweep_config::{ModelDescriptor, TrialSpec, TrialStatus};
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
    task::JoinHandle,
};

use crate::{
    budget::TimeoutEstimator,
    classify::{FailureKind, SignatureClassifier},
    state::now_timestamp,
    template::TemplateVars,
};

/// Lines of stdout/stderr kept for classification.
const TAIL_LINES: usize = 50;

/// How long to wait for log streams to drain after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw outcome of one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

impl LaunchOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stderr tail followed by stdout tail.
    #[must_use]
    pub fn diagnostics(&self) -> String {
        let mut text = self.stderr_tail.join("\n");
        if !self.stdout_tail.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&self.stdout_tail.join("\n"));
        }
        text
    }
}

/// Where trials actually run.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    fn host(&self) -> &str;

    /// Run the workload for `spec` and wait for it, bounded by `timeout`.
    ///
    /// An `Err` means the context could not be established at all (for
    /// instance the launcher binary is missing), not that the trial failed.
    async fn launch(
        &self,
        spec: &TrialSpec,
        attempt: u32,
        timeout: Duration,
    ) -> Result<LaunchOutput, ExecutorError>;

    /// Release the accelerators held for `spec`.
    async fn teardown(&self, spec: &TrialSpec) -> Result<(), ExecutorError>;
}

/// Runs configured command templates as local subprocesses.
pub struct CommandContext {
    host: String,
    launch: Vec<String>,
    teardown: Vec<String>,
    remote_dir: String,
    log_dir: PathBuf,
    rust_log: Option<String>,
    idle_timeout: Option<Duration>,
}

impl CommandContext {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        launch: Vec<String>,
        teardown: Vec<String>,
        remote_dir: impl Into<String>,
        log_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            host: host.into(),
            launch,
            teardown,
            remote_dir: remote_dir.into(),
            log_dir: log_dir.as_ref().to_path_buf(),
            rust_log: None,
            idle_timeout: None,
        }
    }

    /// `RUST_LOG` value for child processes.
    #[must_use]
    pub fn with_rust_log(mut self, rust_log: Option<String>) -> Self {
        self.rust_log = rust_log;
        self
    }

    /// Kill a trial that produces no output for this long.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn vars(&self, spec: &TrialSpec) -> TemplateVars {
        let vars = TemplateVars::for_trial(spec).with("host", self.host.as_str());
        let remote_dir = vars.render(&self.remote_dir);
        vars.with("remote_dir", remote_dir)
    }

    fn command(&self, args: &[String]) -> Result<Command, ExecutorError> {
        let (program, rest) = args.split_first().ok_or(ExecutorError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(rest).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(ref rust_log) = self.rust_log {
            cmd.env("RUST_LOG", rust_log);
        }
        Ok(cmd)
    }
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Idle,
}

#[async_trait]
impl ExecutionContext for CommandContext {
    fn host(&self) -> &str {
        &self.host
    }

    async fn launch(
        &self,
        spec: &TrialSpec,
        attempt: u32,
        timeout: Duration,
    ) -> Result<LaunchOutput, ExecutorError> {
        let trial_id = spec.id();
        let args = self.vars(spec).render_all(&self.launch);
        let log_dir = self.log_dir.join(&trial_id);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|e| ExecutorError::Io(log_dir.clone(), e))?;

        tracing::debug!("Launching {trial_id} (attempt {attempt}): {}", args.join(" "));

        let mut child = self
            .command(&args)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::Spawn(args[0].clone(), e))?;

        let activity = Arc::new(AtomicU64::new(unix_now()));
        let separator = format!("\n--- retry at {} ---\n\n", now_timestamp());

        let stdout_task = child.stdout.take().map(|s| {
            tokio::spawn(stream_lines(
                s,
                log_dir.join("stdout.log"),
                separator.clone(),
                activity.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|s| {
            tokio::spawn(stream_lines(
                s,
                log_dir.join("stderr.log"),
                separator.clone(),
                activity.clone(),
            ))
        });

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            () = tokio::time::sleep(timeout) => Exit::TimedOut,
            () = idle_watch(activity, self.idle_timeout) => Exit::Idle,
        };

        let (exit_code, timed_out) = match exit {
            Exit::Status(Ok(status)) => (status.code(), false),
            Exit::Status(Err(e)) => return Err(ExecutorError::Wait(trial_id, e)),
            Exit::TimedOut => {
                tracing::error!("{trial_id}: exceeded {}s timeout, killing", timeout.as_secs());
                let _ = child.kill().await;
                (None, true)
            }
            Exit::Idle => {
                tracing::error!("{trial_id}: no output activity, killing");
                let _ = child.kill().await;
                (None, true)
            }
        };

        Ok(LaunchOutput {
            exit_code,
            timed_out,
            stdout_tail: drain(stdout_task).await,
            stderr_tail: drain(stderr_task).await,
        })
    }

    async fn teardown(&self, spec: &TrialSpec) -> Result<(), ExecutorError> {
        if self.teardown.is_empty() {
            return Ok(());
        }
        let args = self.vars(spec).render_all(&self.teardown);
        let output = self
            .command(&args)?
            .output()
            .await
            .map_err(|e| ExecutorError::Spawn(args[0].clone(), e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ExecutorError::Teardown(
                spec.id(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Copy lines to `path` (appending, with a separator between attempts) and
/// return the last [`TAIL_LINES`].
async fn stream_lines<R>(
    reader: R,
    path: PathBuf,
    separator: String,
    activity: Arc<AtomicU64>,
) -> Vec<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .ok();

    if let Some(ref mut f) = file
        && f.metadata().await.is_ok_and(|m| m.len() > 0)
    {
        let _ = f.write_all(separator.as_bytes()).await;
    }

    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        activity.store(unix_now(), Ordering::Relaxed);
        if let Some(ref mut f) = file {
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }
        if tail.len() >= TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    if let Some(ref mut f) = file {
        let _ = f.flush().await;
    }
    tail.into_iter().collect()
}

/// Join a stream task, giving up if a grandchild still holds the pipe open.
async fn drain(task: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(tail)) => tail,
        _ => Vec::new(),
    }
}

/// Resolves once no output has been seen for `idle_timeout`; never if `None`.
async fn idle_watch(last_activity: Arc<AtomicU64>, idle_timeout: Option<Duration>) {
    let Some(idle_timeout) = idle_timeout else {
        return std::future::pending().await;
    };
    let poll = idle_timeout.min(Duration::from_secs(5));
    loop {
        tokio::time::sleep(poll).await;
        let idle = unix_now().saturating_sub(last_activity.load(Ordering::Relaxed));
        if idle >= idle_timeout.as_secs() {
            return;
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Outcome of one attempt at one trial. Never mutated once recorded; a retry
/// produces a new result with a higher `attempt`.
#[derive(Debug, Clone)]
pub struct TrialResult {
    pub spec: TrialSpec,
    pub status: TrialStatus,
    pub attempt: u32,
    pub error_kind: Option<FailureKind>,
    pub exit_code: Option<i32>,
    /// Captured stderr/stdout tail for failed attempts.
    pub diagnostics: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub wall_clock_secs: f64,
    /// Set once the artifacts have been transferred.
    pub artifact_path: Option<PathBuf>,
}

/// Runs one trial and classifies its outcome.
pub struct TrialExecutor {
    context: Arc<dyn ExecutionContext>,
    classifier: SignatureClassifier,
    timeouts: HashMap<String, Duration>,
    default_timeout: Duration,
}

impl TrialExecutor {
    #[must_use]
    pub fn new(
        context: Arc<dyn ExecutionContext>,
        classifier: SignatureClassifier,
        budget: &TimeoutEstimator,
        models: &[ModelDescriptor],
    ) -> Self {
        let timeouts = models
            .iter()
            .map(|m| (m.id.clone(), budget.timeout(m)))
            .collect();
        Self {
            context,
            classifier,
            timeouts,
            default_timeout: Duration::from_secs(budget.base_secs),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        self.context.host()
    }

    #[must_use]
    pub fn timeout_for(&self, model_id: &str) -> Duration {
        self.timeouts
            .get(model_id)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Run `spec` once. The context is torn down whatever happens.
    pub async fn execute(
        &self,
        spec: &TrialSpec,
        attempt: u32,
    ) -> Result<TrialResult, ExecutorError> {
        let started_at = now_timestamp();
        let start = Instant::now();
        let timeout = self.timeout_for(&spec.model_id);

        let launched = self.context.launch(spec, attempt, timeout).await;
        if let Err(e) = self.context.teardown(spec).await {
            tracing::warn!("Teardown after {} failed: {e}", spec.id());
        }
        let output = launched?;

        let (status, error_kind, diagnostics) = if output.success() {
            (TrialStatus::Succeeded, None, None)
        } else if output.timed_out {
            (
                TrialStatus::Failed,
                Some(FailureKind::Timeout),
                Some(output.diagnostics()),
            )
        } else {
            let text = output.diagnostics();
            let classification = self.classifier.classify(&text);
            if let Some(ref matched) = classification.matched {
                tracing::debug!(
                    "{} classified as {} on {matched:?}",
                    spec.id(),
                    classification.kind
                );
            }
            let status = match classification.kind {
                FailureKind::Oom => TrialStatus::SkippedOom,
                FailureKind::Invalid => TrialStatus::SkippedInvalid,
                _ => TrialStatus::Failed,
            };
            (status, Some(classification.kind), Some(text))
        };

        Ok(TrialResult {
            spec: spec.clone(),
            status,
            attempt,
            error_kind,
            exit_code: output.exit_code,
            diagnostics,
            started_at,
            finished_at: now_timestamp(),
            wall_clock_secs: start.elapsed().as_secs_f64(),
            artifact_path: None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("command template is empty")]
    EmptyCommand,
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("failed to wait for {0}: {1}")]
    Wait(String, std::io::Error),
    #[error("teardown for {0} failed: {1}")]
    Teardown(String, String),
    #[error("io error at {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Replays canned outputs and records teardowns.
    struct Canned {
        output: Mutex<Option<Result<LaunchOutput, ExecutorError>>>,
        teardowns: AtomicU64,
    }

    impl Canned {
        fn new(output: Result<LaunchOutput, ExecutorError>) -> Arc<Self> {
            Arc::new(Self {
                output: Mutex::new(Some(output)),
                teardowns: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl ExecutionContext for Canned {
        fn host(&self) -> &str {
            "fake"
        }

        async fn launch(
            &self,
            _spec: &TrialSpec,
            _attempt: u32,
            _timeout: Duration,
        ) -> Result<LaunchOutput, ExecutorError> {
            self.output.lock().unwrap().take().unwrap()
        }

        async fn teardown(&self, _spec: &TrialSpec) -> Result<(), ExecutorError> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Err(ExecutorError::Teardown("x".into(), "already gone".into()))
        }
    }

    fn failed(stderr: &str) -> LaunchOutput {
        LaunchOutput {
            exit_code: Some(1),
            stderr_tail: vec![stderr.to_string()],
            ..LaunchOutput::default()
        }
    }

    async fn run(output: Result<LaunchOutput, ExecutorError>) -> Result<TrialResult, ExecutorError> {
        let ctx = Canned::new(output);
        let executor = TrialExecutor::new(
            ctx.clone(),
            SignatureClassifier::with_defaults(),
            &TimeoutEstimator::default(),
            &[],
        );
        let result = executor
            .execute(&TrialSpec::new("m", 1, 1, 8, 8), 1)
            .await;
        assert_eq!(ctx.teardowns.load(Ordering::SeqCst), 1, "always torn down");
        result
    }

    #[tokio::test]
    async fn test_success() {
        let result = run(Ok(LaunchOutput {
            exit_code: Some(0),
            ..LaunchOutput::default()
        }))
        .await
        .unwrap();
        assert_eq!(result.status, TrialStatus::Succeeded);
        assert_eq!(result.error_kind, None);
        assert_eq!(result.attempt, 1);
    }

    #[tokio::test]
    async fn test_oom_is_skipped_not_failed() {
        let result = run(Ok(failed("RESOURCE_EXHAUSTED: out of HBM"))).await.unwrap();
        assert_eq!(result.status, TrialStatus::SkippedOom);
        assert_eq!(result.error_kind, Some(FailureKind::Oom));
    }

    #[tokio::test]
    async fn test_invalid() {
        let result = run(Ok(failed("heads must be divisible by tp"))).await.unwrap();
        assert_eq!(result.status, TrialStatus::SkippedInvalid);
    }

    #[tokio::test]
    async fn test_transient_and_unknown_fail() {
        let result = run(Ok(failed("Connection reset by peer"))).await.unwrap();
        assert_eq!(result.status, TrialStatus::Failed);
        assert_eq!(result.error_kind, Some(FailureKind::TransientInfra));

        let result = run(Ok(failed("Segmentation fault"))).await.unwrap();
        assert_eq!(result.error_kind, Some(FailureKind::Unknown));
        assert_eq!(result.diagnostics.as_deref(), Some("Segmentation fault"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = run(Ok(LaunchOutput {
            timed_out: true,
            ..LaunchOutput::default()
        }))
        .await
        .unwrap();
        assert_eq!(result.status, TrialStatus::Failed);
        assert_eq!(result.error_kind, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_spawn_error_propagates() {
        let err = run(Err(ExecutorError::Spawn(
            "gcloud".into(),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        )))
        .await
        .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn(..)));
    }

    #[test]
    fn test_diagnostics_order() {
        let out = LaunchOutput {
            exit_code: Some(2),
            timed_out: false,
            stdout_tail: vec!["out".into()],
            stderr_tail: vec!["err1".into(), "err2".into()],
        };
        assert_eq!(out.diagnostics(), "err1\nerr2\nout");
        assert!(!out.success());
    }

    #[test]
    fn test_timeout_for() {
        let models = [ModelDescriptor {
            params_b: Some(10.0),
            ..ModelDescriptor::new("big", 8)
        }];
        let executor = TrialExecutor::new(
            Canned::new(Ok(LaunchOutput::default())),
            SignatureClassifier::empty(),
            &TimeoutEstimator::default(),
            &models,
        );
        assert_eq!(executor.timeout_for("big"), Duration::from_secs(1200));
        assert_eq!(executor.timeout_for("other"), Duration::from_secs(600));
        assert_eq!(executor.host(), "fake");
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_command_context_streams_logs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext::new(
            "local",
            vec![
                "sh".into(),
                "-c".into(),
                "echo run {model} tp={parallelism} to {remote_dir}; echo boom >&2; exit 3".into(),
            ],
            vec![],
            "/tmp/traces/{trial_id}",
            dir.path(),
        );
        let spec = TrialSpec::new("m", 2, 4, 8, 8);
        let out = ctx
            .launch(&spec, 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(
            out.stdout_tail,
            [format!("run m tp=2 to /tmp/traces/{}", spec.id())]
        );
        assert_eq!(out.stderr_tail, ["boom"]);

        // Second attempt appends with a separator.
        ctx.launch(&spec, 2, Duration::from_secs(30)).await.unwrap();
        let log = std::fs::read_to_string(dir.path().join(spec.id()).join("stderr.log")).unwrap();
        assert!(log.contains("--- retry at"));
        assert_eq!(log.matches("boom").count(), 2);
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_command_context_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext::new(
            "local",
            vec!["sleep".into(), "30".into()],
            vec!["true".into()],
            "/tmp",
            dir.path(),
        );
        let out = ctx
            .launch(&TrialSpec::new("m", 1, 1, 1, 1), 1, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(ctx.teardown(&TrialSpec::new("m", 1, 1, 1, 1)).await.is_ok());
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_command_context_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CommandContext::new(
            "local",
            vec!["/nonexistent/launcher".into()],
            vec![],
            "/tmp",
            dir.path(),
        );
        let err = ctx
            .launch(&TrialSpec::new("m", 1, 1, 1, 1), 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn(..)));
    }
}
