//! Execution host readiness and shutdown.
//!
//! Readiness is polled through a [`HealthProbe`] before the first dispatch
//! and after transient failures. The optional stop command powers the host
//! down once a sweep finishes cleanly.

use std::{process::Command as StdCommand, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::{clock::Clock, template::TemplateVars};

/// Answers whether the host can accept the next trial.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<bool, HostError>;
}

/// Runs a command and matches its stdout.
pub struct CommandProbe {
    command: Vec<String>,
    ready_pattern: Regex,
}

impl CommandProbe {
    /// `command` may use `{host}`.
    pub fn new(command: &[String], host: &str, ready_pattern: &str) -> Result<Self, HostError> {
        if command.is_empty() {
            return Err(HostError::Config("probe command is empty".into()));
        }
        let ready_pattern = Regex::new(ready_pattern)
            .map_err(|e| HostError::Config(format!("invalid ready_pattern: {e}")))?;
        Ok(Self {
            command: TemplateVars::new().with("host", host).render_all(command),
            ready_pattern,
        })
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self) -> Result<bool, HostError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| HostError::Config("probe command is empty".into()))?;

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HostError::Spawn(program.clone(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let ready = output.status.success() && self.ready_pattern.is_match(&stdout);
        if !ready {
            tracing::debug!(
                "Probe not ready (exit {:?}): {}",
                output.status.code(),
                stdout.trim()
            );
        }
        Ok(ready)
    }
}

/// Polling budget for [`await_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSchedule {
    pub max_attempts: u32,
    pub interval: Duration,
    pub max_interval: Duration,
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(120),
        }
    }
}

/// Poll until the probe reports ready, doubling the wait between polls.
///
/// Returns the number of polls it took. A probe error counts as "not ready".
pub async fn await_ready(
    probe: &dyn HealthProbe,
    clock: &dyn Clock,
    schedule: ProbeSchedule,
) -> Result<u32, HostError> {
    let mut wait = schedule.interval;
    for attempt in 1..=schedule.max_attempts {
        match probe.check().await {
            Ok(true) => return Ok(attempt),
            Ok(false) => {}
            Err(e) => tracing::warn!("Health probe attempt {attempt} errored: {e}"),
        }
        if attempt < schedule.max_attempts {
            clock.sleep(wait).await;
            wait = (wait * 2).min(schedule.max_interval);
        }
    }
    Err(HostError::NeverReady(schedule.max_attempts))
}

/// The execution host and its optional stop-on-complete hook.
pub struct Host {
    host: String,
    stop_on_complete: bool,
    stop: Vec<String>,
}

impl Host {
    #[must_use]
    pub fn new(host: impl Into<String>, stop_on_complete: bool, stop: Vec<String>) -> Self {
        let host = host.into();
        let stop = TemplateVars::new().with("host", host.as_str()).render_all(&stop);
        Self {
            host,
            stop_on_complete,
            stop,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.stop_on_complete && self.check_config().is_none()
    }

    /// Check configuration and return any problems.
    /// Returns None if everything is OK, Some(warning) if there's an issue.
    #[must_use]
    pub fn check_config(&self) -> Option<String> {
        if !self.stop_on_complete {
            return None;
        }

        let Some(program) = self.stop.first() else {
            return Some("stop_on_complete is set but no stop command is configured".into());
        };

        if Self::has_binary(program) {
            None
        } else {
            Some(format!(
                "stop_on_complete is set but `{program}` was not found in PATH"
            ))
        }
    }

    fn has_binary(program: &str) -> bool {
        if program.contains('/') {
            return std::path::Path::new(program).exists();
        }
        StdCommand::new("which")
            .arg(program)
            .output()
            .is_ok_and(|o| o.status.success())
    }

    /// Run the stop command.
    pub fn stop(&self) -> Result<(), HostError> {
        if !self.stop_on_complete {
            return Err(HostError::Disabled);
        }
        let (program, args) = self
            .stop
            .split_first()
            .ok_or_else(|| HostError::Config("stop command is empty".into()))?;

        tracing::info!("Stopping host {}", self.host);

        let output = StdCommand::new(program)
            .args(args)
            .output()
            .map_err(|e| HostError::Spawn(program.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HostError::Command(stderr.into_owned()));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host stop is disabled")]
    Disabled,
    #[error("host configuration: {0}")]
    Config(String),
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("host command failed: {0}")]
    Command(String),
    #[error("host not ready after {0} probe attempts")]
    NeverReady(u32),
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::clock::ManualClock;

    /// Becomes ready on the `ready_at`-th check.
    struct CountingProbe {
        calls: AtomicU32,
        ready_at: u32,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn check(&self) -> Result<bool, HostError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n >= self.ready_at)
        }
    }

    struct ErrProbe(Mutex<u32>);

    #[async_trait]
    impl HealthProbe for ErrProbe {
        async fn check(&self) -> Result<bool, HostError> {
            let mut n = self.0.lock().unwrap();
            *n += 1;
            if *n < 2 {
                Err(HostError::Command("ssh: timeout".into()))
            } else {
                Ok(true)
            }
        }
    }

    fn schedule(max_attempts: u32) -> ProbeSchedule {
        ProbeSchedule {
            max_attempts,
            interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_await_ready_backs_off() {
        let clock = ManualClock::new(0);
        let probe = CountingProbe {
            calls: AtomicU32::new(0),
            ready_at: 4,
        };
        let polls = await_ready(&probe, &clock, schedule(10)).await.unwrap();
        assert_eq!(polls, 4);
        assert_eq!(
            clock.sleeps(),
            [10, 20, 30].map(Duration::from_secs).to_vec()
        );
    }

    #[tokio::test]
    async fn test_await_ready_exhausted() {
        let clock = ManualClock::new(0);
        let probe = CountingProbe {
            calls: AtomicU32::new(0),
            ready_at: u32::MAX,
        };
        let err = await_ready(&probe, &clock, schedule(3)).await.unwrap_err();
        assert!(matches!(err, HostError::NeverReady(3)));
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_probe_error_is_not_ready() {
        let clock = ManualClock::new(0);
        let probe = ErrProbe(Mutex::new(0));
        assert_eq!(await_ready(&probe, &clock, schedule(3)).await.unwrap(), 2);
    }

    #[test]
    fn test_disabled() {
        let host = Host::new("tpu-1", false, vec![]);
        assert!(!host.is_available());
        assert!(host.check_config().is_none());
        assert!(matches!(host.stop(), Err(HostError::Disabled)));
    }

    #[test]
    fn test_missing_stop_command() {
        let host = Host::new("tpu-1", true, vec![]);
        assert!(host.check_config().is_some());
        assert!(!host.is_available());

        let host = Host::new("tpu-1", true, vec!["/nonexistent/stopper".into()]);
        assert!(host.check_config().unwrap().contains("/nonexistent/stopper"));
    }

    #[test]
    fn test_stop_renders_host() {
        let host = Host::new("tpu-1", true, vec!["echo".into(), "stop {host}".into()]);
        assert_eq!(host.stop, ["echo", "stop tpu-1"]);
        assert_eq!(host.name(), "tpu-1");
    }

    #[test]
    fn test_probe_rejects_bad_pattern() {
        assert!(CommandProbe::new(&["true".into()], "h", "(").is_err());
        assert!(CommandProbe::new(&[], "h", "READY").is_err());
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_command_probe() {
        let ready =
            CommandProbe::new(&["echo".into(), "state: READY {host}".into()], "h", "READY")
                .unwrap();
        assert!(ready.check().await.unwrap());

        let failing = CommandProbe::new(&["false".into()], "h", ".*").unwrap();
        assert!(!failing.check().await.unwrap());
    }
}
