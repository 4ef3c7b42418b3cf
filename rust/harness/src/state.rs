//! Checkpoint persistence.
//!
//! An append-only JSON Lines log, one [`CheckpointEntry`] per line; the
//! latest entry for a trial id wins. Appends are a single newline-terminated
//! write under an exclusive lock, so a crash can leave at most one torn
//! trailing line. Readers ignore it and the next writer truncates it.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sweep_config::TrialStatus;

/// One line of the checkpoint log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub trial_id: String,
    pub status: TrialStatus,
    /// RFC 3339.
    pub recorded_at: String,
    pub attempts: u32,
}

/// Latest entry per trial id, as of one read of the log.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    latest: HashMap<String, CheckpointEntry>,
    /// Trial ids in first-seen order.
    order: Vec<String>,
    /// Terminated lines read, including superseded ones.
    pub lines: usize,
}

impl CheckpointSnapshot {
    fn apply(&mut self, entry: CheckpointEntry) {
        if !self.latest.contains_key(&entry.trial_id) {
            self.order.push(entry.trial_id.clone());
        }
        self.latest.insert(entry.trial_id.clone(), entry);
    }

    #[must_use]
    pub fn get(&self, trial_id: &str) -> Option<&CheckpointEntry> {
        self.latest.get(trial_id)
    }

    #[must_use]
    pub fn status(&self, trial_id: &str) -> Option<TrialStatus> {
        self.get(trial_id).map(|e| e.status)
    }

    /// Whether the latest entry for `trial_id` is `succeeded`.
    #[must_use]
    pub fn is_done(&self, trial_id: &str) -> bool {
        self.status(trial_id) == Some(TrialStatus::Succeeded)
    }

    /// Latest entries in first-seen order.
    pub fn entries(&self) -> impl Iterator<Item = &CheckpointEntry> {
        self.order.iter().filter_map(|id| self.latest.get(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// File-backed checkpoint store. Single writer; readers may run concurrently.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole log under a shared lock. A missing file is an empty log.
    pub fn load(&self) -> Result<CheckpointSnapshot, CheckpointError> {
        if !self.path.exists() {
            return Ok(CheckpointSnapshot::default());
        }

        let mut file = File::open(&self.path).map_err(|e| CheckpointError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| CheckpointError::Lock(self.path.clone(), e))?;
        let mut content = String::new();
        let read = file.read_to_string(&mut content);
        file.unlock()
            .map_err(|e| CheckpointError::Lock(self.path.clone(), e))?;
        read.map_err(|e| CheckpointError::Io(self.path.clone(), e))?;

        parse_log(&self.path, &content)
    }

    pub fn is_done(&self, trial_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.load()?.is_done(trial_id))
    }

    pub fn status(&self, trial_id: &str) -> Result<Option<TrialStatus>, CheckpointError> {
        Ok(self.load()?.status(trial_id))
    }

    /// Append one entry and flush it to disk before returning.
    pub fn record(
        &self,
        trial_id: &str,
        status: TrialStatus,
        recorded_at: &str,
        attempts: u32,
    ) -> Result<CheckpointEntry, CheckpointError> {
        if status == TrialStatus::Running {
            return Err(CheckpointError::NotPersistable(trial_id.to_string(), status));
        }
        let entry = CheckpointEntry {
            trial_id: trial_id.to_string(),
            status,
            recorded_at: recorded_at.to_string(),
            attempts,
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| CheckpointError::Write(self.path.clone(), e.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Io(parent.to_path_buf(), e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| CheckpointError::Io(self.path.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| CheckpointError::Lock(self.path.clone(), e))?;

        let written = append_line(&mut file, line.as_bytes());

        file.unlock()
            .map_err(|e| CheckpointError::Lock(self.path.clone(), e))?;
        written.map_err(|e| CheckpointError::Io(self.path.clone(), e))?;

        Ok(entry)
    }

    /// Mark trials pending again. Returns whether the id had any entry.
    pub fn reset(&self, trial_id: &str, recorded_at: &str) -> Result<bool, CheckpointError> {
        let known = self.load()?.get(trial_id).is_some();
        if known {
            self.record(trial_id, TrialStatus::Pending, recorded_at, 0)?;
        }
        Ok(known)
    }

    /// Rewrite the log with only the latest entry per trial, replacing the
    /// file atomically. Returns the number of entries kept.
    pub fn compact(&self) -> Result<usize, CheckpointError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let lock = File::open(&self.path).map_err(|e| CheckpointError::Io(self.path.clone(), e))?;
        lock.lock_exclusive()
            .map_err(|e| CheckpointError::Lock(self.path.clone(), e))?;

        let result = self.rewrite();

        lock.unlock()
            .map_err(|e| CheckpointError::Lock(self.path.clone(), e))?;
        result
    }

    fn rewrite(&self) -> Result<usize, CheckpointError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| CheckpointError::Io(self.path.clone(), e))?;
        let snapshot = parse_log(&self.path, &content)?;

        let mut body = String::new();
        for entry in snapshot.entries() {
            let line = serde_json::to_string(entry)
                .map_err(|e| CheckpointError::Write(self.path.clone(), e.to_string()))?;
            body.push_str(&line);
            body.push('\n');
        }

        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);
        let write = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| CheckpointError::Io(tmp.clone(), e))?;

        Ok(snapshot.len())
    }
}

fn parse_log(path: &Path, content: &str) -> Result<CheckpointSnapshot, CheckpointError> {
    let mut snapshot = CheckpointSnapshot::default();
    let mut rest = content;
    let mut line_no = 0;
    while let Some(end) = rest.find('\n') {
        line_no += 1;
        let line = rest[..end].trim();
        rest = &rest[end + 1..];
        if line.is_empty() {
            continue;
        }
        let entry: CheckpointEntry = serde_json::from_str(line)
            .map_err(|e| CheckpointError::Parse(path.to_path_buf(), line_no, e.to_string()))?;
        snapshot.lines += 1;
        snapshot.apply(entry);
    }
    if !rest.trim().is_empty() {
        tracing::warn!(
            "Ignoring unterminated trailing line in {} (interrupted write)",
            path.display()
        );
    }
    Ok(snapshot)
}

fn append_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    drop_torn_tail(file)?;
    file.seek(SeekFrom::End(0))?;
    file.write_all(line)?;
    file.sync_data()
}

/// Truncate anything after the last newline left behind by an interrupted append.
fn drop_torn_tail(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    file.seek(SeekFrom::Start(0))?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    tracing::warn!("Truncating {} byte(s) of torn checkpoint entry", content.len() - keep);
    file.set_len(keep as u64)
}

/// Current time as an RFC 3339 timestamp (UTC, second precision).
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Errors from the checkpoint store. All of them abort a sweep.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to read/write checkpoint file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock checkpoint file {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("corrupt checkpoint file {0} at line {1}: {2}")]
    Parse(PathBuf, usize, String),
    #[error("failed to write checkpoint file {0}: {1}")]
    Write(PathBuf, String),
    #[error("refusing to persist {0} as {1}")]
    NotPersistable(String, TrialStatus),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const TS: &str = "2026-01-01T00:00:00Z";

    #[test]
    fn test_record_and_load() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt.jsonl"));

        assert!(!store.is_done("a").unwrap());
        store.record("a", TrialStatus::Failed, TS, 4).unwrap();
        store.record("b", TrialStatus::SkippedOom, TS, 1).unwrap();
        store.record("a", TrialStatus::Succeeded, TS, 1).unwrap();

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.lines, 3);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.is_done("a"));
        assert!(!snapshot.is_done("b"));
        assert_eq!(snapshot.status("b"), Some(TrialStatus::SkippedOom));
        let ids: Vec<_> = snapshot.entries().map(|e| e.trial_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_running_is_rejected() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt.jsonl"));
        assert!(matches!(
            store.record("a", TrialStatus::Running, TS, 1),
            Err(CheckpointError::NotPersistable(..))
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_torn_trailing_line_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt.jsonl");
        let store = CheckpointStore::new(&path);
        store.record("a", TrialStatus::Succeeded, TS, 1).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"trial_id":"b","status":"succ"#).unwrap();
        drop(f);

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot.is_done("b"));

        // The next append repairs the tail instead of gluing onto it.
        store.record("c", TrialStatus::Failed, TS, 2).unwrap();
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.status("c"), Some(TrialStatus::Failed));
    }

    #[test]
    fn test_corrupt_middle_line_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt.jsonl");
        std::fs::write(&path, "garbage\n{\"trial_id\":\"a\",\"status\":\"failed\",\"recorded_at\":\"x\",\"attempts\":1}\n").unwrap();
        match CheckpointStore::new(&path).load() {
            Err(CheckpointError::Parse(_, line, _)) => assert_eq!(line, 1),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_reset() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt.jsonl"));
        store.record("a", TrialStatus::Succeeded, TS, 1).unwrap();

        assert!(store.reset("a", TS).unwrap());
        assert!(!store.reset("missing", TS).unwrap());
        assert_eq!(store.status("a").unwrap(), Some(TrialStatus::Pending));
        assert!(!store.is_done("a").unwrap());
    }

    #[test]
    fn test_compact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt.jsonl");
        let store = CheckpointStore::new(&path);
        for attempts in 1..=3 {
            store.record("a", TrialStatus::Failed, TS, attempts).unwrap();
        }
        store.record("b", TrialStatus::Succeeded, TS, 1).unwrap();
        store.record("a", TrialStatus::Succeeded, TS, 4).unwrap();

        assert_eq!(store.compact().unwrap(), 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.get("a").unwrap().attempts, 4);
        assert!(snapshot.is_done("b"));
        assert!(!dir.path().join("ckpt.jsonl.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nope.jsonl"));
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.compact().unwrap(), 0);
    }
}
