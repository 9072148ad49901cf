//! Persistent dedup ledger shared by every agent.
//!
//! One JSON document maps agent name to `{ "seen_ids": [...], "last_run": ... }`.
//! Reads fail open (an unreadable ledger only causes re-delivery), writes
//! propagate errors and are atomic: the new document is written to
//! `<path>.tmp`, fsynced, then renamed over `<path>`.
//!
//! Read-modify-write is serialized inside the process by a mutex and across
//! processes by an advisory `<path>.lock` file, so two agents finishing at the
//! same moment cannot lose each other's update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default number of ids kept per agent
pub const DEFAULT_MAX_IDS: usize = 5000;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history ledger I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize history ledger: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("timed out waiting for history lock {0}")]
    Locked(PathBuf),
}

impl HistoryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        HistoryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Ledger slice for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentHistory {
    /// Oldest first; eviction removes from the front
    #[serde(default)]
    pub seen_ids: Vec<String>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

pub type Ledger = BTreeMap<String, AgentHistory>;

pub struct HistoryStore {
    path: PathBuf,
    max_ids: usize,
    lock_timeout: Duration,
    stale_after: Duration,
    write_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, max_ids: usize) -> Self {
        Self {
            path: path.into(),
            max_ids: max_ids.max(1),
            lock_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            write_lock: Mutex::new(()),
        }
    }

    /// Override how long to wait for the lock file and when a leftover lock is considered stale.
    pub fn with_lock_timing(mut self, lock_timeout: Duration, stale_after: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ids already processed for `agent`. Never fails: any read problem yields an empty set.
    pub async fn get_seen_ids(&self, agent: &str) -> HashSet<String> {
        self.load()
            .await
            .remove(agent)
            .map(|h| h.seen_ids.into_iter().collect())
            .unwrap_or_default()
    }

    /// Ledger slice for one agent, if it has ever been recorded.
    pub async fn status(&self, agent: &str) -> Option<AgentHistory> {
        self.load().await.remove(agent)
    }

    /// Whole ledger (fail-open like `get_seen_ids`).
    pub async fn snapshot(&self) -> Ledger {
        self.load().await
    }

    /// Union `ids` into the agent's seen set, cap it, stamp `last_run` and persist atomically.
    pub async fn mark_seen(&self, agent: &str, ids: &[String]) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HistoryError::io(parent, e))?;
        }

        let _file_lock = self.acquire_file_lock().await?;

        let mut ledger = self.load_for_update().await?;
        let entry = ledger.entry(agent.to_string()).or_default();

        let mut known: HashSet<String> = entry.seen_ids.iter().cloned().collect();
        let before = entry.seen_ids.len();
        for id in ids {
            if known.insert(id.clone()) {
                entry.seen_ids.push(id.clone());
            }
        }
        let added = entry.seen_ids.len() - before;

        if entry.seen_ids.len() > self.max_ids {
            let excess = entry.seen_ids.len() - self.max_ids;
            entry.seen_ids.drain(..excess);
            debug!(agent, evicted = excess, "history cap reached, evicted oldest ids");
        }
        entry.last_run = Some(Utc::now());

        self.persist(&ledger).await?;
        info!(agent, added, total = entry_len(&ledger, agent), "history updated");
        Ok(())
    }

    async fn load(&self) -> Ledger {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ledger::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read history, starting fresh");
                return Ledger::new();
            }
        };
        match serde_json::from_str(&data) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to parse history, starting fresh");
                Ledger::new()
            }
        }
    }

    /// Like `load`, but a corrupt ledger is copied aside before it gets overwritten.
    async fn load_for_update(&self) -> Result<Ledger, HistoryError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Ledger::new()),
            Err(e) => return Err(HistoryError::io(&self.path, e)),
        };
        match serde_json::from_str(&data) {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                let backup = with_suffix(&self.path, ".corrupt");
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "history ledger is corrupt, keeping a copy and starting fresh"
                );
                tokio::fs::write(&backup, data.as_bytes())
                    .await
                    .map_err(|e| HistoryError::io(&backup, e))?;
                Ok(Ledger::new())
            }
        }
    }

    async fn persist(&self, ledger: &Ledger) -> Result<(), HistoryError> {
        let body = serde_json::to_vec_pretty(ledger)?;
        let tmp = with_suffix(&self.path, ".tmp");

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| HistoryError::io(&tmp, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| HistoryError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| HistoryError::io(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| HistoryError::io(&self.path, e))
    }

    async fn acquire_file_lock(&self) -> Result<LockFile, HistoryError> {
        let lock_path = with_suffix(&self.path, ".lock");
        let deadline = tokio::time::Instant::now() + self.lock_timeout;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut f) => {
                    let _ = f.write_all(std::process::id().to_string().as_bytes()).await;
                    return Ok(LockFile { path: lock_path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(&lock_path).await.is_some_and(|age| age >= self.stale_after) {
                        warn!(lock = %lock_path.display(), "breaking stale history lock");
                        let _ = tokio::fs::remove_file(&lock_path).await;
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(HistoryError::Locked(lock_path));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(HistoryError::io(&lock_path, e)),
            }
        }
    }
}

/// Removes the lock file when the write finishes (or fails).
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn lock_age(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn entry_len(ledger: &Ledger, agent: &str) -> usize {
    ledger.get(agent).map(|h| h.seen_ids.len()).unwrap_or(0)
}
