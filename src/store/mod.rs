//! Persisted-state layout and the control-plane writer lock.
//!
//! All durable state lives under `<repo>/.mu/control-plane/`. Exactly one
//! process may write there at a time; startup acquires [`WriterLock`] and
//! releases it on orderly shutdown or bootstrap failure.

pub mod journal;

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use journal::{JournalRecord, JsonlJournal, StorageError};

/// Directory under the repository root holding all control-plane state.
pub const CONTROL_PLANE_DIR: &str = ".mu/control-plane";

/// Resolved file paths for every persisted store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    /// `<repo>/.mu/control-plane`.
    pub root: PathBuf,
}

impl StoreLayout {
    /// Layout rooted at the given repository path.
    pub fn for_repo(repo_root: impl AsRef<Path>) -> Self {
        Self {
            root: repo_root.as_ref().join(CONTROL_PLANE_DIR),
        }
    }

    /// Identity binding journal.
    pub fn identities(&self) -> PathBuf {
        self.root.join("identities.jsonl")
    }

    /// Outbox journal.
    pub fn outbox(&self) -> PathBuf {
        self.root.join("outbox.jsonl")
    }

    /// Durable run queue journal.
    pub fn run_queue(&self) -> PathBuf {
        self.root.join("run_queue.jsonl")
    }

    /// Deferred Telegram ingress journal.
    pub fn telegram_ingress(&self) -> PathBuf {
        self.root.join("telegram_ingress.jsonl")
    }

    /// Shared adapter audit log.
    pub fn adapter_audit(&self) -> PathBuf {
        self.root.join("adapter_audit.jsonl")
    }

    /// Inbound attachment blob directory.
    pub fn attachments_dir(&self) -> PathBuf {
        self.root.join("inbound_attachments")
    }

    /// Inbound attachment index journal.
    pub fn attachments_index(&self) -> PathBuf {
        self.root.join("inbound_attachments.index.jsonl")
    }

    /// Writer lock file.
    pub fn writer_lock(&self) -> PathBuf {
        self.root.join("writer.lock")
    }
}

/// Contents of the writer lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at_ms: i64,
}

/// Filesystem writer lock guarding the control-plane directory.
///
/// Released on drop, so a failed bootstrap that unwinds past the guard
/// leaves no lock behind.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    /// Acquire the lock at `path`, failing if another live process holds it.
    ///
    /// A lock file whose recorded pid no longer exists (checked via
    /// `/proc` where available) is treated as stale and reclaimed.
    pub fn acquire(path: impl AsRef<Path>, now_ms: i64) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match Self::try_create(&path, now_ms) {
            Ok(lock) => Ok(lock),
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::read_holder(&path);
                match holder {
                    Some(pid) if pid_is_dead(pid) => {
                        warn!(pid, path = %path.display(), "reclaiming stale writer lock");
                        std::fs::remove_file(&path)?;
                        Self::try_create(&path, now_ms)
                    }
                    Some(pid) => Err(StorageError::LockHeld(pid)),
                    None => Err(StorageError::LockHeld(0)),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path, now_ms: i64) -> Result<Self, StorageError> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at_ms: now_ms,
        };
        file.write_all(serde_json::to_string(&info)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        info!(path = %path.display(), "writer lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn read_holder(path: &Path) -> Option<u32> {
        let text = std::fs::read_to_string(path).ok()?;
        let info: LockInfo = serde_json::from_str(text.trim()).ok()?;
        Some(info.pid)
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release writer lock");
        } else {
            info!(path = %self.path.display(), "writer lock released");
        }
    }
}

/// Whether a pid is verifiably dead. Without `/proc` we assume alive,
/// which errs toward refusing startup rather than corrupting state.
fn pid_is_dead(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    if !proc_root.is_dir() {
        return false;
    }
    !proc_root.join(pid.to_string()).exists()
}
