//! Durable append-only JSONL journal with a bounded in-memory index.
//!
//! One journal per state file (`identities.jsonl`, `outbox.jsonl`, ...).
//! Load reads every row, collapsing by primary key and keeping the row
//! with the greatest `(updated_at_ms, revision)` sort key. Writes
//! serialize through a FIFO mutex: each append writes exactly one line,
//! flushes, then updates the index, so after a successful append the
//! in-memory state and the on-disk tail agree. A failed append leaves the
//! in-memory state untouched.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem read/write failed.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    /// A row could not be serialized.
    #[error("storage serialization error: {0}")]
    Serialization(String),
    /// The writer lock is held by another process.
    #[error("writer lock held by pid {0}")]
    LockHeld(u32),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// A row type persistable in a [`JsonlJournal`].
///
/// The live state of a journal is the last row per `primary_key`,
/// ordered by `sort_key`.
pub trait JournalRecord: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Primary id collapsing rows into live state.
    fn primary_key(&self) -> &str;
    /// `(updated_at_ms, revision)`; greater wins on load.
    fn sort_key(&self) -> (i64, u64);
}

struct Inner<T> {
    /// `None` for in-memory journals (tests).
    file: Option<std::fs::File>,
    index: HashMap<String, T>,
}

/// Single-writer JSONL journal.
///
/// All mutation goes through [`JsonlJournal::append`], guarded by a fair
/// async mutex, so concurrent writers are serialized FIFO. Readers get
/// cloned snapshots and never observe torn rows.
pub struct JsonlJournal<T> {
    path: Option<PathBuf>,
    inner: Mutex<Inner<T>>,
}

impl<T: JournalRecord> JsonlJournal<T> {
    /// Open (creating if absent) a journal at `path` and load its rows.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let index = load_index::<T>(&path)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(Inner {
                file: Some(file),
                index,
            }),
        })
    }

    /// Open an in-memory journal for testing.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner {
                file: None,
                index: HashMap::new(),
            }),
        }
    }

    /// Append one row and update the live index.
    ///
    /// The row is serialized before any write; if the disk write fails the
    /// in-memory index is left unchanged and the error surfaces to the
    /// caller for retry.
    pub async fn append(&self, row: T) -> Result<(), StorageError> {
        let line = serde_json::to_string(&row)?;
        let mut inner = self.inner.lock().await;
        if let Some(file) = inner.file.as_mut() {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        inner.index.insert(row.primary_key().to_owned(), row);
        Ok(())
    }

    /// Look up the live row for a primary key.
    pub async fn get(&self, primary_key: &str) -> Option<T> {
        self.inner.lock().await.index.get(primary_key).cloned()
    }

    /// Snapshot of all live rows, in unspecified order.
    pub async fn snapshot(&self) -> Vec<T> {
        self.inner.lock().await.index.values().cloned().collect()
    }

    /// Number of live rows.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    /// Whether the journal holds no live rows.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// File path, when file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Read all rows from disk, collapsing by primary key.
///
/// A trailing line without a newline terminator is treated as torn (the
/// process died mid-append) and skipped with a warning; any other
/// unparseable line is an error.
fn load_index<T: JournalRecord>(path: &Path) -> Result<HashMap<String, T>, StorageError> {
    let mut index: HashMap<String, T> = HashMap::new();
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        if !buf.ends_with('\n') {
            warn!(path = %path.display(), "skipping torn trailing row");
            break;
        }
        let trimmed = buf.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let row: T = serde_json::from_str(trimmed)?;
        let superseded = index
            .get(row.primary_key())
            .map_or(false, |existing| existing.sort_key() > row.sort_key());
        if !superseded {
            index.insert(row.primary_key().to_owned(), row);
        }
    }
    Ok(index)
}
