//! File-backed stores for conversations, corrections and query history.
//!
//! Every store keeps one JSON document per key and rewrites it atomically
//! (write to a temp file in the same directory, then rename). Writers for the
//! same key are serialized in-process; separate processes sharing a data
//! directory are not coordinated.

pub mod conversations;
pub mod history;
pub mod memory;

pub use conversations::ConversationStore;
pub use history::HistoryStore;
pub use memory::MemoryStore;

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::StoreError;

/// The three stores a running process shares between turns.
#[derive(Clone)]
pub struct Stores {
    pub memory: Arc<MemoryStore>,
    pub history: Arc<HistoryStore>,
    pub conversations: Arc<ConversationStore>,
}

impl Stores {
    /// Open (or create) every store below `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P, pipeline: &PipelineConfig) -> Result<Self> {
        let data_dir = expand_tilde(data_dir.as_ref())?;
        let memory_dir = data_dir.join("memory");
        let memory = MemoryStore::open(&memory_dir).context("opening memory store")?;
        if pipeline.seed_default_memories {
            let added = memory.seed_defaults()?;
            if added > 0 {
                debug!("Seeded {} default memories", added);
            }
        }
        let history = HistoryStore::open(&memory_dir, pipeline.history_capacity)
            .context("opening history store")?;
        let conversations = ConversationStore::open(data_dir.join("conversations"))
            .context("opening conversation store")?;
        Ok(Self {
            memory: Arc::new(memory),
            history: Arc::new(history),
            conversations: Arc::new(conversations),
        })
    }
}

/// Strip everything but ASCII alphanumerics, `-` and `_` so an identifier can
/// never escape its store directory.
pub fn sanitize_key(raw: &str) -> Result<String, StoreError> {
    let safe: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if safe.is_empty() {
        Err(StoreError::InvalidKey(raw.to_string()))
    } else {
        Ok(safe)
    }
}

/// Read a JSON document, returning `None` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Replace `path` with the pretty-printed JSON form of `value`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, value).context("serializing document")?;
    tmp.flush().context("flushing document")?;
    tmp.persist(path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One mutex per key, created on first use.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.locks);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub(crate) fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if path_str == "~" {
        let base = BaseDirs::new().context("base directories not available")?;
        Ok(base.home_dir().to_path_buf())
    } else if let Some(stripped) = path_str.strip_prefix("~/") {
        let base = BaseDirs::new().context("base directories not available")?;
        Ok(base.home_dir().join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
