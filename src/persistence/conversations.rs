use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{lock, read_json, sanitize_key, write_json_atomic, KeyedLocks};
use crate::types::{ConversationRecord, ConversationSummary, Message, MessageRole};

const TITLE_MAX_CHARS: usize = 30;
const UNTITLED: &str = "New Conversation";

/// One JSON document per conversation id under a single directory.
#[derive(Debug)]
pub struct ConversationStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl ConversationStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating conversation directory {}", dir.display()))?;
        Ok(Self {
            dir,
            locks: KeyedLocks::default(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// All stored messages in order; empty when the conversation is unknown.
    pub fn get(&self, id: &str) -> Result<Vec<Message>> {
        let key = sanitize_key(id)?;
        let record: Option<ConversationRecord> = read_json(&self.path_for(&key))?;
        Ok(record.map(|r| r.messages).unwrap_or_default())
    }

    /// The last `n` messages, oldest first.
    pub fn window(&self, id: &str, n: usize) -> Result<Vec<Message>> {
        let mut messages = self.get(id)?;
        let skip = messages.len().saturating_sub(n);
        Ok(messages.split_off(skip))
    }

    /// Overwrite the stored conversation and refresh its timestamp.
    pub fn save(&self, id: &str, messages: &[Message]) -> Result<()> {
        let key = sanitize_key(id)?;
        let key_lock = self.locks.lock_for(&key);
        let _guard = lock(&key_lock);
        self.write_record(id, &key, messages.to_vec())
    }

    /// Append messages to a conversation under its per-id lock.
    pub fn append(&self, id: &str, messages: &[Message]) -> Result<()> {
        let key = sanitize_key(id)?;
        let key_lock = self.locks.lock_for(&key);
        let _guard = lock(&key_lock);
        let existing: Option<ConversationRecord> = read_json(&self.path_for(&key))?;
        let mut all = existing.map(|r| r.messages).unwrap_or_default();
        all.extend_from_slice(messages);
        self.write_record(id, &key, all)
    }

    fn write_record(&self, id: &str, key: &str, messages: Vec<Message>) -> Result<()> {
        let record = ConversationRecord {
            id: id.to_string(),
            last_updated: Utc::now(),
            messages,
        };
        write_json_atomic(&self.path_for(key), &record)
            .with_context(|| format!("saving conversation {}", id))
    }

    /// Delete a conversation. Unknown ids are ignored.
    pub fn clear(&self, id: &str) -> Result<()> {
        let key = sanitize_key(id)?;
        let key_lock = self.locks.lock_for(&key);
        let _guard = lock(&key_lock);
        match std::fs::remove_file(self.path_for(&key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting conversation {}", id)),
        }
    }

    /// Non-empty conversations, most recently updated first.
    pub fn list(&self) -> Result<Vec<ConversationSummary>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("listing {}", self.dir.display()))?;

        let mut summaries = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: ConversationRecord = match read_json(&path) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable conversation {}: {:#}", path.display(), e);
                    continue;
                }
            };
            if record.messages.is_empty() {
                continue;
            }
            summaries.push(ConversationSummary {
                title: derive_title(&record.messages),
                message_count: record.messages.len(),
                id: record.id,
                last_updated: record.last_updated,
            });
        }

        summaries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(summaries)
    }
}

fn derive_title(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| {
            if m.content.chars().count() > TITLE_MAX_CHARS {
                let head: String = m.content.chars().take(TITLE_MAX_CHARS).collect();
                format!("{}...", head)
            } else {
                m.content.clone()
            }
        })
        .unwrap_or_else(|| UNTITLED.to_string())
}
