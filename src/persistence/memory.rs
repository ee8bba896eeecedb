//! Correction memory
//!
//! Learned guidance such as "NYPD means agency_name LIKE '%POLICE%'" that is
//! injected into future prompts when it looks relevant to the question.
//! Global memories live in `global_memory.json`; user memories in
//! `users/<user_id>.json`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{lock, read_json, sanitize_key, write_json_atomic};
use crate::error::StoreError;
use crate::types::{Memory, MemoryScope, MemoryType};

/// Maximum number of memories returned by [`MemoryStore::relevant`].
pub const RELEVANT_LIMIT: usize = 5;

const GLOBAL_FILE: &str = "global_memory.json";
const USERS_DIR: &str = "users";

#[derive(Debug, Serialize, Deserialize)]
struct MemoryDocument {
    #[serde(default)]
    memories: Vec<Memory>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    global: Vec<Memory>,
    users: HashMap<String, Vec<Memory>>,
}

/// Input for [`MemoryStore::add`].
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub pattern: String,
    pub correction: String,
    pub tables: Vec<String>,
    pub columns: Vec<String>,
    pub memory_type: MemoryType,
}

impl NewMemory {
    pub fn new(
        pattern: impl Into<String>,
        correction: impl Into<String>,
        memory_type: MemoryType,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            correction: correction.into(),
            tables: Vec::new(),
            columns: Vec::new(),
            memory_type,
        }
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Which memories to enumerate in [`MemoryStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope<'a> {
    Global,
    User(&'a str),
    All,
}

pub struct MemoryStore {
    dir: PathBuf,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Open the store rooted at `dir`, loading the global partition eagerly.
    /// User partitions are loaded on first access.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join(USERS_DIR))
            .with_context(|| format!("creating memory directory {}", dir.display()))?;

        let global = match read_json::<MemoryDocument>(&dir.join(GLOBAL_FILE)) {
            Ok(doc) => doc.map(|d| d.memories).unwrap_or_default(),
            Err(e) => {
                warn!("Ignoring unreadable global memories: {:#}", e);
                Vec::new()
            }
        };
        debug!("Loaded {} global memories", global.len());

        Ok(Self {
            dir,
            state: Mutex::new(MemoryState {
                global,
                users: HashMap::new(),
            }),
        })
    }

    /// Create and persist a memory. A user scope requires a non-empty user id.
    pub fn add(&self, new: NewMemory, scope: MemoryScope) -> Result<Memory> {
        let user_key = match &scope {
            MemoryScope::Global => None,
            MemoryScope::User(user_id) if user_id.trim().is_empty() => {
                return Err(StoreError::MissingUserId.into())
            }
            MemoryScope::User(user_id) => Some(sanitize_key(user_id)?),
        };

        let now = Utc::now();
        let memory = Memory {
            id: generate_id(),
            pattern: new.pattern,
            correction: new.correction,
            applies_to_tables: new.tables,
            applies_to_columns: new.columns,
            memory_type: new.memory_type,
            scope,
            created_at: now,
            updated_at: now,
            use_count: 0,
            success_count: 0,
        };

        let mut state = lock(&self.state);
        self.update_partition(&mut state, user_key.as_deref(), |memories| {
            memories.push(memory.clone())
        })?;
        Ok(memory)
    }

    /// Add with a textual scope: `"user"` (requires `user_id`) or anything
    /// else for global.
    pub fn add_scoped(
        &self,
        new: NewMemory,
        scope: &str,
        user_id: Option<&str>,
    ) -> Result<Memory> {
        let scope = if scope.eq_ignore_ascii_case("user") {
            let user_id = user_id
                .filter(|u| !u.trim().is_empty())
                .ok_or(StoreError::MissingUserId)?;
            MemoryScope::User(user_id.to_string())
        } else {
            MemoryScope::Global
        };
        self.add(new, scope)
    }

    /// Score every global memory (plus the user's own) against the question
    /// and return the best [`RELEVANT_LIMIT`] with a positive score.
    pub fn relevant(
        &self,
        question: &str,
        tables: &[String],
        columns: &[String],
        user_id: Option<&str>,
    ) -> Result<Vec<Memory>> {
        let mut state = lock(&self.state);
        let mut candidates: Vec<Memory> = state.global.clone();
        if let Some(user_id) = user_id.filter(|u| !u.trim().is_empty()) {
            let key = sanitize_key(user_id)?;
            candidates.extend(self.user_memories(&mut state, &key).iter().cloned());
        }
        drop(state);

        let question_lower = question.to_lowercase();
        let question_words: HashSet<&str> = question_lower.split_whitespace().collect();
        let tables: HashSet<&str> = tables.iter().map(String::as_str).collect();
        let columns: HashSet<&str> = columns.iter().map(String::as_str).collect();

        let mut scored: Vec<(Memory, u32)> = candidates
            .into_iter()
            .filter_map(|memory| {
                let score = relevance_score(&memory, &question_lower, &question_words, &tables, &columns);
                (score > 0).then_some((memory, score))
            })
            .collect();

        // stable: equal scores keep insertion order
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(scored
            .into_iter()
            .take(RELEVANT_LIMIT)
            .map(|(memory, _)| memory)
            .collect())
    }

    /// Render memories as a prompt section. Empty input yields an empty string.
    pub fn render_context(memories: &[Memory]) -> String {
        if memories.is_empty() {
            return String::new();
        }
        let mut context = String::from("### Learned Patterns & Corrections\n");
        for (i, memory) in memories.iter().enumerate() {
            context.push_str(&format!("{}. {}\n", i + 1, memory.correction));
            if !memory.applies_to_tables.is_empty() {
                context.push_str(&format!(
                    "   Applies to tables: {}\n",
                    memory.applies_to_tables.join(", ")
                ));
            }
            context.push_str(&format!("   Type: {}\n", memory.memory_type.as_str()));
        }
        context
    }

    /// Relevant memories rendered as a prompt section.
    pub fn context_string(
        &self,
        question: &str,
        tables: &[String],
        columns: &[String],
        user_id: Option<&str>,
    ) -> Result<String> {
        let memories = self.relevant(question, tables, columns, user_id)?;
        Ok(Self::render_context(&memories))
    }

    /// Count a use of memory `id`, and a success when `success` is set.
    /// Searches the global partition, then every user partition.
    /// Returns whether the memory was found.
    pub fn record_usage(&self, id: &str, success: bool) -> Result<bool> {
        let mut state = lock(&self.state);
        let bump_id = |memories: &mut Vec<Memory>| {
            if let Some(memory) = memories.iter_mut().find(|m| m.id == id) {
                bump(memory, success);
            }
        };

        if state.global.iter().any(|m| m.id == id) {
            self.update_partition(&mut state, None, &bump_id)?;
            return Ok(true);
        }

        for key in self.user_keys(&state)? {
            if self.user_memories(&mut state, &key).iter().any(|m| m.id == id) {
                self.update_partition(&mut state, Some(&key), &bump_id)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete memory `id` from the global partition, else from `user_id`'s.
    pub fn delete(&self, id: &str, user_id: Option<&str>) -> Result<bool> {
        let mut state = lock(&self.state);
        let remove_id = |memories: &mut Vec<Memory>| memories.retain(|m| m.id != id);

        if state.global.iter().any(|m| m.id == id) {
            self.update_partition(&mut state, None, &remove_id)?;
            return Ok(true);
        }

        if let Some(user_id) = user_id.filter(|u| !u.trim().is_empty()) {
            let key = sanitize_key(user_id)?;
            if self.user_memories(&mut state, &key).iter().any(|m| m.id == id) {
                self.update_partition(&mut state, Some(&key), &remove_id)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn list(&self, scope: ListScope<'_>) -> Result<Vec<Memory>> {
        let mut state = lock(&self.state);
        match scope {
            ListScope::Global => Ok(state.global.clone()),
            ListScope::User(user_id) => {
                let key = sanitize_key(user_id)?;
                Ok(self.user_memories(&mut state, &key).clone())
            }
            ListScope::All => {
                let mut all = state.global.clone();
                for key in self.user_keys(&state)? {
                    all.extend(self.user_memories(&mut state, &key).iter().cloned());
                }
                Ok(all)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.list(ListScope::All)?.into_iter().find(|m| m.id == id))
    }

    /// Insert the stock corrections that are not present yet, matching on
    /// (pattern, type). Returns how many were added.
    pub fn seed_defaults(&self) -> Result<usize> {
        let mut added = 0;
        for new in default_memories() {
            let exists = {
                let state = lock(&self.state);
                state
                    .global
                    .iter()
                    .any(|m| m.pattern == new.pattern && m.memory_type == new.memory_type)
            };
            if !exists {
                self.add(new, MemoryScope::Global)?;
                added += 1;
            }
        }
        Ok(added)
    }

    fn user_memories<'s>(&self, state: &'s mut MemoryState, key: &str) -> &'s mut Vec<Memory> {
        state.users.entry(key.to_string()).or_insert_with(|| {
            let path = self.user_path(key);
            match read_json::<MemoryDocument>(&path) {
                Ok(doc) => doc.map(|d| d.memories).unwrap_or_default(),
                Err(e) => {
                    warn!("Ignoring unreadable memories for user {}: {:#}", key, e);
                    Vec::new()
                }
            }
        })
    }

    /// Edit a copy of the global (`None`) or a user partition and keep the
    /// copy only once it has been written.
    fn update_partition(
        &self,
        state: &mut MemoryState,
        key: Option<&str>,
        edit: impl FnOnce(&mut Vec<Memory>),
    ) -> Result<()> {
        let mut next = match key {
            None => state.global.clone(),
            Some(key) => self.user_memories(state, key).clone(),
        };
        edit(&mut next);
        match key {
            None => {
                self.save_global(&next)?;
                state.global = next;
            }
            Some(key) => {
                self.save_user(key, &next)?;
                state.users.insert(key.to_string(), next);
            }
        }
        Ok(())
    }

    /// Loaded partitions first, then any partition that only exists on disk.
    fn user_keys(&self, state: &MemoryState) -> Result<Vec<String>> {
        let mut keys: Vec<String> = state.users.keys().cloned().collect();
        keys.sort();
        let users_dir = self.dir.join(USERS_DIR);
        let mut on_disk = Vec::new();
        for entry in std::fs::read_dir(&users_dir)
            .with_context(|| format!("listing {}", users_dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !state.users.contains_key(stem) {
                    on_disk.push(stem.to_string());
                }
            }
        }
        on_disk.sort();
        keys.extend(on_disk);
        Ok(keys)
    }

    fn user_path(&self, key: &str) -> PathBuf {
        self.dir.join(USERS_DIR).join(format!("{}.json", key))
    }

    fn save_global(&self, memories: &[Memory]) -> Result<()> {
        write_document(&self.dir.join(GLOBAL_FILE), memories).context("saving global memories")
    }

    fn save_user(&self, key: &str, memories: &[Memory]) -> Result<()> {
        write_document(&self.user_path(key), memories)
            .with_context(|| format!("saving memories for user {}", key))
    }
}

fn write_document(path: &Path, memories: &[Memory]) -> Result<()> {
    let doc = MemoryDocument {
        memories: memories.to_vec(),
        last_updated: Utc::now(),
    };
    write_json_atomic(path, &doc)
}

fn relevance_score(
    memory: &Memory,
    question_lower: &str,
    question_words: &HashSet<&str>,
    tables: &HashSet<&str>,
    columns: &HashSet<&str>,
) -> u32 {
    let mut score = 0;
    let pattern_lower = memory.pattern.to_lowercase();

    if question_lower.contains(&pattern_lower) || pattern_lower.contains(question_lower) {
        score += 3;
    }

    let pattern_words: HashSet<&str> = pattern_lower.split_whitespace().collect();
    score += pattern_words.intersection(question_words).count() as u32;

    if memory
        .applies_to_tables
        .iter()
        .any(|t| tables.contains(t.as_str()))
    {
        score += 2;
    }
    if memory
        .applies_to_columns
        .iter()
        .any(|c| columns.contains(c.as_str()))
    {
        score += 2;
    }
    if memory.memory_type == MemoryType::SemanticMapping {
        score += 1;
    }
    score
}

fn bump(memory: &mut Memory, success: bool) {
    memory.use_count += 1;
    if success {
        memory.success_count += 1;
    }
    memory.updated_at = Utc::now();
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Stock corrections for the payroll dataset the tool ships with.
pub fn default_memories() -> Vec<NewMemory> {
    vec![
        NewMemory::new(
            "Police Department",
            "When filtering for 'Police Department', use `agency_name LIKE '%POLICE%'` to catch variations like 'POLICE DEPARTMENT', 'NYPD', etc.",
            MemoryType::FilterPattern,
        )
        .with_tables(["payroll"])
        .with_columns(["agency_name"]),
        NewMemory::new(
            "average salary",
            "Salary fields contain '$' symbols and are TEXT. Always use `CAST(REPLACE(salary_col, '$', '') AS REAL)` for calculations.",
            MemoryType::Calculation,
        )
        .with_tables(["payroll"])
        .with_columns([
            "base_salary",
            "regular_gross_paid",
            "total_ot_paid",
            "total_other_pay",
        ]),
        NewMemory::new(
            "top N highest",
            "For 'top N' queries, use `ORDER BY column DESC LIMIT N`. Remember to handle ties appropriately.",
            MemoryType::General,
        ),
        NewMemory::new(
            "NYPD",
            "'NYPD' refers to the New York Police Department. Map to `agency_name LIKE '%POLICE%'`",
            MemoryType::SemanticMapping,
        )
        .with_tables(["payroll"])
        .with_columns(["agency_name"]),
        NewMemory::new(
            "Fire Department",
            "When filtering for 'Fire Department', use `agency_name LIKE '%FIRE%'` to catch variations.",
            MemoryType::FilterPattern,
        )
        .with_tables(["payroll"])
        .with_columns(["agency_name"]),
    ]
}
