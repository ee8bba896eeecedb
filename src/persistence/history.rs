//! Query history and pattern learning
//!
//! An append-only, capped log of executed questions plus a derived
//! [`PatternIndex`] of join and filter patterns. The index only ever folds in
//! successful entries and can be rebuilt from the retained log.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{lock, read_json, write_json_atomic};
use crate::sql::{HeuristicAnalyzer, SqlAnalyzer};
use crate::types::{Confidence, JoinSuggestion, PopularQuery, QueryLogEntry};

pub const DEFAULT_CAPACITY: usize = 1000;
const MAX_JOIN_SUGGESTIONS: usize = 3;
const MAX_FILTER_EXAMPLES: usize = 3;
const POPULAR_WINDOW_DAYS: i64 = 30;
const CONTEXT_SQL_PREVIEW: usize = 100;

const HISTORY_FILE: &str = "query_history.json";
const PATTERNS_FILE: &str = "learned_patterns.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPattern {
    pub count: u64,
    pub example_sql: String,
    pub example_question: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPattern {
    pub count: u64,
    pub examples: Vec<String>,
}

/// Aggregates derived from successful log entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternIndex {
    #[serde(default)]
    pub join_patterns: BTreeMap<String, JoinPattern>,
    #[serde(default)]
    pub filter_patterns: BTreeMap<String, FilterPattern>,
}

impl PatternIndex {
    fn fold(&mut self, entry: &QueryLogEntry) {
        if entry.tables.len() >= 2 {
            let key = canonical_key(&entry.tables);
            self.join_patterns
                .entry(key)
                .or_insert_with(|| JoinPattern {
                    count: 0,
                    example_sql: entry.sql.clone(),
                    example_question: entry.question.clone(),
                })
                .count += 1;
        }

        for column in &entry.columns {
            let pattern = self.filter_patterns.entry(column.clone()).or_default();
            pattern.count += 1;
            if pattern.examples.len() < MAX_FILTER_EXAMPLES {
                pattern.examples.push(entry.question.clone());
            }
        }
    }
}

/// Order-independent key for a set of tables: lowercased, de-duplicated,
/// sorted and comma-joined.
pub fn canonical_key<S: AsRef<str>>(tables: &[S]) -> String {
    canonical_tables(tables).join(",")
}

fn canonical_tables<S: AsRef<str>>(tables: &[S]) -> Vec<String> {
    let mut names: Vec<String> = tables
        .iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDocument {
    #[serde(default)]
    queries: Vec<QueryLogEntry>,
    last_updated: DateTime<Utc>,
}

struct HistoryState {
    entries: VecDeque<QueryLogEntry>,
    index: PatternIndex,
}

/// Input for [`HistoryStore::log`].
#[derive(Debug, Clone, Default)]
pub struct NewQueryLog {
    pub question: String,
    pub sql: String,
    pub tables: Vec<String>,
    pub execution_time_ms: u64,
    pub success: bool,
    pub row_count: usize,
    pub user_id: Option<String>,
}

pub struct HistoryStore {
    dir: PathBuf,
    capacity: usize,
    analyzer: Arc<dyn SqlAnalyzer>,
    state: Mutex<HistoryState>,
}

impl HistoryStore {
    pub fn open<P: AsRef<Path>>(dir: P, capacity: usize) -> Result<Self> {
        Self::with_analyzer(dir, capacity, Arc::new(HeuristicAnalyzer::new()))
    }

    pub fn with_analyzer<P: AsRef<Path>>(
        dir: P,
        capacity: usize,
        analyzer: Arc<dyn SqlAnalyzer>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating history directory {}", dir.display()))?;
        let capacity = capacity.max(1);

        let mut entries: VecDeque<QueryLogEntry> =
            match read_json::<HistoryDocument>(&dir.join(HISTORY_FILE)) {
                Ok(doc) => doc.map(|d| d.queries.into()).unwrap_or_default(),
                Err(e) => {
                    warn!("Ignoring unreadable query history: {:#}", e);
                    VecDeque::new()
                }
            };
        while entries.len() > capacity {
            entries.pop_front();
        }

        let index = match read_json::<PatternIndex>(&dir.join(PATTERNS_FILE)) {
            Ok(Some(index)) => index,
            Ok(None) => build_index(&entries),
            Err(e) => {
                warn!("Rebuilding unreadable pattern index: {:#}", e);
                build_index(&entries)
            }
        };
        debug!(
            "Loaded {} history entries, {} join patterns",
            entries.len(),
            index.join_patterns.len()
        );

        Ok(Self {
            dir,
            capacity,
            analyzer,
            state: Mutex::new(HistoryState { entries, index }),
        })
    }

    /// Append an entry, evicting the oldest beyond capacity, and fold it into
    /// the pattern index when it succeeded.
    pub fn log(&self, new: NewQueryLog) -> Result<QueryLogEntry> {
        let entry = QueryLogEntry {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            columns: self.analyzer.columns(&new.sql),
            question: new.question,
            sql: new.sql,
            tables: canonical_tables(&new.tables),
            timestamp: Utc::now(),
            execution_time_ms: new.execution_time_ms,
            success: new.success,
            row_count: new.row_count,
            user_id: new.user_id,
        };
        self.append(entry.clone())?;
        Ok(entry)
    }

    fn append(&self, entry: QueryLogEntry) -> Result<()> {
        let mut state = lock(&self.state);
        let mut entries = state.entries.clone();
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        self.save_history(&entries)?;
        state.entries = entries;

        if entry.success {
            let mut index = state.index.clone();
            index.fold(&entry);
            let saved = self.save_index(&index);
            // the saved log already holds the entry
            state.index = index;
            if let Err(e) = saved {
                // a missing index is rebuilt from the log on open
                let _ = std::fs::remove_file(self.dir.join(PATTERNS_FILE));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Up to three suggestions: the exact table set first (high confidence),
    /// then known strict supersets of it (medium confidence).
    pub fn join_suggestions<S: AsRef<str>>(&self, tables: &[S]) -> Vec<JoinSuggestion> {
        let requested = canonical_tables(tables);
        if requested.len() < 2 {
            return Vec::new();
        }
        let key = requested.join(",");
        let state = lock(&self.state);
        let mut suggestions = Vec::new();

        if let Some(pattern) = state.index.join_patterns.get(&key) {
            suggestions.push(JoinSuggestion {
                tables: requested.clone(),
                confidence: Confidence::High,
                example_sql: pattern.example_sql.clone(),
                example_question: pattern.example_question.clone(),
                times_used: pattern.count,
            });
        }

        for (known_key, pattern) in &state.index.join_patterns {
            if suggestions.len() >= MAX_JOIN_SUGGESTIONS {
                break;
            }
            if *known_key == key {
                continue;
            }
            let known: Vec<&str> = known_key.split(',').collect();
            if requested.iter().all(|t| known.contains(&t.as_str())) {
                suggestions.push(JoinSuggestion {
                    tables: known.iter().map(|t| t.to_string()).collect(),
                    confidence: Confidence::Medium,
                    example_sql: pattern.example_sql.clone(),
                    example_question: pattern.example_question.clone(),
                    times_used: pattern.count,
                });
            }
        }

        suggestions.truncate(MAX_JOIN_SUGGESTIONS);
        suggestions
    }

    pub fn filter_suggestions(&self, column: &str) -> FilterPattern {
        let state = lock(&self.state);
        state
            .index
            .filter_patterns
            .get(&column.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Successful questions from the last 30 days grouped by their first three
    /// words, largest groups first.
    pub fn popular_queries(&self, table: Option<&str>, limit: usize) -> Vec<PopularQuery> {
        self.popular_queries_at(Utc::now(), table, limit)
    }

    fn popular_queries_at(
        &self,
        now: DateTime<Utc>,
        table: Option<&str>,
        limit: usize,
    ) -> Vec<PopularQuery> {
        let cutoff = now - Duration::days(POPULAR_WINDOW_DAYS);
        let table = table.map(|t| t.to_lowercase());
        let state = lock(&self.state);

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&QueryLogEntry>> = HashMap::new();
        for entry in state.entries.iter().filter(|e| {
            e.success
                && e.timestamp > cutoff
                && table.as_ref().map_or(true, |t| e.tables.contains(t))
        }) {
            let key = group_key(&entry.question);
            let group = groups.entry(key.clone()).or_default();
            if group.is_empty() {
                order.push(key);
            }
            group.push(entry);
        }

        let mut ranked: Vec<(String, Vec<&QueryLogEntry>)> = order
            .into_iter()
            .filter_map(|key| groups.remove(&key).map(|g| (key, g)))
            .collect();
        ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        ranked
            .into_iter()
            .take(limit)
            .map(|(key, group)| {
                let example = group[0];
                PopularQuery {
                    question_pattern: key,
                    count: group.len(),
                    example_question: example.question.clone(),
                    example_sql: example.sql.clone(),
                    tables: example.tables.clone(),
                }
            })
            .collect()
    }

    /// Learned patterns rendered as prompt sections. Empty when nothing applies.
    pub fn context_string(&self, tables: &[String]) -> String {
        let mut parts: Vec<String> = Vec::new();

        if tables.len() >= 2 {
            let suggestions = self.join_suggestions(tables);
            if !suggestions.is_empty() {
                parts.push("### Common Join Patterns\n".to_string());
                for (i, s) in suggestions.iter().take(2).enumerate() {
                    let preview: String = s.example_sql.chars().take(CONTEXT_SQL_PREVIEW).collect();
                    parts.push(format!(
                        "{}. Tables [{}] are commonly joined together.",
                        i + 1,
                        s.tables.join(", ")
                    ));
                    parts.push(format!("   Example: {}", s.example_question));
                    parts.push(format!("   SQL pattern: {}...\n", preview));
                }
            }
        }

        if let Some(first) = tables.first() {
            let popular = self.popular_queries(Some(first), 3);
            if !popular.is_empty() {
                parts.push("### Similar Questions Asked Previously\n".to_string());
                for p in popular {
                    parts.push(format!("- \"{}\"", p.example_question));
                }
            }
        }

        parts.join("\n")
    }

    /// Recompute the pattern index from the retained log and persist it.
    pub fn rebuild_index(&self) -> Result<PatternIndex> {
        let mut state = lock(&self.state);
        state.index = build_index(&state.entries);
        self.save_index(&state.index)?;
        Ok(state.index.clone())
    }

    pub fn pattern_index(&self) -> PatternIndex {
        lock(&self.state).index.clone()
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<QueryLogEntry> {
        lock(&self.state).entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save_history(&self, entries: &VecDeque<QueryLogEntry>) -> Result<()> {
        let doc = HistoryDocument {
            queries: entries.iter().cloned().collect(),
            last_updated: Utc::now(),
        };
        write_json_atomic(&self.dir.join(HISTORY_FILE), &doc).context("saving query history")
    }

    fn save_index(&self, index: &PatternIndex) -> Result<()> {
        write_json_atomic(&self.dir.join(PATTERNS_FILE), index).context("saving pattern index")
    }
}

fn build_index<'a, I>(entries: I) -> PatternIndex
where
    I: IntoIterator<Item = &'a QueryLogEntry>,
{
    let mut index = PatternIndex::default();
    for entry in entries.into_iter().filter(|e| e.success) {
        index.fold(entry);
    }
    index
}

fn group_key(question: &str) -> String {
    question
        .to_lowercase()
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
}
