use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "system" => MessageRole::System,
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

/// A single chat message exchanged with the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Persisted conversation document, one per conversation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Listing entry for a stored conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub last_updated: DateTime<Utc>,
    pub message_count: usize,
}

/// One executed (or attempted) question/SQL pair in the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub id: String,
    pub question: String,
    pub sql: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub success: bool,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    FilterPattern,
    JoinPattern,
    Calculation,
    SemanticMapping,
    General,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::FilterPattern => "filter_pattern",
            MemoryType::JoinPattern => "join_pattern",
            MemoryType::Calculation => "calculation",
            MemoryType::SemanticMapping => "semantic_mapping",
            MemoryType::General => "general",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "filter_pattern" => MemoryType::FilterPattern,
            "join_pattern" => MemoryType::JoinPattern,
            "calculation" => MemoryType::Calculation,
            "semantic_mapping" => MemoryType::SemanticMapping,
            _ => MemoryType::General,
        }
    }
}

/// Visibility of a memory: shared by everyone or owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    Global,
    User(String),
}

impl MemoryScope {
    pub fn label(&self) -> String {
        match self {
            MemoryScope::Global => "global".to_string(),
            MemoryScope::User(id) => format!("user:{}", id),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("user:") {
            Some(id) if !id.is_empty() => MemoryScope::User(id.to_string()),
            _ => MemoryScope::Global,
        }
    }
}

impl Serialize for MemoryScope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for MemoryScope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MemoryScope::parse(&raw))
    }
}

/// A persisted correction that nudges future SQL generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub pattern: String,
    pub correction: String,
    #[serde(default)]
    pub applies_to_tables: Vec<String>,
    #[serde(default)]
    pub applies_to_columns: Vec<String>,
    pub memory_type: MemoryType,
    pub scope: MemoryScope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub success_count: u64,
}

/// Rows returned by a successful statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub data: Vec<Map<String, Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.data.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
}

/// A previously seen multi-table query that can guide a new join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSuggestion {
    pub tables: Vec<String>,
    pub confidence: Confidence,
    pub example_sql: String,
    pub example_question: String,
    pub times_used: u64,
}

/// A group of similar successful questions, largest groups first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularQuery {
    pub question_pattern: String,
    pub count: usize,
    pub example_question: String,
    pub example_sql: String,
    pub tables: Vec<String>,
}
