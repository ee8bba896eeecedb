//! Prompt context assembly: schema first, then learned history patterns,
//! then relevant corrections. Empty sections are dropped.

use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

use crate::database::SchemaIntrospector;
use crate::persistence::{HistoryStore, MemoryStore};

/// The merged context block plus what went into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    /// Ids of the memories rendered into `text`, for usage accounting.
    pub memory_ids: Vec<String>,
    /// Schema tables the question mentions.
    pub tables: Vec<String>,
}

#[derive(Clone)]
pub struct ContextAssembler {
    schema: Arc<dyn SchemaIntrospector>,
    memory: Arc<MemoryStore>,
    history: Arc<HistoryStore>,
}

impl ContextAssembler {
    pub fn new(
        schema: Arc<dyn SchemaIntrospector>,
        memory: Arc<MemoryStore>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            schema,
            memory,
            history,
        }
    }

    /// Build the context for `question`.
    ///
    /// Schema failures propagate. Memory lookup failures only drop that
    /// section.
    pub async fn assemble(&self, question: &str, user_id: Option<&str>) -> Result<AssembledContext> {
        let schema = self.schema.rich_context().await?;
        let known_tables = self.schema.table_names().await.unwrap_or_else(|e| {
            warn!("Could not list schema tables: {:#}", e);
            Vec::new()
        });
        let tables = mentioned_tables(question, &known_tables);

        let history = self.history.context_string(&tables);

        let memories = self
            .memory
            .relevant(question, &tables, &[], user_id)
            .unwrap_or_else(|e| {
                warn!("Skipping memory context: {:#}", e);
                Vec::new()
            });
        let memory = MemoryStore::render_context(&memories);

        let text = [schema, history, memory]
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(AssembledContext {
            text,
            memory_ids: memories.into_iter().map(|m| m.id).collect(),
            tables,
        })
    }
}

/// Known table names that appear as whole words in the question, in schema
/// order.
fn mentioned_tables(question: &str, known: &[String]) -> Vec<String> {
    let lower = question.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    known
        .iter()
        .map(|t| t.to_lowercase())
        .filter(|t| words.contains(&t.as_str()))
        .collect()
}
