use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{QueryExecutor, QueryOutcome, SchemaIntrospector};
use crate::safety::{contains_destructive_keyword, WRITE_REFUSED};
use crate::types::QueryResult;

/// Executor that replays scripted outcomes in order.
///
/// Every statement is recorded, including refused ones. Refusals by the
/// keyword gate do not consume a scripted outcome. Once the script runs out
/// the fallback (an empty result by default) is returned.
#[derive(Debug, Clone)]
pub struct MockDatabase {
    script: Arc<Mutex<VecDeque<QueryOutcome>>>,
    executed: Arc<Mutex<Vec<String>>>,
    fallback: QueryOutcome,
    delay: Option<Duration>,
}

impl Default for MockDatabase {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockDatabase {
    pub fn new(outcomes: Vec<QueryOutcome>) -> Self {
        Self {
            script: Arc::new(Mutex::new(outcomes.into())),
            executed: Arc::new(Mutex::new(Vec::new())),
            fallback: QueryOutcome::Rows(QueryResult::default()),
            delay: None,
        }
    }

    pub fn with_fallback(mut self, fallback: QueryOutcome) -> Self {
        self.fallback = fallback;
        self
    }

    /// Sleep before answering, for timeout and cancellation tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Statements seen so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueryExecutor for MockDatabase {
    async fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(sql.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if contains_destructive_keyword(sql) {
            return Ok(QueryOutcome::failed(WRITE_REFUSED));
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Introspector returning a fixed context.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    context: String,
    tables: Vec<String>,
}

impl StaticSchema {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            tables: Vec::new(),
        }
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables
            .into_iter()
            .map(|t| t.into().to_lowercase())
            .collect();
        self
    }
}

#[async_trait]
impl SchemaIntrospector for StaticSchema {
    async fn rich_context(&self) -> Result<String> {
        Ok(self.context.clone())
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.tables.clone())
    }
}
