//! Database collaborators
//!
//! The orchestrator only sees these traits. [`duckdb::DuckDbDatabase`] is the
//! shipped adapter; [`mock`] holds scripted fakes for tests and demos.

pub mod duckdb;
pub mod mock;

pub use self::duckdb::DuckDbDatabase;
pub use mock::{MockDatabase, StaticSchema};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::QueryResult;

/// Result of handing one statement to the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows(QueryResult),
    /// The database refused or failed the statement. The text is fed back to
    /// the model on retry.
    Failed(String),
}

impl QueryOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        QueryOutcome::Failed(message.into())
    }

    pub fn is_rows(&self) -> bool {
        matches!(self, QueryOutcome::Rows(_))
    }
}

/// Runs read-only SQL.
///
/// Implementations must refuse destructive statements themselves, even when
/// the caller already checked them. `Err` is reserved for failures of the
/// collaborator itself, not for bad SQL.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryOutcome>;
}

/// Describes the schema to the model.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// Text block listing tables, columns and sample values.
    async fn rich_context(&self) -> Result<String>;

    /// Known table names, lowercased.
    async fn table_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
