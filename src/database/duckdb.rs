use anyhow::{Context, Result};
use async_trait::async_trait;
use ::duckdb::types::Value as DuckValue;
use ::duckdb::{AccessMode, Config, Connection, InterruptHandle};
use serde_json::{Map, Number, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{QueryExecutor, QueryOutcome, SchemaIntrospector};
use crate::persistence::expand_tilde;
use crate::safety::{contains_destructive_keyword, WRITE_REFUSED};
use crate::types::QueryResult;

const SAMPLE_VALUES: usize = 3;
const MAX_CATEGORIES: i64 = 10;

/// DuckDB-backed executor and schema introspector.
///
/// `setup` is the connection the database was opened with. Every query runs on
/// its own clone of it on the blocking thread pool, so a slow statement never
/// holds up another turn. Dropping a call before it completes interrupts the
/// statement it started.
#[derive(Clone)]
pub struct DuckDbDatabase {
    setup: Arc<Mutex<Connection>>,
}

impl DuckDbDatabase {
    /// Open an existing analytics database in read-only mode. A missing file
    /// is created empty first.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = prepare_path(path.as_ref())?;
        if !path.exists() {
            Connection::open(&path)
                .with_context(|| format!("creating DuckDB at {}", path.display()))?;
        }
        let config = Config::default()
            .access_mode(AccessMode::ReadOnly)
            .context("configuring read-only access")?;
        let conn = Connection::open_with_flags(&path, config)
            .with_context(|| format!("opening DuckDB at {}", path.display()))?;
        debug!("Opened DuckDB at {} (read-only)", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Open a database file for loading data through [`Self::execute_batch`].
    pub fn open_writable<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = prepare_path(path.as_ref())?;
        let conn = Connection::open(&path)
            .with_context(|| format!("opening DuckDB at {}", path.display()))?;
        debug!("Opened DuckDB at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// In-memory databases cannot be read-only; only the keyword gate applies.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory DuckDB")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            setup: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run setup statements such as fixture DDL. Bypasses the keyword gate.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = lock_conn(&self.setup);
        conn.execute_batch(sql).context("executing batch")
    }

    fn connect(&self) -> Result<Connection> {
        lock_conn(&self.setup)
            .try_clone()
            .context("opening DuckDB connection")
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.connect()?;
        let guard = InterruptOnDrop::new(conn.interrupt_handle());
        let abandoned = Arc::clone(&guard.abandoned);
        let result = tokio::task::spawn_blocking(move || {
            if abandoned.load(Ordering::Acquire) {
                anyhow::bail!("database call abandoned before it started");
            }
            f(&conn)
        })
        .await;
        guard.disarm();
        result.context("database task panicked")?
    }
}

fn prepare_path(path: &Path) -> Result<std::path::PathBuf> {
    let path = expand_tilde(path)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).context("creating database directory")?;
    }
    Ok(path)
}

fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Interrupts the statement running on a connection unless disarmed first.
struct InterruptOnDrop {
    handle: Arc<InterruptHandle>,
    abandoned: Arc<AtomicBool>,
    armed: bool,
}

impl InterruptOnDrop {
    fn new(handle: Arc<InterruptHandle>) -> Self {
        Self {
            handle,
            abandoned: Arc::new(AtomicBool::new(false)),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if self.armed {
            warn!("Interrupting abandoned DuckDB statement");
            self.abandoned.store(true, Ordering::Release);
            self.handle.interrupt();
        }
    }
}

#[async_trait]
impl QueryExecutor for DuckDbDatabase {
    async fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        if contains_destructive_keyword(sql) {
            return Ok(QueryOutcome::failed(WRITE_REFUSED));
        }
        let sql = sql.to_string();
        self.blocking(move |conn| {
            Ok(match run_query(conn, &sql) {
                Ok(result) => QueryOutcome::Rows(result),
                Err(e) => QueryOutcome::Failed(e.to_string()),
            })
        })
        .await
    }
}

#[async_trait]
impl SchemaIntrospector for DuckDbDatabase {
    async fn rich_context(&self) -> Result<String> {
        self.blocking(|conn| {
            let mut context = String::new();
            for table in list_tables(conn)? {
                context.push_str(&describe_table(conn, &table)?);
                context.push('\n');
            }
            Ok(context.trim_end().to_string())
        })
        .await
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.blocking(|conn| {
            Ok(list_tables(conn)?
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect())
        })
        .await
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<QueryResult, ::duckdb::Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let columns: Vec<String> = rows
        .as_ref()
        .map(|s| s.column_names())
        .unwrap_or_default();

    let mut data = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::new();
        for (index, name) in columns.iter().enumerate() {
            let value: DuckValue = row.get(index)?;
            record.insert(name.clone(), to_json(value));
        }
        data.push(record);
    }
    Ok(QueryResult { columns, data })
}

fn to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(n) => Value::from(n),
        DuckValue::SmallInt(n) => Value::from(n),
        DuckValue::Int(n) => Value::from(n),
        DuckValue::BigInt(n) => Value::from(n),
        DuckValue::UTinyInt(n) => Value::from(n),
        DuckValue::USmallInt(n) => Value::from(n),
        DuckValue::UInt(n) => Value::from(n),
        DuckValue::UBigInt(n) => Value::from(n),
        DuckValue::HugeInt(n) => i64::try_from(n)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(n.to_string())),
        DuckValue::Float(f) => float_json(f as f64),
        DuckValue::Double(f) => float_json(f),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(float_json)
            .unwrap_or_else(|_| Value::String(d.to_string())),
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::String(s),
        DuckValue::Date32(days) => chrono::DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(|dt| Value::String(dt.date_naive().to_string()))
            .unwrap_or(Value::Null),
        other => Value::String(format!("{:?}", other)),
    }
}

fn float_json(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'main' ORDER BY table_name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect::<Result<Vec<_>, _>>()
        .context("listing tables")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn describe_table(conn: &Connection, table: &str) -> Result<String> {
    let mut stmt = conn.prepare(
        "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_schema = 'main' AND table_name = ? ORDER BY ordinal_position",
    )?;
    let columns = stmt
        .query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("describing {}", table))?;

    let table_ident = quote_ident(table);
    let mut out = format!("### Table: {}\n", table);
    out.push_str("### Column Insights (Use these values for filtering):\n");

    for (column, data_type) in columns {
        let column_ident = quote_ident(&column);
        out.push_str(&format!("- **{}** ({}): ", column, data_type));

        let categories = if data_type.eq_ignore_ascii_case("VARCHAR") {
            let distinct: i64 = conn.query_row(
                &format!("SELECT COUNT(DISTINCT {}) FROM {}", column_ident, table_ident),
                [],
                |row| row.get(0),
            )?;
            if distinct > 0 && distinct <= MAX_CATEGORIES {
                Some(string_column(
                    conn,
                    &format!(
                        "SELECT DISTINCT CAST({c} AS VARCHAR) FROM {t} WHERE {c} IS NOT NULL ORDER BY 1",
                        c = column_ident,
                        t = table_ident
                    ),
                )?)
            } else {
                None
            }
        } else {
            None
        };

        match categories {
            Some(values) => out.push_str(&format!("Values: {:?}\n", values)),
            None => {
                let samples = string_column(
                    conn,
                    &format!(
                        "SELECT CAST({c} AS VARCHAR) FROM {t} WHERE {c} IS NOT NULL LIMIT {n}",
                        c = column_ident,
                        t = table_ident,
                        n = SAMPLE_VALUES
                    ),
                )?;
                out.push_str(&format!("Sample values: {:?}\n", samples));
            }
        }
    }
    Ok(out)
}

fn string_column(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect::<Result<Vec<_>, _>>()
        .context("reading column values")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const STALL: &str =
        "SELECT SUM(a.range * b.range) AS s FROM range(100000000) a, range(100000000) b";

    fn fixture() -> DuckDbDatabase {
        let db = DuckDbDatabase::open_in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE payroll (agency_name VARCHAR, base_salary DOUBLE, fiscal_year INTEGER);
             INSERT INTO payroll VALUES
                ('POLICE DEPARTMENT', 85000.5, 2023),
                ('FIRE DEPARTMENT', 91000.0, 2023),
                ('POLICE DEPARTMENT', NULL, 2022);",
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn select_returns_columns_and_json_rows() {
        let db = fixture();
        let outcome = db
            .execute("SELECT agency_name, MAX(base_salary) AS top FROM payroll GROUP BY agency_name ORDER BY agency_name")
            .await
            .unwrap();
        let QueryOutcome::Rows(result) = outcome else {
            panic!("expected rows, got {:?}", outcome);
        };
        assert_eq!(result.columns, vec!["agency_name", "top"]);
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.data[0]["agency_name"], "FIRE DEPARTMENT");
        assert_eq!(result.data[1]["top"], 85000.5);
    }

    #[tokio::test]
    async fn bad_sql_is_a_failed_outcome() {
        let db = fixture();
        let outcome = db.execute("SELECT nope FROM payroll").await.unwrap();
        assert!(matches!(outcome, QueryOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn writes_are_refused_before_reaching_duckdb() {
        let db = fixture();
        let outcome = db.execute("DELETE FROM payroll").await.unwrap();
        assert_eq!(outcome, QueryOutcome::failed(WRITE_REFUSED));
        let QueryOutcome::Rows(count) = db.execute("SELECT COUNT(*) AS n FROM payroll").await.unwrap() else {
            panic!("count failed");
        };
        assert_eq!(count.data[0]["n"], 3);
    }

    #[tokio::test]
    async fn rich_context_lists_categories_and_samples() {
        let db = fixture();
        let context = db.rich_context().await.unwrap();
        assert!(context.contains("### Table: payroll"));
        assert!(context.contains("**agency_name** (VARCHAR): Values: [\"FIRE DEPARTMENT\", \"POLICE DEPARTMENT\"]"));
        assert!(context.contains("**base_salary** (DOUBLE): Sample values:"));
        assert_eq!(db.table_names().await.unwrap(), vec!["payroll"]);
    }

    #[tokio::test]
    async fn abandoned_statement_does_not_hold_up_other_calls() {
        let db = fixture();
        let stalled = tokio::time::timeout(Duration::from_millis(500), db.execute(STALL)).await;
        assert!(stalled.is_err());

        let quick = tokio::time::timeout(Duration::from_secs(5), db.execute("SELECT 1 AS one"))
            .await
            .expect("second call waited on the stalled one")
            .unwrap();
        let QueryOutcome::Rows(result) = quick else {
            panic!("expected rows, got {:?}", quick);
        };
        assert_eq!(result.data[0]["one"], 1);
    }

    #[tokio::test]
    async fn file_databases_are_opened_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payroll.duckdb");
        {
            let writable = DuckDbDatabase::open_writable(&path).unwrap();
            writable
                .execute_batch(
                    "CREATE TABLE payroll (agency_name VARCHAR);
                     INSERT INTO payroll VALUES ('POLICE DEPARTMENT');",
                )
                .unwrap();
        }

        let db = DuckDbDatabase::open(&path).unwrap();
        let outcome = db
            .execute("CREATE TABLE payroll_copy AS SELECT * FROM payroll")
            .await
            .unwrap();
        let QueryOutcome::Failed(error) = outcome else {
            panic!("expected a refusal, got {:?}", outcome);
        };
        assert!(error.to_lowercase().contains("read-only"), "{}", error);
        assert!(db.execute_batch("CREATE TABLE scratch (x INTEGER)").is_err());
        assert_eq!(db.table_names().await.unwrap(), vec!["payroll"]);
    }

    #[test]
    fn open_creates_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("empty.duckdb");
        DuckDbDatabase::open(&path).unwrap();
        assert!(path.exists());
    }
}
