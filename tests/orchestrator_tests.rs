use futures::StreamExt;
use query_pilot::agent::MockProvider;
use query_pilot::config::PipelineConfig;
use query_pilot::database::{MockDatabase, QueryOutcome};
use query_pilot::orchestrator::{
    prompts, CancellationToken, Orchestrator, StepEvent, StepKind, TurnEvent, TurnRequest,
    TurnStatus,
};
use query_pilot::persistence::memory::NewMemory;
use query_pilot::persistence::Stores;
use query_pilot::safety::WRITE_REFUSED;
use query_pilot::test_utils::{create_test_stores, payroll_schema};
use query_pilot::types::{MemoryScope, MemoryType, Message, MessageRole, QueryResult};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    _dir: TempDir,
    provider: Arc<MockProvider>,
    database: Arc<MockDatabase>,
    stores: Stores,
    orchestrator: Arc<Orchestrator>,
}

fn harness(provider: MockProvider, database: MockDatabase) -> Harness {
    harness_with(provider, database, PipelineConfig::default())
}

fn harness_with(provider: MockProvider, database: MockDatabase, pipeline: PipelineConfig) -> Harness {
    let (dir, stores) = create_test_stores();
    let provider = Arc::new(provider);
    let database = Arc::new(database);
    let orchestrator = Orchestrator::new(
        provider.clone(),
        database.clone(),
        Arc::new(payroll_schema()),
        stores.clone(),
    )
    .with_pipeline(pipeline);
    Harness {
        _dir: dir,
        provider,
        database,
        stores,
        orchestrator: Arc::new(orchestrator),
    }
}

fn sql_reply(sql: &str) -> String {
    format!("Here is the query.\n```sql\n{}\n```", sql)
}

fn single_value(column: &str, value: serde_json::Value) -> QueryResult {
    let mut row = serde_json::Map::new();
    row.insert(column.to_string(), value);
    QueryResult {
        columns: vec![column.to_string()],
        data: vec![row],
    }
}

#[tokio::test]
async fn highest_salary_is_answered_in_one_attempt() {
    let sql = "SELECT MAX(base_salary) AS max_salary FROM payroll LIMIT 1";
    let h = harness(
        MockProvider::with_responses([
            sql_reply(sql),
            "The highest base salary is $250,000.".to_string(),
        ]),
        MockDatabase::new(vec![QueryOutcome::Rows(single_value(
            "max_salary",
            json!(250000.0),
        ))]),
    );

    let report = h
        .orchestrator
        .answer(TurnRequest::new("What is the highest base salary?"))
        .await;

    assert_eq!(report.status, TurnStatus::Answered);
    let done = report.final_event().expect("final event");
    let info = done.query_info.as_ref().expect("query info");
    assert!(info.sql.contains("MAX("));
    assert_eq!(info.rows_returned, 1);
    assert_eq!(info.tables_used, vec!["payroll".to_string()]);
    assert_eq!(done.final_answer, "The highest base salary is $250,000.");
    assert!(done.chart.is_none());
    assert_eq!(report.count(StepKind::Execution), 1);
    assert_eq!(report.count(StepKind::Analysis), 1);

    // MAX without COALESCE is flagged but still runs
    let warning = report
        .steps()
        .find_map(|s| match s {
            StepEvent::Warning { message } => Some(message.clone()),
            _ => None,
        })
        .expect("advisory warning");
    assert!(warning.starts_with("SQL Validation: "));
    assert!(warning.contains("COALESCE"));

    let entries = h.stores.history.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    assert_eq!(entries[0].row_count, 1);
}

#[tokio::test]
async fn failed_attempt_is_repaired_and_reports_corrected_tables() {
    let bad = "SELECT MAX(salary) FROM employees LIMIT 1";
    let good = "SELECT COALESCE(MAX(base_salary), 0) AS top FROM payroll LIMIT 1";
    let h = harness(
        MockProvider::with_responses([
            sql_reply(bad),
            sql_reply(good),
            "Top salary is 250000.".to_string(),
        ]),
        MockDatabase::new(vec![
            QueryOutcome::failed("Binder Error: Referenced column \"salary\" not found"),
            QueryOutcome::Rows(single_value("top", json!(250000))),
        ]),
    );

    let report = h
        .orchestrator
        .answer(TurnRequest::new("What is the highest salary?"))
        .await;

    assert_eq!(report.status, TurnStatus::Answered);
    assert_eq!(report.count(StepKind::Execution), 2);
    assert_eq!(report.count(StepKind::Error), 1);
    assert_eq!(report.count(StepKind::RetryPlan), 1);

    let info = report.final_event().unwrap().query_info.clone().unwrap();
    assert_eq!(info.sql, good);
    assert_eq!(info.tables_used, vec!["payroll".to_string()]);
    assert_eq!(h.database.executed(), vec![bad.to_string(), good.to_string()]);

    // the repair request quotes the database error
    let repair_request = &h.provider.requests()[1];
    let last = repair_request.last().unwrap();
    assert_eq!(last.role, MessageRole::User);
    assert!(last.content.contains("Referenced column \"salary\" not found"));
}

#[tokio::test]
async fn exhausted_retries_yield_failure_and_a_failed_log_entry() {
    let sql = "SELECT nope FROM payroll LIMIT 5";
    let h = harness(
        MockProvider::new(sql_reply(sql)),
        MockDatabase::default().with_fallback(QueryOutcome::failed("no such column: nope")),
    );

    let report = h
        .orchestrator
        .answer(TurnRequest::new("Show me nope"))
        .await;

    assert_eq!(report.status, TurnStatus::Failed);
    assert_eq!(report.count(StepKind::Execution), 3);
    assert_eq!(report.count(StepKind::Error), 3);
    // no repair is requested after the final attempt
    assert_eq!(report.count(StepKind::RetryPlan), 2);
    assert_eq!(h.provider.call_count(), 3);

    let done = report.final_event().unwrap();
    assert_eq!(done.final_answer, prompts::FAILURE_MESSAGE);
    assert!(done.data.is_none());
    assert!(done.query_info.is_none());

    let entries = h.stores.history.entries();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert_eq!(entries[0].row_count, 0);
    assert!(entries[0].tables.is_empty());
}

#[tokio::test]
async fn repair_without_sql_ends_the_retry_loop() {
    let h = harness(
        MockProvider::with_responses([
            sql_reply("SELECT nope FROM payroll LIMIT 5"),
            "I am not sure.".to_string(),
        ]),
        MockDatabase::default().with_fallback(QueryOutcome::failed("no such column: nope")),
    );

    let report = h.orchestrator.answer(TurnRequest::new("Show me nope")).await;

    assert_eq!(report.status, TurnStatus::Failed);
    assert_eq!(report.count(StepKind::Execution), 1);
    assert_eq!(report.count(StepKind::RetryPlan), 1);
    assert_eq!(h.provider.call_count(), 2);
    assert_eq!(h.database.executed().len(), 1);
    assert_eq!(
        report.final_event().unwrap().final_answer,
        prompts::FAILURE_MESSAGE
    );

    let entries = h.stores.history.entries();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert_eq!(entries[0].row_count, 0);
}

#[tokio::test]
async fn retry_bound_follows_pipeline_config() {
    let pipeline = PipelineConfig {
        max_retries: 1,
        ..PipelineConfig::default()
    };
    let h = harness_with(
        MockProvider::new(sql_reply("SELECT x FROM payroll LIMIT 1")),
        MockDatabase::default().with_fallback(QueryOutcome::failed("boom")),
        pipeline,
    );

    let report = h.orchestrator.answer(TurnRequest::new("x?")).await;
    assert_eq!(report.status, TurnStatus::Failed);
    assert_eq!(report.count(StepKind::Execution), 1);
    assert_eq!(report.count(StepKind::RetryPlan), 0);
}

#[tokio::test]
async fn destructive_sql_is_refused_before_reaching_the_database() {
    let h = harness(
        MockProvider::with_responses([
            sql_reply("DELETE FROM payroll"),
            sql_reply("SELECT COUNT(*) AS n FROM payroll LIMIT 1"),
            "There are 3 rows.".to_string(),
        ]),
        MockDatabase::new(vec![QueryOutcome::Rows(single_value("n", json!(3)))]),
    );

    let report = h
        .orchestrator
        .answer(TurnRequest::new("Remove everyone, then count"))
        .await;

    assert_eq!(report.status, TurnStatus::Answered);
    let first_error = report
        .steps()
        .find_map(|s| match s {
            StepEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(first_error, WRITE_REFUSED);
    assert_eq!(
        h.database.executed(),
        vec!["SELECT COUNT(*) AS n FROM payroll LIMIT 1".to_string()]
    );
}

#[tokio::test]
async fn clarification_request_ends_turn_and_logs_failure() {
    let h = harness(
        MockProvider::with_responses(["Which fiscal year do you mean?"]),
        MockDatabase::default(),
    );

    let report = h
        .orchestrator
        .answer(TurnRequest::new("What was the budget?"))
        .await;

    assert_eq!(report.status, TurnStatus::ClarificationNeeded);
    let done = report.final_event().unwrap();
    assert_eq!(done.clarification_needed, Some(true));
    assert_eq!(done.final_answer, "Which fiscal year do you mean?");
    assert!(h.database.executed().is_empty());

    let entries = h.stores.history.entries();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert_eq!(entries[0].sql, "");
}

#[tokio::test]
async fn direct_answer_is_not_logged() {
    let h = harness(
        MockProvider::with_responses(["I cannot answer this with the available data."]),
        MockDatabase::default(),
    );

    let report = h
        .orchestrator
        .answer(TurnRequest::new("What is the weather?"))
        .await;

    assert_eq!(report.status, TurnStatus::DirectAnswer);
    assert_eq!(report.final_event().unwrap().clarification_needed, None);
    assert!(h.stores.history.is_empty());
}

#[tokio::test]
async fn prompt_includes_only_the_last_ten_conversation_messages() {
    let h = harness(
        MockProvider::with_responses(["I cannot answer this with the available data."]),
        MockDatabase::default(),
    );
    let history: Vec<Message> = (0..15)
        .map(|i| {
            if i % 2 == 0 {
                Message::user(format!("m{}", i))
            } else {
                Message::assistant(format!("m{}", i))
            }
        })
        .collect();
    h.stores.conversations.save("c1", &history).unwrap();

    h.orchestrator
        .answer(TurnRequest::new("and now?").in_conversation("c1"))
        .await;

    assert_eq!(h.stores.conversations.get("c1").unwrap().len(), 15);
    let sent = &h.provider.requests()[0];
    assert_eq!(sent.len(), 12);
    assert_eq!(sent[0].role, MessageRole::System);
    let window: Vec<&str> = sent[1..11].iter().map(|m| m.content.as_str()).collect();
    let expected: Vec<String> = (5..15).map(|i| format!("m{}", i)).collect();
    assert_eq!(window, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(sent[11].content, "and now?");
}

#[tokio::test]
async fn successful_turn_appends_summary_to_conversation() {
    let sql = "SELECT COUNT(*) AS n FROM payroll LIMIT 1";
    let h = harness(
        MockProvider::with_responses([sql_reply(sql), "There are 3 employees.".to_string()]),
        MockDatabase::new(vec![QueryOutcome::Rows(single_value("n", json!(3)))]),
    );

    h.orchestrator
        .answer(TurnRequest::new("How many employees?").in_conversation("c2"))
        .await;

    let messages = h.stores.conversations.get("c2").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "How many employees?");
    assert_eq!(
        messages[1].content,
        format!("SQL: {}\n\nResult: There are 3 employees.", sql)
    );
}

#[tokio::test]
async fn failed_store_writes_do_not_fail_the_turn() {
    let sql = "SELECT COUNT(*) AS n FROM payroll LIMIT 1";
    let h = harness(
        MockProvider::with_responses([sql_reply(sql), "There are 3 employees.".to_string()]),
        MockDatabase::new(vec![QueryOutcome::Rows(single_value("n", json!(3)))]),
    );
    // a directory where a document should go makes every write to it fail
    let history_file = h._dir.path().join("memory").join("query_history.json");
    let _ = std::fs::remove_file(&history_file);
    std::fs::create_dir_all(&history_file).unwrap();
    std::fs::create_dir_all(h._dir.path().join("conversations").join("c9.json")).unwrap();

    let report = h
        .orchestrator
        .answer(TurnRequest::new("How many employees?").in_conversation("c9"))
        .await;

    assert_eq!(report.status, TurnStatus::Answered);
    let done = report.final_event().unwrap();
    assert_eq!(done.final_answer, "There are 3 employees.");
    let info = done.query_info.as_ref().unwrap();
    assert_eq!(info.sql, sql);
    assert_eq!(info.rows_returned, 1);

    // nothing unsaved lingers in the cache
    assert!(h.stores.history.entries().is_empty());
    assert!(h.stores.history.popular_queries(None, 10).is_empty());
}

#[tokio::test]
async fn chart_is_materialized_and_json_stripped_from_answer() {
    let sql = "SELECT agency_name, COUNT(*) AS n FROM payroll GROUP BY agency_name LIMIT 100";
    let analysis = "Police is larger.\n```json\n{\"chart_type\": \"bar\", \"x_axis\": \"agency_name\", \"y_axis\": \"n\", \"title\": \"Headcount\"}\n```";
    let rows = ["POLICE DEPARTMENT", "FIRE DEPARTMENT"]
        .iter()
        .zip([2, 1])
        .map(|(agency, n)| {
            let mut row = serde_json::Map::new();
            row.insert("agency_name".to_string(), json!(agency));
            row.insert("n".to_string(), json!(n));
            row
        })
        .collect();
    let result = QueryResult {
        columns: vec!["agency_name".to_string(), "n".to_string()],
        data: rows,
    };
    let h = harness(
        MockProvider::with_responses([sql_reply(sql), analysis.to_string()]),
        MockDatabase::new(vec![QueryOutcome::Rows(result)]),
    );

    let report = h
        .orchestrator
        .answer(TurnRequest::new("Headcount by agency"))
        .await;

    let done = report.final_event().unwrap();
    assert_eq!(done.final_answer, "Police is larger.");
    let chart = done.chart.as_ref().expect("chart");
    assert_eq!(chart.chart_type, "bar");
    assert_eq!(chart.labels, vec![json!("POLICE DEPARTMENT"), json!("FIRE DEPARTMENT")]);
    assert_eq!(chart.values, vec![json!(2), json!(1)]);
}

#[tokio::test]
async fn injected_memories_have_usage_recorded() {
    let h = harness(
        MockProvider::with_responses([
            sql_reply("SELECT COUNT(*) AS n FROM payroll WHERE agency_name LIKE '%POLICE%' LIMIT 1"),
            "There are 2 officers.".to_string(),
        ]),
        MockDatabase::new(vec![QueryOutcome::Rows(single_value("n", json!(2)))]),
    );
    let memory = h
        .stores
        .memory
        .add(
            NewMemory::new(
                "NYPD",
                "NYPD means agency_name LIKE '%POLICE%'",
                MemoryType::SemanticMapping,
            ),
            MemoryScope::Global,
        )
        .unwrap();

    let report = h
        .orchestrator
        .answer(TurnRequest::new("How many NYPD officers?"))
        .await;
    assert_eq!(report.status, TurnStatus::Answered);

    let system = &h.provider.requests()[0][0];
    assert!(system.content.contains("NYPD means agency_name LIKE '%POLICE%'"));

    let stored = h.stores.memory.get(&memory.id).unwrap().unwrap();
    assert_eq!(stored.use_count, 1);
    assert_eq!(stored.success_count, 1);
}

#[tokio::test]
async fn model_timeout_aborts_with_error_step_and_no_log() {
    let pipeline = PipelineConfig {
        model_timeout_secs: 1,
        ..PipelineConfig::default()
    };
    let h = harness_with(
        MockProvider::new("late").with_delay(Duration::from_secs(5)),
        MockDatabase::default(),
        pipeline,
    );

    let report = h.orchestrator.answer(TurnRequest::new("anything")).await;

    assert_eq!(report.status, TurnStatus::Aborted);
    assert!(report.final_event().is_none());
    let message = report
        .steps()
        .find_map(|s| match s {
            StepEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("timed out"));
    assert!(h.stores.history.is_empty());
}

#[tokio::test]
async fn database_timeout_is_a_recoverable_attempt_failure() {
    let pipeline = PipelineConfig {
        max_retries: 2,
        query_timeout_secs: 1,
        ..PipelineConfig::default()
    };
    let h = harness_with(
        MockProvider::new(sql_reply("SELECT 1 FROM payroll LIMIT 1")),
        MockDatabase::default().with_delay(Duration::from_secs(3)),
        pipeline,
    );

    let report = h.orchestrator.answer(TurnRequest::new("slow?")).await;

    assert_eq!(report.status, TurnStatus::Failed);
    assert_eq!(report.count(StepKind::Error), 2);
    assert_eq!(h.stores.history.len(), 1);
}

#[tokio::test]
async fn cancelled_turn_stops_without_logging() {
    let h = harness(
        MockProvider::new(sql_reply("SELECT 1 FROM payroll LIMIT 1")).with_delay(Duration::from_millis(200)),
        MockDatabase::default(),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move {
        orchestrator
            .run_turn(TurnRequest::new("cancel me"), tx, token)
            .await
    });

    // first event is the planning status; cancel while the model is busy
    let first = rx.recv().await.unwrap();
    assert!(matches!(first, TurnEvent::Status { .. }));
    cancel.cancel();

    let status = run.await.unwrap();
    assert_eq!(status, TurnStatus::Cancelled);
    assert!(h.database.executed().is_empty());
    assert!(h.stores.history.is_empty());
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_turn() {
    let h = harness(
        MockProvider::new(sql_reply("SELECT 1 FROM payroll LIMIT 1")).with_delay(Duration::from_millis(200)),
        MockDatabase::default(),
    );

    {
        let events = h.orchestrator.stream(TurnRequest::new("never mind"));
        tokio::pin!(events);
        let first = events.next().await.unwrap();
        assert!(matches!(first, TurnEvent::Status { .. }));
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(h.database.executed().is_empty());
    assert!(h.stores.history.is_empty());
}

#[tokio::test]
async fn stream_yields_events_in_order_ending_with_final() {
    let sql = "SELECT COUNT(*) AS n FROM payroll LIMIT 1";
    let h = harness(
        MockProvider::with_responses([sql_reply(sql), "Three.".to_string()]),
        MockDatabase::new(vec![QueryOutcome::Rows(single_value("n", json!(3)))]),
    );

    let events: Vec<TurnEvent> = h
        .orchestrator
        .stream(TurnRequest::new("How many?"))
        .collect()
        .await;

    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            TurnEvent::Status { .. } => "status",
            TurnEvent::Step(step) => step.kind().as_str(),
            TurnEvent::Final(_) => "final",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "status",
            "plan",
            "warning",
            "status",
            "execution",
            "success",
            "status",
            "analysis",
            "final"
        ]
    );
    let json = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(json["type"], "final");
    assert_eq!(json["query_info"]["rows_returned"], 1);
}

#[tokio::test]
async fn feedback_is_saved_as_a_general_correction() {
    let h = harness(MockProvider::default(), MockDatabase::default());

    let memory = h
        .orchestrator
        .record_feedback(
            "Average salary by agency",
            "Use base_salary, not gross pay",
            &["payroll".to_string()],
            "user",
            Some("alice"),
        )
        .unwrap();
    assert_eq!(memory.memory_type, MemoryType::General);
    assert_eq!(memory.scope, MemoryScope::User("alice".to_string()));
    assert_eq!(memory.pattern, "Average salary by agency");

    let err = h
        .orchestrator
        .record_feedback("q", "c", &[], "user", None)
        .unwrap_err();
    assert!(err.to_string().contains("user_id"));
}
