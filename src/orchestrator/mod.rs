//! Question-answering pipeline
//!
//! One turn runs PLAN, VALIDATE, EXECUTE (with bounded repair), ANALYZE and
//! PERSIST in sequence, emitting [`TurnEvent`]s as it goes. Turns share no
//! mutable state besides the stores, so any number may run concurrently.

pub mod cancel;
pub mod chart;
pub mod events;
pub mod prompts;

pub use cancel::CancellationToken;
pub use chart::{Chart, ChartSpec};
pub use events::{FinalEvent, QueryInfo, StepEvent, StepKind, TurnEvent};

use anyhow::Result;
use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{GenerationConfig, ModelProvider, ModelResponse};
use crate::config::PipelineConfig;
use crate::context::ContextAssembler;
use crate::database::{QueryExecutor, QueryOutcome, SchemaIntrospector};
use crate::error::CollaboratorError;
use crate::persistence::history::NewQueryLog;
use crate::persistence::memory::NewMemory;
use crate::persistence::Stores;
use crate::safety::{SafetyDecision, SafetyValidator};
use crate::sql::{extract_sql_block, strip_json_blocks, SqlAnalyzer};
use crate::types::{Memory, MemoryType, Message, QueryResult};

const EVENT_BUFFER: usize = 64;

/// A question to answer, optionally within a conversation and for a user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    pub question: String,
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
}

impl TurnRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn for_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// SQL ran and the result was analyzed
    Answered,
    /// The model replied without SQL
    DirectAnswer,
    ClarificationNeeded,
    /// Every execution attempt failed, or a repair produced no SQL
    Failed,
    /// A collaborator failed unexpectedly; an `error` step was emitted
    Aborted,
    /// The caller cancelled or stopped listening
    Cancelled,
}

/// Everything a turn emitted, collected.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub status: TurnStatus,
    pub events: Vec<TurnEvent>,
}

impl TurnReport {
    pub fn final_event(&self) -> Option<&FinalEvent> {
        self.events.iter().rev().find_map(TurnEvent::as_final)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepEvent> {
        self.events.iter().filter_map(TurnEvent::as_step)
    }

    pub fn count(&self, kind: StepKind) -> usize {
        self.steps().filter(|s| s.kind() == kind).count()
    }
}

/// Why a turn stopped early
enum Halt {
    Cancelled,
    Unexpected(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(e: anyhow::Error) -> Self {
        Halt::Unexpected(e)
    }
}

/// Per-turn plumbing: where events go and whether to keep going.
struct Turn<'a> {
    sink: &'a mpsc::Sender<TurnEvent>,
    cancel: &'a CancellationToken,
}

impl Turn<'_> {
    async fn emit(&self, event: TurnEvent) -> Result<(), Halt> {
        self.sink.send(event).await.map_err(|_| {
            self.cancel.cancel();
            Halt::Cancelled
        })
    }

    async fn step(&self, step: StepEvent) -> Result<(), Halt> {
        self.emit(TurnEvent::Step(step)).await
    }

    fn checkpoint(&self) -> Result<(), Halt> {
        if self.cancel.is_cancelled() || self.sink.is_closed() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    executor: Arc<dyn QueryExecutor>,
    assembler: ContextAssembler,
    validator: SafetyValidator,
    stores: Stores,
    pipeline: PipelineConfig,
    generation: GenerationConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        executor: Arc<dyn QueryExecutor>,
        schema: Arc<dyn SchemaIntrospector>,
        stores: Stores,
    ) -> Self {
        let assembler =
            ContextAssembler::new(schema, stores.memory.clone(), stores.history.clone());
        Self {
            provider,
            executor,
            assembler,
            validator: SafetyValidator::default(),
            stores,
            pipeline: PipelineConfig::default(),
            generation: GenerationConfig::default(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    /// Replace the structural SQL analyzer used for advisories and table
    /// extraction.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn SqlAnalyzer>) -> Self {
        self.validator = SafetyValidator::new(analyzer);
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Run one turn, sending events to `sink`.
    ///
    /// Returns once the turn is over. Dropping the receiving side of `sink`
    /// has the same effect as cancelling `cancel`.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
    ) -> TurnStatus {
        let turn = Turn {
            sink: &sink,
            cancel: &cancel,
        };
        match self.drive(&request, &turn).await {
            Ok(status) => {
                debug!("Turn finished: {:?}", status);
                status
            }
            Err(Halt::Cancelled) => {
                info!("Turn cancelled: {}", request.question);
                TurnStatus::Cancelled
            }
            Err(Halt::Unexpected(e)) => {
                warn!("Turn aborted: {:#}", e);
                let message = format!("{:#}", e);
                let _ = turn.step(StepEvent::Error { message }).await;
                TurnStatus::Aborted
            }
        }
    }

    /// Run one turn on a background task and stream its events. Dropping the
    /// stream cancels the turn at its next checkpoint.
    pub fn stream(self: &Arc<Self>, request: TurnRequest) -> impl Stream<Item = TurnEvent> + Send + 'static {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_turn(request, tx, CancellationToken::new()).await;
        });
        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    /// Run one turn to completion and collect its events.
    pub async fn answer(&self, request: TurnRequest) -> TurnReport {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let run = self.run_turn(request, tx, CancellationToken::new());
        let collect = async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        };
        let (status, events) = tokio::join!(run, collect);
        TurnReport { status, events }
    }

    /// Save user feedback as a general correction keyed on the question.
    pub fn record_feedback(
        &self,
        question: &str,
        correction: &str,
        tables: &[String],
        scope: &str,
        user_id: Option<&str>,
    ) -> Result<Memory> {
        let new = NewMemory::new(question, correction, MemoryType::General)
            .with_tables(tables.iter().cloned());
        let memory = self.stores.memory.add_scoped(new, scope, user_id)?;
        info!("Saved {} feedback memory {}", memory.scope.label(), memory.id);
        Ok(memory)
    }

    async fn drive(&self, request: &TurnRequest, turn: &Turn<'_>) -> Result<TurnStatus, Halt> {
        let started = Instant::now();
        let question = request.question.as_str();
        let user_id = request.user_id.as_deref();

        turn.emit(TurnEvent::status("Analyzing schema & planning...")).await?;

        let window = match &request.conversation_id {
            Some(id) => self
                .stores
                .conversations
                .window(id, self.pipeline.conversation_window)
                .unwrap_or_else(|e| {
                    warn!("Could not load conversation {}: {:#}", id, e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let context = bounded(
            "schema introspection",
            self.query_timeout(),
            self.assembler.assemble(question, user_id),
        )
        .await??;
        turn.checkpoint()?;

        let mut messages = Vec::with_capacity(window.len() + 2);
        messages.push(Message::system(prompts::system_prompt(&context.text)));
        messages.extend(window);
        messages.push(Message::user(question));

        // PLAN
        let plan = self.complete(&messages).await?;
        turn.checkpoint()?;
        turn.step(StepEvent::Plan {
            reasoning: plan.reasoning.clone(),
            content: plan.content.clone(),
        })
        .await?;

        let Some(mut sql) = extract_sql_block(&plan.content) else {
            return self.finish_without_sql(request, &plan, started, turn).await;
        };

        // VALIDATE
        let warnings = self.validator.advisories(&sql);
        if !warnings.is_empty() {
            turn.step(StepEvent::Warning {
                message: format!("SQL Validation: {}", warnings.join("; ")),
            })
            .await?;
        }

        // EXECUTE / RETRY
        let mut last_content = plan.content;
        let mut result: Option<QueryResult> = None;
        let mut exec_ms = 0u64;
        let max_attempts = self.pipeline.max_retries.max(1);

        for attempt in 1..=max_attempts {
            turn.emit(TurnEvent::status(format!("Executing SQL (Attempt {})...", attempt)))
                .await?;
            turn.step(StepEvent::Execution {
                sql: sql.clone(),
                attempt,
            })
            .await?;

            let exec_started = Instant::now();
            let outcome = self.execute(&sql).await?;
            exec_ms = elapsed_ms(exec_started);
            turn.checkpoint()?;

            let error = match outcome {
                QueryOutcome::Rows(rows) => {
                    turn.step(StepEvent::Success {
                        rows_returned: rows.row_count(),
                    })
                    .await?;
                    result = Some(rows);
                    break;
                }
                QueryOutcome::Failed(error) => error,
            };

            debug!("Attempt {} failed: {}", attempt, error);
            turn.step(StepEvent::Error {
                message: error.clone(),
            })
            .await?;
            if attempt == max_attempts {
                break;
            }

            messages.push(Message::assistant(last_content));
            messages.push(Message::user(prompts::retry_prompt(&error)));
            turn.emit(TurnEvent::status("Refining SQL...")).await?;

            let repair = self.complete(&messages).await?;
            turn.checkpoint()?;
            turn.step(StepEvent::RetryPlan {
                reasoning: repair.reasoning.clone(),
                content: repair.content.clone(),
            })
            .await?;

            match extract_sql_block(&repair.content) {
                Some(next) => sql = next,
                None => break,
            }
            last_content = repair.content;
        }

        let Some(result) = result else {
            turn.checkpoint()?;
            self.log_turn(request, &sql, Vec::new(), started, false, 0).await;
            self.record_memory_usage(&context.memory_ids, false).await;
            turn.emit(TurnEvent::Final(FinalEvent {
                final_answer: prompts::FAILURE_MESSAGE.to_string(),
                ..FinalEvent::default()
            }))
            .await?;
            return Ok(TurnStatus::Failed);
        };

        // ANALYZE
        let tables_used = self.validator.analyzer().tables(&sql);
        turn.emit(TurnEvent::status("Analyzing results...")).await?;
        messages.push(Message::assistant(prompts::executed_note(&sql)));
        messages.push(Message::user(prompts::analysis_prompt(&result)));

        let analysis = self.complete(&messages).await?;
        turn.checkpoint()?;
        turn.step(StepEvent::Analysis {
            reasoning: analysis.reasoning.clone(),
            content: analysis.content.clone(),
        })
        .await?;

        let chart = ChartSpec::parse(&analysis.content).and_then(|spec| spec.materialize(&result));
        let final_text = strip_json_blocks(&analysis.content);

        // PERSIST
        let rows_returned = result.row_count();
        self.log_turn(request, &sql, tables_used.clone(), started, true, rows_returned)
            .await;
        self.record_memory_usage(&context.memory_ids, true).await;
        if let Some(id) = &request.conversation_id {
            let exchange = [
                Message::user(question),
                Message::assistant(prompts::conversation_summary(&sql, &final_text)),
            ];
            let conversations = Arc::clone(&self.stores.conversations);
            let id = id.clone();
            persist("save conversation", move || conversations.append(&id, &exchange)).await;
        }

        turn.emit(TurnEvent::Final(FinalEvent {
            final_answer: final_text,
            data: Some(result),
            chart,
            clarification_needed: None,
            query_info: Some(QueryInfo {
                sql,
                tables_used,
                execution_time_ms: exec_ms,
                rows_returned,
            }),
        }))
        .await?;
        Ok(TurnStatus::Answered)
    }

    async fn finish_without_sql(
        &self,
        request: &TurnRequest,
        plan: &ModelResponse,
        started: Instant,
        turn: &Turn<'_>,
    ) -> Result<TurnStatus, Halt> {
        let clarification = prompts::needs_clarification(&plan.content);
        if clarification {
            self.log_turn(request, "", Vec::new(), started, false, 0).await;
        }
        turn.emit(TurnEvent::Final(FinalEvent {
            final_answer: plan.content.clone(),
            clarification_needed: clarification.then_some(true),
            ..FinalEvent::default()
        }))
        .await?;
        Ok(if clarification {
            TurnStatus::ClarificationNeeded
        } else {
            TurnStatus::DirectAnswer
        })
    }

    async fn complete(&self, messages: &[Message]) -> Result<ModelResponse> {
        bounded(
            "model completion",
            Duration::from_secs(self.pipeline.model_timeout_secs),
            self.provider.complete(messages, &self.generation),
        )
        .await?
    }

    /// The hard gate runs first; a refusal or a timeout is a failed attempt.
    async fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        if let SafetyDecision::Reject(reason) = self.validator.check_hard_gate(sql) {
            warn!("Refused statement: {}", sql);
            return Ok(QueryOutcome::Failed(reason));
        }
        match tokio::time::timeout(self.query_timeout(), self.executor.execute(sql)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let timeout = CollaboratorError::Timeout {
                    operation: "query execution",
                    secs: self.pipeline.query_timeout_secs,
                };
                warn!("{}", timeout);
                Ok(QueryOutcome::Failed(timeout.to_string()))
            }
        }
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.query_timeout_secs)
    }

    async fn log_turn(
        &self,
        request: &TurnRequest,
        sql: &str,
        tables: Vec<String>,
        started: Instant,
        success: bool,
        row_count: usize,
    ) {
        let entry = NewQueryLog {
            question: request.question.clone(),
            sql: sql.to_string(),
            tables,
            execution_time_ms: elapsed_ms(started),
            success,
            row_count,
            user_id: request.user_id.clone(),
        };
        let history = Arc::clone(&self.stores.history);
        persist("log query", move || history.log(entry).map(drop)).await;
    }

    async fn record_memory_usage(&self, ids: &[String], success: bool) {
        if ids.is_empty() {
            return;
        }
        let memory = Arc::clone(&self.stores.memory);
        let ids = ids.to_vec();
        persist("record memory usage", move || {
            for id in &ids {
                if !memory.record_usage(id, success)? {
                    debug!("Memory {} vanished before usage was recorded", id);
                }
            }
            Ok(())
        })
        .await;
    }
}

/// Run a store write on the blocking pool. A failed write is logged and the
/// turn carries on.
async fn persist<F>(operation: &'static str, write: F)
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Could not {}: {:#}", operation, e),
        Err(e) => warn!("Store task for {} failed: {}", operation, e),
    }
}

/// Await `fut` for at most `limit`.
async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        warn!("{} timed out after {}s", operation, limit.as_secs());
        anyhow::Error::from(CollaboratorError::Timeout {
            operation,
            secs: limit.as_secs(),
        })
    })
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}
