//! Interactive REPL and one-shot question mode

pub mod formatting;

use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::agent::{create_provider, GenerationConfig};
use crate::config::AppConfig;
use crate::database::DuckDbDatabase;
use crate::orchestrator::{Orchestrator, TurnEvent, TurnRequest};
use crate::persistence::memory::{ListScope, NewMemory};
use crate::persistence::Stores;
use crate::types::MemoryType;

/// Sentinel returned by [`CliState::handle_line`] when the REPL should exit.
pub const QUIT: &str = "__QUIT__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    ConfigShow,
    NewConversation(Option<String>),
    SwitchConversation(String),
    ListConversations,
    ShowConversation,
    ClearConversation,
    MemoryList,
    MemoryAdd { pattern: String, correction: String },
    MemoryForget(String),
    Popular(Option<String>),
    Joins(Vec<String>),
    Feedback(String),
    Message(String),
    Empty,
}

pub fn parse_command(input: &str) -> Command {
    let line = input.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Command::Message(line.to_string());
    };

    let (cmd, args) = rest
        .split_once(char::is_whitespace)
        .map(|(c, a)| (c, a.trim()))
        .unwrap_or((rest, ""));
    let mut parts = args.split_whitespace();

    match cmd.to_lowercase().as_str() {
        "help" | "h" | "?" => Command::Help,
        "quit" | "q" | "exit" => Command::Quit,
        "config" => Command::ConfigShow,
        "new" => Command::NewConversation(parts.next().map(str::to_string)),
        "switch" => match parts.next() {
            Some(id) => Command::SwitchConversation(id.to_string()),
            None => Command::Help,
        },
        "conversations" => Command::ListConversations,
        "show" => Command::ShowConversation,
        "clear" => Command::ClearConversation,
        "memory" => {
            let (sub, sub_args) = args
                .split_once(char::is_whitespace)
                .map(|(s, a)| (s, a.trim()))
                .unwrap_or((args, ""));
            match sub {
                "list" | "" => Command::MemoryList,
                "add" => match sub_args.split_once('|') {
                    Some((pattern, correction))
                        if !pattern.trim().is_empty() && !correction.trim().is_empty() =>
                    {
                        Command::MemoryAdd {
                            pattern: pattern.trim().to_string(),
                            correction: correction.trim().to_string(),
                        }
                    }
                    _ => Command::Help,
                },
                "forget" | "delete" if !sub_args.is_empty() => {
                    Command::MemoryForget(sub_args.to_string())
                }
                _ => Command::Help,
            }
        }
        "popular" => Command::Popular(parts.next().map(str::to_string)),
        "joins" => {
            let tables: Vec<String> = parts.map(str::to_string).collect();
            if tables.is_empty() {
                Command::Help
            } else {
                Command::Joins(tables)
            }
        }
        "feedback" if !args.is_empty() => Command::Feedback(args.to_string()),
        _ => Command::Help,
    }
}

/// Question and tables of the most recent answered turn, kept for `/feedback`.
#[derive(Debug, Clone)]
struct LastTurn {
    question: String,
    tables: Vec<String>,
}

pub struct CliState {
    pub config: AppConfig,
    pub conversation_id: String,
    pub user_id: Option<String>,
    orchestrator: Arc<Orchestrator>,
    last_turn: Option<LastTurn>,
}

/// Wire the configured database, model provider and stores into an
/// orchestrator.
pub fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let database = Arc::new(
        DuckDbDatabase::open(&config.database.path).context("opening analytics database")?,
    );
    let provider = create_provider(&config.model).context("creating model provider")?;
    let stores =
        Stores::open(&config.storage.data_dir, &config.pipeline).context("opening stores")?;

    let generation = GenerationConfig {
        temperature: Some(config.model.temperature),
        max_tokens: config.model.max_tokens.or(GenerationConfig::default().max_tokens),
        stop_sequences: None,
    };

    Ok(
        Orchestrator::new(provider, database.clone(), database, stores)
            .with_pipeline(config.pipeline.clone())
            .with_generation(generation),
    )
}

fn fresh_conversation_id() -> String {
    format!("conv-{}", chrono::Utc::now().timestamp_millis())
}

impl CliState {
    /// Initialize from loaded config (AppConfig::load)
    pub fn initialize() -> Result<Self> {
        let config = AppConfig::load()?;
        Self::new_with_config(config)
    }

    pub fn new_with_config(config: AppConfig) -> Result<Self> {
        let orchestrator = build_orchestrator(&config)?;
        Ok(Self::with_orchestrator(config, Arc::new(orchestrator)))
    }

    pub fn with_orchestrator(config: AppConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            conversation_id: fresh_conversation_id(),
            user_id: None,
            orchestrator,
            last_turn: None,
        }
    }

    pub fn for_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id.filter(|u| !u.trim().is_empty());
        self
    }

    fn stores(&self) -> &Stores {
        self.orchestrator.stores()
    }

    /// Handle a single line of input. Returns an optional output string.
    pub async fn handle_line(&mut self, line: &str) -> Result<Option<String>> {
        match parse_command(line) {
            Command::Empty => Ok(None),
            Command::Help => Ok(Some(formatting::render_help())),
            Command::Quit => Ok(Some(QUIT.to_string())),
            Command::ConfigShow => Ok(Some(formatting::render_config(&self.config.summary()))),
            Command::NewConversation(id) => {
                self.conversation_id = id.unwrap_or_else(fresh_conversation_id);
                self.last_turn = None;
                Ok(Some(format!(
                    "Started new conversation '{}'.",
                    self.conversation_id
                )))
            }
            Command::SwitchConversation(id) => {
                let count = self.stores().conversations.get(&id)?.len();
                self.conversation_id = id;
                self.last_turn = None;
                Ok(Some(format!(
                    "Switched to conversation '{}' ({} messages).",
                    self.conversation_id, count
                )))
            }
            Command::ListConversations => {
                let conversations = self.stores().conversations.list()?;
                if conversations.is_empty() {
                    return Ok(Some("No conversations yet.".to_string()));
                }
                Ok(Some(formatting::render_conversations(&conversations)))
            }
            Command::ShowConversation => {
                let messages = self.stores().conversations.get(&self.conversation_id)?;
                if messages.is_empty() {
                    return Ok(Some("No messages in this conversation.".to_string()));
                }
                Ok(Some(formatting::render_conversation(&messages)))
            }
            Command::ClearConversation => {
                self.stores().conversations.clear(&self.conversation_id)?;
                Ok(Some(format!(
                    "Cleared conversation '{}'.",
                    self.conversation_id
                )))
            }
            Command::MemoryList => {
                let mut memories = self.stores().memory.list(ListScope::Global)?;
                if let Some(user_id) = &self.user_id {
                    memories.extend(self.stores().memory.list(ListScope::User(user_id))?);
                }
                if memories.is_empty() {
                    return Ok(Some("No corrections stored.".to_string()));
                }
                Ok(Some(formatting::render_memories(&memories)))
            }
            Command::MemoryAdd {
                pattern,
                correction,
            } => {
                let new = NewMemory::new(pattern, correction, MemoryType::General);
                let memory =
                    self.stores()
                        .memory
                        .add_scoped(new, self.scope(), self.user_id.as_deref())?;
                Ok(Some(format!(
                    "Saved {} correction {}.",
                    memory.scope.label(),
                    memory.id
                )))
            }
            Command::MemoryForget(id) => {
                if self.stores().memory.delete(&id, self.user_id.as_deref())? {
                    Ok(Some(format!("Deleted correction {}.", id)))
                } else {
                    Ok(Some(format!("No correction with id {}.", id)))
                }
            }
            Command::Popular(table) => {
                let popular = self.stores().history.popular_queries(table.as_deref(), 10);
                if popular.is_empty() {
                    return Ok(Some("No successful questions recorded yet.".to_string()));
                }
                Ok(Some(formatting::render_popular(&popular)))
            }
            Command::Joins(tables) => {
                let suggestions = self.stores().history.join_suggestions(&tables[..]);
                if suggestions.is_empty() {
                    return Ok(Some(format!(
                        "No join patterns known for {}.",
                        tables.join(", ")
                    )));
                }
                Ok(Some(formatting::render_joins(&suggestions)))
            }
            Command::Feedback(correction) => {
                let Some(last) = &self.last_turn else {
                    return Ok(Some("Ask a question before giving feedback.".to_string()));
                };
                let memory = self.orchestrator.record_feedback(
                    &last.question,
                    &correction,
                    &last.tables,
                    self.scope(),
                    self.user_id.as_deref(),
                )?;
                Ok(Some(format!("Thanks, saved correction {}.", memory.id)))
            }
            Command::Message(question) => {
                let mut buffer = Vec::new();
                self.ask(&question, &mut buffer).await?;
                Ok(Some(String::from_utf8_lossy(&buffer).into_owned()))
            }
        }
    }

    fn scope(&self) -> &'static str {
        if self.user_id.is_some() {
            "user"
        } else {
            "global"
        }
    }

    /// Run one question through the orchestrator, writing progress lines and
    /// the final answer to `out` as events arrive.
    pub async fn ask<W>(&mut self, question: &str, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut request = TurnRequest::new(question).in_conversation(&self.conversation_id);
        if let Some(user_id) = &self.user_id {
            request = request.for_user(user_id);
        }

        let events = self.orchestrator.stream(request);
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            match &event {
                TurnEvent::Final(done) => {
                    self.last_turn = Some(LastTurn {
                        question: question.to_string(),
                        tables: done
                            .query_info
                            .as_ref()
                            .map(|i| i.tables_used.clone())
                            .unwrap_or_default(),
                    });
                    out.write_all(formatting::render_final(done).as_bytes())
                        .await?;
                    out.write_all(b"\n").await?;
                }
                other => {
                    if let Some(line) = formatting::render_event(other) {
                        out.write_all(line.as_bytes()).await?;
                        out.write_all(b"\n").await?;
                    }
                }
            }
            out.flush().await?;
        }
        Ok(())
    }

    pub async fn run_repl(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        stdout
            .write_all(formatting::render_config(&self.config.summary()).as_bytes())
            .await?;
        stdout
            .write_all(
                format!(
                    "\nConversation '{}'. Type /help for commands.\n",
                    self.conversation_id
                )
                .as_bytes(),
            )
            .await?;

        let stdin = BufReader::new(io::stdin());
        let mut lines = stdin.lines();
        loop {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };

            if let Command::Message(question) = parse_command(&line) {
                if let Err(e) = self.ask(&question, &mut stdout).await {
                    stdout.write_all(format!("Error: {:#}\n", e).as_bytes()).await?;
                }
                continue;
            }

            match self.handle_line(&line).await {
                Ok(Some(output)) if output == QUIT => break,
                Ok(Some(output)) => {
                    stdout.write_all(output.as_bytes()).await?;
                    if !output.ends_with('\n') {
                        stdout.write_all(b"\n").await?;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    stdout.write_all(format!("Error: {:#}\n", e).as_bytes()).await?;
                }
            }
        }
        stdout.flush().await?;
        Ok(())
    }
}
