//! Terminal formatting utilities using termimad for rich markdown rendering

use serde_json::Value;
use std::cell::Cell;
use termimad::crossterm::style::{Attribute, Color};
use termimad::*;

use crate::orchestrator::{FinalEvent, StepEvent, TurnEvent};
use crate::types::{
    ConversationSummary, JoinSuggestion, Memory, Message, PopularQuery, QueryResult,
};

/// Rows printed before a result table is cut off.
pub const MAX_TABLE_ROWS: usize = 20;

const MAX_CELL_CHARS: usize = 40;

thread_local! {
    /// Override for terminal detection in tests
    static FORCE_PLAIN_TEXT: Cell<bool> = const { Cell::new(false) };
}

/// Force plain text output (for testing)
pub fn set_plain_text_mode(enabled: bool) {
    FORCE_PLAIN_TEXT.with(|f| f.set(enabled));
}

pub fn create_skin() -> MadSkin {
    let mut skin = MadSkin::default();

    let mut header_style = CompoundStyle::with_fg(Color::Cyan);
    header_style.add_attr(Attribute::Bold);
    skin.headers[0].compound_style = header_style;
    skin.headers[1].compound_style = CompoundStyle::with_fg(Color::Cyan);

    skin.bold.set_fg(Color::White);
    skin.italic.set_fg(Color::Grey);
    skin.inline_code.set_fg(Color::Yellow);
    skin.code_block.set_fg(Color::Yellow);
    skin.bullet = StyledChar::from_fg_char(Color::Green, '▸');
    skin.paragraph.compound_style = CompoundStyle::with_fg(Color::White);
    skin.quote_mark.set_fg(Color::DarkCyan);
    skin.quote_mark.set_char('┃');

    skin
}

/// Check if we're in a TTY (terminal) or if output is piped/redirected
pub fn is_terminal() -> bool {
    if FORCE_PLAIN_TEXT.with(|f| f.get()) {
        return false;
    }
    terminal_size::terminal_size().is_some()
}

fn terminal_width() -> usize {
    terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(80)
}

/// Render markdown text with the query-pilot skin.
/// Falls back to plain text if not in a terminal
pub fn render_markdown(text: &str) -> String {
    if !is_terminal() {
        return text.to_string();
    }
    create_skin().text(text, Some(terminal_width())).to_string()
}

pub fn render_help() -> String {
    let help_text = r#"
# Query Pilot Commands

## Conversations
- **`/new [id]`** — Start a new conversation
- **`/switch <id>`** — Continue an existing conversation
- **`/conversations`** — List stored conversations
- **`/show`** — Show the messages of the current conversation
- **`/clear`** — Clear the current conversation

## Learned Corrections
- **`/memory list`** — List stored corrections
- **`/memory add <pattern> | <correction>`** — Teach a new correction
- **`/memory forget <id>`** — Delete a correction
- **`/feedback <correction>`** — Attach a correction to the last question

## Query History
- **`/popular [table]`** — Most frequent successful questions
- **`/joins <table> <table> ...`** — Known join patterns for a set of tables

## General
- **`/config`** — Display current configuration
- **`/help`** — Show this help message
- **`/quit`** or **`/exit`** — Exit the REPL

---

**Usage:** Type a question about your data. Use `/` prefix for commands.
"#;

    render_markdown(help_text)
}

pub fn render_config(config_text: &str) -> String {
    if !is_terminal() {
        return config_text.to_string();
    }
    let formatted = format!("# Current Configuration\n\n```\n{}\n```", config_text);
    render_markdown(&formatted)
}

/// Render a formatted list with custom bullet styling
pub fn render_list(title: &str, items: Vec<String>) -> String {
    if !is_terminal() {
        let mut output = format!("{}:\n", title);
        for item in items {
            output.push_str(&format!("  - {}\n", item));
        }
        return output;
    }

    let mut formatted = format!("## {}\n\n", title);
    for item in items {
        formatted.push_str(&format!("- {}\n", item));
    }
    render_markdown(&formatted)
}

/// Conversation messages, oldest first
pub fn render_conversation(messages: &[Message]) -> String {
    if !is_terminal() {
        let mut output = String::new();
        for message in messages {
            output.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
        }
        return output;
    }

    let mut formatted = String::from("# Conversation\n\n");
    for message in messages {
        formatted.push_str(&format!(
            "**{}:**\n{}\n\n---\n\n",
            message.role.as_str(),
            message.content
        ));
    }
    render_markdown(&formatted)
}

pub fn render_conversations(conversations: &[ConversationSummary]) -> String {
    let items = conversations
        .iter()
        .map(|c| {
            format!(
                "{} ({} messages, {}) {}",
                c.id,
                c.message_count,
                c.last_updated.format("%Y-%m-%d %H:%M"),
                c.title
            )
        })
        .collect();
    render_list("Conversations (most recent first)", items)
}

pub fn render_memories(memories: &[Memory]) -> String {
    let items = memories
        .iter()
        .map(|m| {
            let mut line = format!(
                "[{}] {} => {} ({}, {}, used {}x",
                m.id,
                m.pattern,
                m.correction,
                m.memory_type.as_str(),
                m.scope.label(),
                m.use_count
            );
            if m.use_count > 0 {
                line.push_str(&format!(", {} ok", m.success_count));
            }
            line.push(')');
            line
        })
        .collect();
    render_list("Learned corrections", items)
}

pub fn render_popular(queries: &[PopularQuery]) -> String {
    let items = queries
        .iter()
        .map(|q| format!("{}x  {}  `{}`", q.count, q.example_question, q.example_sql))
        .collect();
    render_list("Popular questions", items)
}

pub fn render_joins(suggestions: &[JoinSuggestion]) -> String {
    let items = suggestions
        .iter()
        .map(|s| {
            format!(
                "{} [{:?}, used {}x]  `{}`",
                s.tables.join(" + "),
                s.confidence,
                s.times_used,
                s.example_sql
            )
        })
        .collect();
    render_list("Join patterns", items)
}

/// One-line progress rendering for a streamed event. The final event is
/// rendered separately by [`render_final`].
pub fn render_event(event: &TurnEvent) -> Option<String> {
    match event {
        TurnEvent::Status { message } => Some(format!("… {}", message)),
        TurnEvent::Step(step) => match step {
            StepEvent::Plan { .. } | StepEvent::RetryPlan { .. } | StepEvent::Analysis { .. } => {
                None
            }
            StepEvent::Warning { message } => Some(format!("⚠ {}", message)),
            StepEvent::Execution { sql, attempt } => {
                Some(format!("▶ attempt {}: {}", attempt, one_line(sql)))
            }
            StepEvent::Error { message } => Some(format!("✗ {}", message)),
            StepEvent::Success { rows_returned } => {
                Some(format!("✓ {} row(s) returned", rows_returned))
            }
        },
        TurnEvent::Final(_) => None,
    }
}

/// The answer, a preview of the rows and the query that produced them.
pub fn render_final(event: &FinalEvent) -> String {
    let mut markdown = format!("{}\n", event.final_answer.trim());

    if let Some(data) = &event.data {
        if !data.columns.is_empty() {
            markdown.push('\n');
            markdown.push_str(&result_table(data, MAX_TABLE_ROWS));
        }
    }

    if let Some(chart) = &event.chart {
        markdown.push_str(&format!(
            "\n*Chart:* {} of `{}` by `{}` ({} points)\n",
            chart.chart_type,
            chart.y_axis,
            chart.x_axis,
            chart.labels.len()
        ));
    }

    if let Some(info) = &event.query_info {
        markdown.push_str(&format!(
            "\n```sql\n{}\n```\n*{} row(s) in {} ms; tables: {}*\n",
            info.sql,
            info.rows_returned,
            info.execution_time_ms,
            if info.tables_used.is_empty() {
                "-".to_string()
            } else {
                info.tables_used.join(", ")
            }
        ));
    }

    render_markdown(&markdown)
}

/// Markdown table of the first `max_rows` rows.
pub fn result_table(result: &QueryResult, max_rows: usize) -> String {
    let mut table = format!("| {} |\n", result.columns.join(" | "));
    table.push_str(&format!(
        "|{}|\n",
        result.columns.iter().map(|_| "---").collect::<Vec<_>>().join("|")
    ));
    for row in result.data.iter().take(max_rows) {
        let cells: Vec<String> = result
            .columns
            .iter()
            .map(|c| cell(row.get(c).unwrap_or(&Value::Null)))
            .collect();
        table.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    if result.row_count() > max_rows {
        table.push_str(&format!(
            "\n*... {} more row(s)*\n",
            result.row_count() - max_rows
        ));
    }
    table
}

fn cell(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let text = text.replace('|', "\\|");
    if text.chars().count() > MAX_CELL_CHARS {
        let cut: String = text.chars().take(MAX_CELL_CHARS - 1).collect();
        format!("{}…", cut)
    } else {
        text
    }
}

fn one_line(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
