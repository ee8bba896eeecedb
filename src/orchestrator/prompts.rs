//! Prompt text for planning, repair and analysis.

use crate::types::QueryResult;

/// Answer used when every execution attempt failed.
pub const FAILURE_MESSAGE: &str = "I failed to execute a valid query after multiple attempts.";

/// Phrases that mark a non-SQL reply as a request for clarification.
pub const CLARIFICATION_KEYWORDS: &[&str] = &["clarify", "specify", "which", "what do you mean"];

const SAMPLE_ROWS: usize = 5;

pub fn needs_clarification(content: &str) -> bool {
    let lower = content.to_lowercase();
    CLARIFICATION_KEYWORDS.iter().any(|k| lower.contains(k))
}

pub fn system_prompt(context: &str) -> String {
    format!(
        r#"You are an expert Data Agent.
Your goal is to answer user questions by querying a SQL database.

### Database Context
{context}

### Rules
1. Output ONLY standard SQLite SQL inside ```sql``` code blocks.
2. Do not use Markdown formatting outside the code block for the SQL.
3. If the question cannot be answered with the data, say "I cannot answer this with the available data."
4. Use 'LIKE' for loose string matching (e.g. agency names).
5. Always LIMIT results to 100 unless specified otherwise.
6. Check the 'Column Insights' section above. Use the listed values for exact matches in WHERE clauses and the sample values to understand data formats.
7. If a question is ambiguous (e.g., missing date range), apply sensible defaults and mention them.
8. Follow any learned corrections listed above.

### Conversation Handling
- This may be a follow-up question. Consider previous context if provided.
- If the user refers to "that", "it" or "the previous result" and the reference is unclear, ask which one they mean."#
    )
}

pub fn retry_prompt(error: &str) -> String {
    format!(
        r#"The query failed with error: {error}.

Please correct the SQL. Consider:
- Checking table and column names
- Ensuring proper syntax for SQLite
- Handling NULL values appropriately
- Verifying JOIN conditions

Output ONLY the fixed SQL inside ```sql```."#
    )
}

/// Assistant turn recorded before the analysis request.
pub fn executed_note(sql: &str) -> String {
    format!("I executed: ```sql\n{}\n```", sql)
}

pub fn analysis_prompt(result: &QueryResult) -> String {
    let sample: Vec<_> = result.data.iter().take(SAMPLE_ROWS).collect();
    let sample = serde_json::to_string(&sample).unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"The query executed successfully.
Rows returned: {rows}
Columns: {columns:?}
Sample Data: {sample}

Task:
1. Provide a concise answer to the original question based on this data.
2. Explain any assumptions made (e.g., date ranges, filters).
3. Determine if this data should be visualized.
4. If yes, output a JSON object inside ```json```:
   {{ "chart_type": "bar", "x_axis": "column_name", "y_axis": "column_name", "title": "Chart Title" }}
   - If no chart is suitable, output {{ "chart_type": null }}"#,
        rows = result.row_count(),
        columns = result.columns,
    )
}

/// What a conversation remembers about a completed turn.
pub fn conversation_summary(sql: &str, answer: &str) -> String {
    format!("SQL: {}\n\nResult: {}", sql, answer)
}
