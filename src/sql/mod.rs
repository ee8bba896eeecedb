//! Text-level SQL helpers: fenced-block extraction from model output and a
//! pluggable structural analyzer.
//!
//! Nothing here parses SQL. The [`SqlAnalyzer`] trait keeps the regex
//! heuristics behind one seam so a real parser can replace them later.

pub mod analyzer;

pub use analyzer::{HeuristicAnalyzer, SqlAnalyzer};

use regex::Regex;
use std::sync::OnceLock;

fn sql_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```sql\s*(.*?)```").expect("valid sql block regex"))
}

fn json_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("valid json block regex"))
}

/// The first non-empty ```sql fenced block, trimmed.
pub fn extract_sql_block(text: &str) -> Option<String> {
    sql_block_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The first ```json fenced block, falling back to the outermost `{...}` span.
pub fn extract_json_block(text: &str) -> Option<String> {
    if let Some(m) = json_block_re().captures(text).and_then(|c| c.get(1)) {
        return Some(m.as_str().trim().to_string());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}

/// Remove every ```json fenced block and trim the remainder.
pub fn strip_json_blocks(text: &str) -> String {
    json_block_re().replace_all(text, "").trim().to_string()
}
