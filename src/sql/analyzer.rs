use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Structural facts about a SQL statement, derived without a parser.
///
/// Output is advisory: it feeds pattern learning and warnings, never
/// execution decisions.
pub trait SqlAnalyzer: Send + Sync {
    /// Table names referenced after `FROM` or `JOIN`, lowercased and sorted.
    fn tables(&self, sql: &str) -> Vec<String>;

    /// Column-like tokens used in projections, filters, grouping and ordering.
    fn columns(&self, sql: &str) -> Vec<String>;

    /// Human-readable warnings about risky query shapes.
    fn advisories(&self, sql: &str) -> Vec<String>;
}

pub const WARN_JOIN_FANOUT: &str =
    "Multiple joins detected without GROUP BY - may cause duplicate rows";
pub const WARN_NULL_AGGREGATE: &str = "Aggregations may need NULL handling with COALESCE()";
pub const WARN_NO_LIMIT: &str = "Query may benefit from LIMIT clause";

const COLUMN_STOPLIST: &[&str] = &[
    "select", "from", "where", "and", "or", "group", "by", "order", "having", "limit", "join",
    "on", "distinct", "*",
];

/// Regex heuristics over lowercased SQL text.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid analyzer regex"))
        }
    };
}

cached_regex!(table_ref_re, r"\b(?:from|join)\s+(\w+)");
cached_regex!(
    clause_column_re,
    r"\b(?:select|where|group\s+by|order\s+by|having)\s+([^\s,]+)"
);
cached_regex!(equality_column_re, r"(\w+)\s*=");
cached_regex!(join_re, r"\bjoin\b");
cached_regex!(group_by_re, r"\bgroup\s+by\b");
cached_regex!(aggregate_re, r"\b(?:sum|count|avg|min|max)\s*\(");
cached_regex!(null_guard_re, r"\b(?:coalesce|ifnull)\s*\(");
cached_regex!(limit_re, r"\blimit\b");

impl SqlAnalyzer for HeuristicAnalyzer {
    fn tables(&self, sql: &str) -> Vec<String> {
        let lower = sql.to_lowercase();
        let tables: BTreeSet<String> = table_ref_re()
            .captures_iter(&lower)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        tables.into_iter().collect()
    }

    fn columns(&self, sql: &str) -> Vec<String> {
        let lower = sql.to_lowercase();
        let mut columns = BTreeSet::new();
        for re in [clause_column_re(), equality_column_re()] {
            for caps in re.captures_iter(&lower) {
                if let Some(m) = caps.get(1) {
                    let token = m.as_str().trim_end_matches(';');
                    if !token.is_empty() && !COLUMN_STOPLIST.contains(&token) {
                        columns.insert(token.to_string());
                    }
                }
            }
        }
        columns.into_iter().collect()
    }

    fn advisories(&self, sql: &str) -> Vec<String> {
        let lower = sql.to_lowercase();
        let mut warnings = Vec::new();

        let join_count = join_re().find_iter(&lower).count();
        let has_group_by = group_by_re().is_match(&lower);
        let has_aggregate = aggregate_re().is_match(&lower);

        if join_count >= 2 && !has_group_by && !has_aggregate {
            warnings.push(WARN_JOIN_FANOUT.to_string());
        }
        if has_aggregate && !null_guard_re().is_match(&lower) {
            warnings.push(WARN_NULL_AGGREGATE.to_string());
        }
        if !limit_re().is_match(&lower) {
            warnings.push(WARN_NO_LIMIT.to_string());
        }
        warnings
    }
}
