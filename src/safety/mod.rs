//! Pre-flight checks on generated SQL.
//!
//! The hard gate refuses statements that would modify data. Advisories come
//! from the pluggable [`SqlAnalyzer`] and never block execution.

use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::sql::{HeuristicAnalyzer, SqlAnalyzer};

/// Statements containing any of these words are never executed.
pub const DESTRUCTIVE_KEYWORDS: &[&str] =
    &["DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE"];

/// Error text returned for a refused statement.
pub const WRITE_REFUSED: &str = "Write operations are not allowed in this POC.";

fn destructive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"(?i)\b(?:{})\b", DESTRUCTIVE_KEYWORDS.join("|"));
        Regex::new(&pattern).expect("valid destructive keyword regex")
    })
}

/// Whole-word, case-insensitive match against [`DESTRUCTIVE_KEYWORDS`].
pub fn contains_destructive_keyword(sql: &str) -> bool {
    destructive_re().is_match(sql)
}

/// Outcome of the hard gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Reject(String),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

#[derive(Clone)]
pub struct SafetyValidator {
    analyzer: Arc<dyn SqlAnalyzer>,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicAnalyzer::new()))
    }
}

impl SafetyValidator {
    pub fn new(analyzer: Arc<dyn SqlAnalyzer>) -> Self {
        Self { analyzer }
    }

    pub fn analyzer(&self) -> &Arc<dyn SqlAnalyzer> {
        &self.analyzer
    }

    pub fn check_hard_gate(&self, sql: &str) -> SafetyDecision {
        if contains_destructive_keyword(sql) {
            SafetyDecision::Reject(WRITE_REFUSED.to_string())
        } else {
            SafetyDecision::Allow
        }
    }

    /// Warnings about risky query shapes. Empty means the query is clean.
    pub fn advisories(&self, sql: &str) -> Vec<String> {
        self.analyzer.advisories(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_each_destructive_keyword_in_any_case() {
        let validator = SafetyValidator::default();
        for sql in [
            "DROP TABLE payroll",
            "delete from payroll",
            "Update payroll set x = 1",
            "insert into payroll values (1)",
            "ALTER TABLE payroll ADD c INT",
            "truncate payroll",
        ] {
            assert_eq!(
                validator.check_hard_gate(sql),
                SafetyDecision::Reject(WRITE_REFUSED.to_string()),
                "{sql}"
            );
        }
    }

    #[test]
    fn keywords_inside_identifiers_are_allowed() {
        let validator = SafetyValidator::default();
        let sql = "SELECT updated_at, dropped_count FROM inserts_log LIMIT 5";
        assert!(validator.check_hard_gate(sql).is_allowed());
    }

    #[test]
    fn advisories_never_reject() {
        let validator = SafetyValidator::default();
        let sql = "SELECT * FROM a JOIN b ON a.id = b.id JOIN c ON c.id = b.id";
        assert!(validator.check_hard_gate(sql).is_allowed());
        assert_eq!(validator.advisories(sql).len(), 2);
    }
}
