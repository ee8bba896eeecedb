//! Progress events emitted during a turn.
//!
//! Serialized as JSON records tagged `type` (`status`, `step`, `final`); step
//! records carry a second tag, `step`.

use serde::{Deserialize, Serialize};

use super::chart::Chart;
use crate::types::QueryResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Status { message: String },
    Step(StepEvent),
    Final(FinalEvent),
}

impl TurnEvent {
    pub fn status(message: impl Into<String>) -> Self {
        TurnEvent::Status {
            message: message.into(),
        }
    }

    pub fn as_step(&self) -> Option<&StepEvent> {
        match self {
            TurnEvent::Step(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_final(&self) -> Option<&FinalEvent> {
        match self {
            TurnEvent::Final(done) => Some(done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepEvent {
    Plan {
        reasoning: Option<String>,
        content: String,
    },
    Warning {
        message: String,
    },
    Execution {
        sql: String,
        attempt: usize,
    },
    Error {
        message: String,
    },
    RetryPlan {
        reasoning: Option<String>,
        content: String,
    },
    Success {
        rows_returned: usize,
    },
    Analysis {
        reasoning: Option<String>,
        content: String,
    },
}

/// Discriminant of [`StepEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Plan,
    Warning,
    Execution,
    Error,
    RetryPlan,
    Success,
    Analysis,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Plan => "plan",
            StepKind::Warning => "warning",
            StepKind::Execution => "execution",
            StepKind::Error => "error",
            StepKind::RetryPlan => "retry_plan",
            StepKind::Success => "success",
            StepKind::Analysis => "analysis",
        }
    }
}

impl StepEvent {
    pub fn kind(&self) -> StepKind {
        match self {
            StepEvent::Plan { .. } => StepKind::Plan,
            StepEvent::Warning { .. } => StepKind::Warning,
            StepEvent::Execution { .. } => StepKind::Execution,
            StepEvent::Error { .. } => StepKind::Error,
            StepEvent::RetryPlan { .. } => StepKind::RetryPlan,
            StepEvent::Success { .. } => StepKind::Success,
            StepEvent::Analysis { .. } => StepKind::Analysis,
        }
    }
}

/// Terminal record of a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalEvent {
    pub final_answer: String,
    pub data: Option<QueryResult>,
    pub chart: Option<Chart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_needed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_info: Option<QueryInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub sql: String,
    pub tables_used: Vec<String>,
    pub execution_time_ms: u64,
    pub rows_returned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_events_carry_both_tags() {
        let event = TurnEvent::Step(StepEvent::Execution {
            sql: "SELECT 1".to_string(),
            attempt: 2,
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "step", "step": "execution", "sql": "SELECT 1", "attempt": 2})
        );
        let back: TurnEvent = serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn final_event_omits_absent_optionals() {
        let event = TurnEvent::Final(FinalEvent {
            final_answer: "Which year?".to_string(),
            clarification_needed: Some(true),
            ..FinalEvent::default()
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "final",
                "final_answer": "Which year?",
                "data": null,
                "chart": null,
                "clarification_needed": true
            })
        );
    }

    #[test]
    fn step_kinds_use_wire_names() {
        let step = StepEvent::RetryPlan {
            reasoning: None,
            content: String::new(),
        };
        assert_eq!(step.kind().as_str(), "retry_plan");
    }
}
