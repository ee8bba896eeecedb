use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sql::extract_json_block;
use crate::types::QueryResult;

/// Chart request as written by the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    #[serde(default)]
    pub chart_type: Option<String>,
    #[serde(default)]
    pub x_axis: Option<String>,
    #[serde(default)]
    pub y_axis: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Declarative chart bound to result data. Rendering is left to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub chart_type: String,
    pub title: String,
    pub x_axis: String,
    pub y_axis: String,
    pub labels: Vec<Value>,
    pub values: Vec<Value>,
}

impl ChartSpec {
    /// Find and parse the chart JSON in an analysis response.
    pub fn parse(text: &str) -> Option<Self> {
        let block = extract_json_block(text)?;
        serde_json::from_str(&block).ok()
    }

    /// Bind the chart request to `result`. `None` when no chart was requested or either
    /// axis is not a result column.
    pub fn materialize(&self, result: &QueryResult) -> Option<Chart> {
        let chart_type = self.chart_type.as_deref().filter(|t| !t.is_empty())?;
        let x_axis = self.x_axis.as_deref()?;
        let y_axis = self.y_axis.as_deref()?;
        if !result.has_column(x_axis) || !result.has_column(y_axis) {
            return None;
        }

        let column = |name: &str| -> Vec<Value> {
            result
                .data
                .iter()
                .map(|row| row.get(name).cloned().unwrap_or(Value::Null))
                .collect()
        };

        Some(Chart {
            chart_type: chart_type.to_string(),
            title: self.title.clone().unwrap_or_else(|| y_axis.to_string()),
            x_axis: x_axis.to_string(),
            y_axis: y_axis.to_string(),
            labels: column(x_axis),
            values: column(y_axis),
        })
    }
}
