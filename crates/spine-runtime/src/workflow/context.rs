//! Workflow context: step outputs keyed by step name
//!
//! Read-mostly; step K can read any output of its ancestors. Outputs are
//! small metadata (row counts, capture ids) — bulk data flows through the
//! database.

use std::collections::HashMap;

use serde_json::Value;

/// Accumulated outputs of completed steps plus the run parameters
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    params: Value,
    outputs: HashMap<String, Value>,
}

impl WorkflowContext {
    pub fn new(params: Value) -> Self {
        Self {
            params,
            outputs: HashMap::new(),
        }
    }

    /// Run-level parameters
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Output of an ancestor step
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    /// Convenience: a field of an ancestor's output
    pub fn output_field(&self, step: &str, field: &str) -> Option<&Value> {
        self.outputs.get(step).and_then(|v| v.get(field))
    }

    pub(crate) fn record(&mut self, step: &str, output: Value) {
        self.outputs.insert(step.to_string(), output);
    }

    pub fn completed_steps(&self) -> impl Iterator<Item = &String> {
        self.outputs.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_access() {
        let mut ctx = WorkflowContext::new(json!({ "week_ending": "2025-12-19" }));
        ctx.record("ingest", json!({ "records": 42 }));

        assert_eq!(ctx.output("ingest").unwrap()["records"], json!(42));
        assert_eq!(ctx.output_field("ingest", "records"), Some(&json!(42)));
        assert!(ctx.output("missing").is_none());
        assert_eq!(ctx.params()["week_ending"], json!("2025-12-19"));
    }
}
