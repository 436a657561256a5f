//! Combined batch payloads and per-task result extraction.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use fleet_core::parse_structured;
use serde::Serialize;
use serde_json::{Map, Value};

/// Header that starts each task's section in a combined payload.
pub const TASK_HEADER: &str = "### TASK ";

/// Error recorded for ids the executor did not answer for.
pub const MISSING_RESULT: &str = "missing from combined result";

/// One task waiting in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchTask {
    pub id: String,
    pub name: String,
    pub task_type: String,
    pub tenant: Option<String>,
    pub payload: Value,
}

/// Result for one task of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    Success { output: Value },
    Failure { error: String, raw: Option<String> },
}

impl TaskOutcome {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    fn failure(error: impl Into<String>, raw: Option<&str>) -> Self {
        Self::Failure {
            error: error.into(),
            raw: raw.map(ToOwned::to_owned),
        }
    }
}

/// Build the single payload handed to the executor for a batch.
pub fn build_combined_payload(task_type: &str, tenant: Option<&str>, tasks: &[BatchTask]) -> String {
    let mut out = String::new();
    let _ = write!(out, "Process the following {} \"{task_type}\" task(s)", tasks.len());
    if let Some(tenant) = tenant {
        let _ = write!(out, " for tenant \"{tenant}\"");
    }
    out.push_str(". Handle each task independently.\n\n");

    for task in tasks {
        let _ = writeln!(out, "{TASK_HEADER}{}", task.id);
        let _ = writeln!(out, "Name: {}", task.name);
        let body = serde_json::to_string_pretty(&task.payload).unwrap_or_else(|_| "null".into());
        let _ = writeln!(out, "{body}\n");
    }

    out.push_str(
        "Respond with one JSON object and nothing else, of the form:\n\
         {\"results\": {\"<task id>\": {\"status\": \"success\", \"output\": <any>}}}\n\
         Use {\"status\": \"failure\", \"error\": \"<reason>\"} for a task that could not be completed.\n\
         Include every task id listed above.\n",
    );
    out
}

/// Task ids named by the headers of a combined payload, in order.
pub fn task_ids_in_payload(payload: &str) -> Vec<&str> {
    payload
        .lines()
        .filter_map(|line| line.strip_prefix(TASK_HEADER))
        .map(str::trim)
        .collect()
}

/// Map every id in `ids` to an outcome extracted from `raw`.
pub fn parse_combined_result(raw: &str, ids: &[String]) -> BTreeMap<String, TaskOutcome> {
    let fail_all = |error: String| -> BTreeMap<String, TaskOutcome> {
        ids.iter()
            .map(|id| (id.clone(), TaskOutcome::failure(error.clone(), Some(raw))))
            .collect()
    };

    let value = match parse_structured(raw) {
        Ok(value) => value,
        Err(e) => return fail_all(e.to_string()),
    };
    let Some(results) = results_by_id(value) else {
        return fail_all("combined result has no per-task results".to_string());
    };

    ids.iter()
        .map(|id| {
            let outcome = match results.get(id) {
                None => TaskOutcome::failure(MISSING_RESULT, Some(raw)),
                Some(entry) => entry_outcome(entry, raw),
            };
            (id.clone(), outcome)
        })
        .collect()
}

/// Accepts `{"results": {id: ..}}`, `{"results": [{"id": ..}]}` or a bare map.
fn results_by_id(value: Value) -> Option<Map<String, Value>> {
    let results = match value {
        Value::Object(mut obj) => match obj.remove("results") {
            Some(inner) => inner,
            None => Value::Object(obj),
        },
        other => other,
    };
    match results {
        Value::Object(map) => Some(map),
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?.to_string();
                    Some((id, item))
                })
                .collect(),
        ),
        _ => None,
    }
}

fn entry_outcome(entry: &Value, raw: &str) -> TaskOutcome {
    let status = entry.get("status").and_then(Value::as_str).unwrap_or("success");
    match status {
        "failure" | "failed" | "error" => {
            let error = entry
                .get("error")
                .map_or_else(|| "task reported failure".to_string(), |e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            TaskOutcome::failure(error, Some(raw))
        }
        _ => TaskOutcome::Success {
            output: entry.get("output").cloned().unwrap_or_else(|| entry.clone()),
        },
    }
}
