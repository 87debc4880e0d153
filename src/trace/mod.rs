//! Execution traces.
//!
//! A [`Trace`] is the durable record of one sandboxed execution: the job
//! identity, the execution result (with bounded output snippets) and the
//! tool-call events the agent printed on stdout. Traces are the unit
//! exchanged between execution and grading.

mod writer;

pub use writer::TraceWriter;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::sandbox::{ExecutionResult, IsolationInfo};

/// Current trace schema version.
pub const TRACE_SCHEMA_VERSION: u64 = 1;

/// Maximum number of characters kept from stdout/stderr.
pub const SNIPPET_CHARS: usize = 4000;

/// Marker a stdout line must contain to be considered a tool-call record.
const TOOL_CALLS_MARKER: &str = "\"tool_calls\"";

/// One tool invocation reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub result: Value,
}

impl ToolCallEvent {
    /// Creates a new tool call event.
    pub fn new(name: impl Into<String>, args: Value, result: Value) -> Self {
        Self {
            name: name.into(),
            args,
            result,
        }
    }

    /// Builds an event from a JSON object entry; missing fields default to
    /// empty values.
    fn from_value(entry: &Value) -> Option<Self> {
        let object = entry.as_object()?;
        let name = match object.get("name") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Some(Self {
            name,
            args: object.get("args").cloned().unwrap_or(Value::Null),
            result: object.get("result").cloned().unwrap_or(Value::Null),
        })
    }
}

/// One entry of a `tool_calls` array. Entries that are not objects are kept
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolCall {
    Event(ToolCallEvent),
    Other(Value),
}

impl ToolCall {
    fn from_value(entry: &Value) -> Self {
        ToolCallEvent::from_value(entry)
            .map(ToolCall::Event)
            .unwrap_or_else(|| ToolCall::Other(entry.clone()))
    }

    /// Tool name, if the entry was a structured call.
    pub fn name(&self) -> Option<&str> {
        match self {
            ToolCall::Event(event) => Some(event.name.as_str()),
            ToolCall::Other(_) => None,
        }
    }
}

/// Persisted record of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub schema_version: u64,
    pub job_id: String,
    pub archive_path: PathBuf,
    pub command: String,
    /// Isolation details; absent for unconfined execution.
    pub isolation: Option<IsolationInfo>,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub stdout_snippet: String,
    pub stderr_snippet: String,
    pub tool_calls: Vec<ToolCall>,
    pub workdir: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Failure that prevented execution (e.g. extraction failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trace {
    /// Builds a trace from an execution result, parsing tool calls from the
    /// full stdout before the snippets are truncated.
    pub fn from_execution(
        job_id: impl Into<String>,
        archive_path: impl Into<PathBuf>,
        command: impl Into<String>,
        result: &ExecutionResult,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            schema_version: TRACE_SCHEMA_VERSION,
            job_id: job_id.into(),
            archive_path: archive_path.into(),
            command: command.into(),
            isolation: result.isolation.clone(),
            exit_code: result.exit_code,
            duration_seconds: result.duration_seconds,
            stdout_snippet: truncate_chars(&result.stdout, SNIPPET_CHARS),
            stderr_snippet: truncate_chars(&result.stderr, SNIPPET_CHARS),
            tool_calls: parse_tool_calls(&result.stdout),
            workdir: workdir.into(),
            created_at: Utc::now(),
            error: None,
        }
    }

    /// Attaches an error description.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Serialises the tool calls as a JSON array string.
    pub fn tool_calls_json(&self) -> String {
        serde_json::to_string(&self.tool_calls).unwrap_or_else(|_| "[]".to_string())
    }

    /// Returns true if execution ran without isolation.
    pub fn is_unconfined(&self) -> bool {
        self.isolation.is_none()
    }
}

/// Extracts tool-call events from agent stdout.
///
/// A line is a candidate only if, after trimming, it starts with `{` and
/// contains `"tool_calls"`. Candidates are parsed as JSON and every entry of
/// their `tool_calls` array is appended in encounter order. Lines that fail
/// to parse are skipped.
pub fn parse_tool_calls(stdout: &str) -> Vec<ToolCall> {
    let mut events = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') || !line.contains(TOOL_CALLS_MARKER) {
            continue;
        }

        let parsed: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Skipping malformed tool-call line");
                continue;
            }
        };

        if let Some(Value::Array(calls)) = parsed.get("tool_calls") {
            events.extend(calls.iter().map(ToolCall::from_value));
        }
    }

    events
}

/// Returns at most the first `max_chars` characters of `s`.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
