//! Tool-call lifecycle tracking and action inference.
//!
//! Both the stream-json and the ACP protocol report tool invocations as a
//! `tool_call` frame followed by any number of `tool_call_update` frames.
//! The tracker keeps the authoritative per-call state, merges updates
//! field-by-field (absent fields mean "no change"), and decides when an
//! update is worth a fresh `tool_use` entry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::events::{ActionType, ContentBlock, FileChange, ToolStatus, ToolUse};

/// Wire form of a tool call as the agents report it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(alias = "id")]
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ToolCallLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ToolCallContent>,
}

/// Wire form of a tool-call update. Every field is optional; `None` leaves
/// the stored value untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    #[serde(alias = "id")]
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ToolCallLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ToolCallContent>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallLocation {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// Structured content attached to a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    #[serde(rename_all = "camelCase")]
    Content { content: ContentBlock },
    #[serde(rename_all = "camelCase")]
    Diff {
        path: String,
        #[serde(default)]
        old_text: Option<String>,
        new_text: String,
    },
    #[serde(rename_all = "camelCase")]
    Terminal { terminal_id: String },
}

/// Map a wire status string onto the normalized lifecycle.
pub fn map_tool_status(status: Option<&str>) -> ToolStatus {
    match status {
        Some("in_progress") => ToolStatus::Running,
        Some("completed") => ToolStatus::Success,
        Some("failed") => ToolStatus::Failed,
        _ => ToolStatus::Created,
    }
}

/// Id-keyed tool-call lifecycle tracker.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    calls: HashMap<String, ToolCall>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh tool call and build its first `tool_use` record.
    pub fn start(&mut self, call: ToolCall) -> ToolUse {
        let tool_use = build_tool_use(&call);
        self.calls.insert(call.tool_call_id.clone(), call);
        tool_use
    }

    /// Merge an update into the stored call. Returns a new `tool_use`
    /// record only when the status changed or content was added; an update
    /// for an unknown id starts a new call.
    pub fn update(&mut self, update: ToolCallUpdate) -> Option<ToolUse> {
        if !self.calls.contains_key(&update.tool_call_id) {
            return Some(self.start(ToolCall {
                tool_call_id: update.tool_call_id,
                title: update.title,
                kind: update.kind,
                status: update.status,
                locations: update.locations.unwrap_or_default(),
                raw_input: update.raw_input,
                raw_output: update.raw_output,
                content: update.content.unwrap_or_default(),
            }));
        }
        let call = self.calls.get_mut(&update.tool_call_id)?;

        let status_changed = match &update.status {
            Some(status) => call.status.as_deref() != Some(status.as_str()),
            None => false,
        };
        let content_added = update.content.as_ref().is_some_and(|c| !c.is_empty())
            || update.raw_output.is_some();

        if let Some(title) = update.title {
            call.title = Some(title);
        }
        if let Some(kind) = update.kind {
            call.kind = Some(kind);
        }
        if let Some(status) = update.status {
            call.status = Some(status);
        }
        if let Some(locations) = update.locations {
            call.locations = locations;
        }
        if let Some(raw_input) = update.raw_input {
            call.raw_input = Some(raw_input);
        }
        if let Some(raw_output) = update.raw_output {
            call.raw_output = Some(raw_output);
        }
        if let Some(content) = update.content {
            call.content = content;
        }

        if status_changed || content_added {
            Some(build_tool_use(call))
        } else {
            None
        }
    }

    pub fn get(&self, tool_call_id: &str) -> Option<&ToolCall> {
        self.calls.get(tool_call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

fn build_tool_use(call: &ToolCall) -> ToolUse {
    ToolUse {
        tool_name: call
            .title
            .clone()
            .or_else(|| call.kind.clone())
            .unwrap_or_else(|| "tool".to_string()),
        action: infer_action(call),
        status: map_tool_status(call.status.as_deref()),
        result: call.raw_output.clone(),
    }
}

/// Infer what a tool call does from its kind, locations, and raw input.
pub fn infer_action(call: &ToolCall) -> ActionType {
    let first_path = || {
        call.locations
            .first()
            .map(|l| l.path.clone())
            .or_else(|| raw_input_str(call, "path"))
    };

    match call.kind.as_deref() {
        Some("read") => match first_path() {
            Some(path) => ActionType::FileRead { path },
            None => generic_tool(call),
        },
        Some("edit") => {
            let path = first_path().unwrap_or_default();
            let changes: Vec<FileChange> = call
                .content
                .iter()
                .filter_map(|content| match content {
                    ToolCallContent::Diff {
                        path,
                        old_text,
                        new_text,
                    } => Some(FileChange::Edit {
                        unified_diff: synthesize_unified_diff(
                            path,
                            old_text.as_deref(),
                            new_text,
                        ),
                    }),
                    _ => None,
                })
                .collect();
            if changes.is_empty() {
                ActionType::FileWrite { path }
            } else {
                ActionType::FileEdit { path, changes }
            }
        }
        Some("delete") => ActionType::FileEdit {
            path: first_path().unwrap_or_default(),
            changes: vec![FileChange::Delete],
        },
        Some("execute") => {
            let command = raw_input_str(call, "command")
                .or_else(|| call.title.as_deref().and_then(extract_backtick_span))
                .or_else(|| call.title.clone())
                .unwrap_or_default();
            ActionType::CommandRun { command }
        }
        Some("search") => {
            let query = raw_input_str(call, "query")
                .or_else(|| raw_input_str(call, "pattern"))
                .or_else(|| call.title.clone())
                .unwrap_or_default();
            ActionType::Search { query }
        }
        _ => generic_tool(call),
    }
}

fn generic_tool(call: &ToolCall) -> ActionType {
    ActionType::Tool {
        name: call
            .title
            .clone()
            .or_else(|| call.kind.clone())
            .unwrap_or_else(|| "tool".to_string()),
        args: call.raw_input.clone(),
        result: call.raw_output.clone(),
    }
}

fn raw_input_str(call: &ToolCall, key: &str) -> Option<String> {
    call.raw_input
        .as_ref()
        .and_then(|input| input.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

static BACKTICK_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());

/// First backtick-quoted span in a title, e.g. "Run `npm test`" → "npm test".
pub fn extract_backtick_span(title: &str) -> Option<String> {
    BACKTICK_SPAN
        .captures(title)
        .map(|caps| caps[1].to_string())
}

/// Build a minimal unified diff from before/after text. An absent or empty
/// `old_text` renders as a new-file diff.
pub fn synthesize_unified_diff(path: &str, old_text: Option<&str>, new_text: &str) -> String {
    let old_lines: Vec<&str> = match old_text {
        Some(text) if !text.is_empty() => text.lines().collect(),
        _ => Vec::new(),
    };
    let new_lines: Vec<&str> = new_text.lines().collect();

    let mut diff = String::new();
    if old_lines.is_empty() {
        diff.push_str("--- /dev/null\n");
    } else {
        diff.push_str(&format!("--- a/{path}\n"));
    }
    diff.push_str(&format!("+++ b/{path}\n"));
    diff.push_str(&format!(
        "@@ -1,{} +1,{} @@\n",
        old_lines.len(),
        new_lines.len()
    ));
    for line in &old_lines {
        diff.push_str(&format!("-{line}\n"));
    }
    for line in &new_lines {
        diff.push_str(&format!("+{line}\n"));
    }
    diff
}
