//! Stream-JSON normalizer.
//!
//! One JSON object per stdout line. Lines that fail to parse are dropped
//! silently; recognized objects map to one or more normalized entries
//! through the shared coalescer and tool-call tracker. The session id from
//! the first `system` frame is cached and stamped onto every subsequent
//! entry.

use serde_json::Value;

use crate::events::{EntryPatch, EntryType, NormalizedEntry};
use crate::normalize::{
    ChunkCoalescer, ChunkRole, EntryIndexer, OutputNormalizer, ToolCall, ToolCallLocation,
    ToolCallTracker, ToolCallUpdate,
};

pub struct StreamJsonNormalizer {
    indexer: EntryIndexer,
    coalescer: ChunkCoalescer,
    tracker: ToolCallTracker,
    session_id: Option<String>,
    model: Option<String>,
}

impl StreamJsonNormalizer {
    pub fn new() -> Self {
        Self {
            indexer: EntryIndexer::new(),
            coalescer: ChunkCoalescer::new(),
            tracker: ToolCallTracker::new(),
            session_id: None,
            model: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn emit(&mut self, entry_type: EntryType, content: String) -> EntryPatch {
        let mut entry = NormalizedEntry::new(self.indexer.next(), entry_type, content);
        if let Some(session_id) = &self.session_id {
            entry = entry.with_session_id(session_id.clone());
        }
        if let Some(model) = &self.model {
            entry = entry.with_model(model.clone());
        }
        EntryPatch::add(entry)
    }

    fn emit_chunk(&mut self, role: ChunkRole, text: String) -> EntryPatch {
        let entry_type = match role {
            ChunkRole::User => EntryType::UserMessage,
            ChunkRole::Assistant => EntryType::AssistantMessage,
            ChunkRole::Thinking => EntryType::Thinking {
                reasoning: text.clone(),
            },
        };
        self.emit(entry_type, text)
    }

    fn push_chunk(&mut self, role: ChunkRole, text: &str, out: &mut Vec<EntryPatch>) {
        if let Some((flushed_role, flushed)) = self.coalescer.push(role, text) {
            let patch = self.emit_chunk(flushed_role, flushed);
            out.push(patch);
        }
    }

    fn flush_chunks(&mut self, out: &mut Vec<EntryPatch>) {
        if let Some((role, text)) = self.coalescer.flush() {
            let patch = self.emit_chunk(role, text);
            out.push(patch);
        }
    }

    fn on_system(&mut self, value: &Value, out: &mut Vec<EntryPatch>) {
        if value["subtype"] == "init" {
            if self.session_id.is_none() {
                self.session_id = value["session_id"].as_str().map(str::to_string);
            }
            self.model = value["model"].as_str().map(str::to_string);
            let patch = self.emit(EntryType::SystemMessage, "Session started".to_string());
            out.push(patch);
        } else if let Some(message) = value["message"].as_str() {
            let text = message.to_string();
            let patch = self.emit(EntryType::SystemMessage, text);
            out.push(patch);
        }
    }

    fn on_message_blocks(&mut self, value: &Value, out: &mut Vec<EntryPatch>) {
        let Some(blocks) = value["message"]["content"].as_array() else {
            return;
        };
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(text) = block["text"].as_str() {
                        let role = if value["type"] == "user" {
                            ChunkRole::User
                        } else {
                            ChunkRole::Assistant
                        };
                        self.push_chunk(role, text, out);
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block["thinking"].as_str() {
                        self.push_chunk(ChunkRole::Thinking, text, out);
                    }
                }
                Some("tool_use") => {
                    self.flush_chunks(out);
                    self.on_tool_use_block(block, out);
                }
                Some("tool_result") => {
                    self.flush_chunks(out);
                    self.on_tool_result_block(block, out);
                }
                _ => {}
            }
        }
    }

    fn on_tool_use_block(&mut self, block: &Value, out: &mut Vec<EntryPatch>) {
        let Some(id) = block["id"].as_str() else {
            return;
        };
        let name = block["name"].as_str().unwrap_or("tool");
        let input = block.get("input").cloned();

        // Todo updates are plans, not tool calls.
        if name == "TodoWrite" {
            if let Some(entries) = input.as_ref().and_then(parse_todo_plan) {
                let content = crate::normalize::render_plan(&entries);
                let patch = self.emit(EntryType::Plan, content);
                out.push(patch);
                return;
            }
        }
        let locations = input
            .as_ref()
            .and_then(|input| input.get("file_path"))
            .and_then(Value::as_str)
            .map(|path| {
                vec![ToolCallLocation {
                    path: path.to_string(),
                    line: None,
                }]
            })
            .unwrap_or_default();

        let tool_use = self.tracker.start(ToolCall {
            tool_call_id: id.to_string(),
            title: Some(name.to_string()),
            kind: Some(claude_tool_kind(name).to_string()),
            status: Some("in_progress".to_string()),
            locations,
            raw_input: input,
            raw_output: None,
            content: Vec::new(),
        });
        let content = format!("Using tool: {name}");
        let patch = self.emit(EntryType::ToolUse { tool: tool_use }, content);
        out.push(patch);
    }

    fn on_tool_result_block(&mut self, block: &Value, out: &mut Vec<EntryPatch>) {
        let Some(id) = block["tool_use_id"].as_str() else {
            return;
        };
        let failed = block["is_error"].as_bool().unwrap_or(false);
        let update = ToolCallUpdate {
            tool_call_id: id.to_string(),
            title: None,
            kind: None,
            status: Some(if failed { "failed" } else { "completed" }.to_string()),
            locations: None,
            raw_input: None,
            raw_output: block.get("content").cloned(),
            content: None,
        };
        if let Some(tool_use) = self.tracker.update(update) {
            let content = format!("Tool result: {}", tool_use.tool_name);
            let patch = self.emit(EntryType::ToolUse { tool: tool_use }, content);
            out.push(patch);
        }
    }

    fn on_tool_call(&mut self, value: Value, out: &mut Vec<EntryPatch>) {
        let Ok(call) = serde_json::from_value::<ToolCall>(value) else {
            return;
        };
        self.flush_chunks(out);
        let tool_use = self.tracker.start(call);
        let content = format!("Tool call: {}", tool_use.tool_name);
        let patch = self.emit(EntryType::ToolUse { tool: tool_use }, content);
        out.push(patch);
    }

    fn on_tool_call_update(&mut self, value: Value, out: &mut Vec<EntryPatch>) {
        let Ok(update) = serde_json::from_value::<ToolCallUpdate>(value) else {
            return;
        };
        if let Some(tool_use) = self.tracker.update(update) {
            let content = format!("Tool call: {}", tool_use.tool_name);
            let patch = self.emit(EntryType::ToolUse { tool: tool_use }, content);
            out.push(patch);
        }
    }

    fn on_result(&mut self, value: &Value, out: &mut Vec<EntryPatch>) {
        self.flush_chunks(out);
        if value["is_error"].as_bool().unwrap_or(false) || value["subtype"] != "success" {
            let message = value["result"]
                .as_str()
                .unwrap_or("task failed")
                .to_string();
            let patch = self.emit(
                EntryType::Error {
                    message: message.clone(),
                },
                message,
            );
            out.push(patch);
        } else {
            let patch = self.emit(EntryType::SystemMessage, "Task complete".to_string());
            out.push(patch);
        }
    }
}

impl Default for StreamJsonNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputNormalizer for StreamJsonNormalizer {
    fn process_line(&mut self, line: &str) -> Vec<EntryPatch> {
        // Parse failures are dropped without comment; the stream carries
        // occasional non-JSON diagnostics.
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let frame_type = value["type"].as_str().map(str::to_string);
        match frame_type.as_deref() {
            Some("system") => self.on_system(&value, &mut out),
            Some("assistant") | Some("user") => self.on_message_blocks(&value, &mut out),
            Some("tool_call") => self.on_tool_call(value, &mut out),
            Some("tool_call_update") => self.on_tool_call_update(value, &mut out),
            Some("result") => self.on_result(&value, &mut out),
            Some("error") => {
                self.flush_chunks(&mut out);
                let message = value["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string();
                let patch = self.emit(
                    EntryType::Error {
                        message: message.clone(),
                    },
                    message,
                );
                out.push(patch);
            }
            _ => {}
        }
        out
    }

    fn flush(&mut self) -> Vec<EntryPatch> {
        let mut out = Vec::new();
        self.flush_chunks(&mut out);
        out
    }
}

/// Extract plan entries from a TodoWrite input.
fn parse_todo_plan(input: &Value) -> Option<Vec<crate::normalize::PlanEntry>> {
    use crate::normalize::{PlanEntry, PlanEntryStatus, PlanPriority};
    let todos = input.get("todos")?.as_array()?;
    Some(
        todos
            .iter()
            .map(|todo| PlanEntry {
                content: todo["content"].as_str().unwrap_or_default().to_string(),
                status: match todo["status"].as_str() {
                    Some("in_progress") => PlanEntryStatus::InProgress,
                    Some("completed") => PlanEntryStatus::Completed,
                    _ => PlanEntryStatus::Pending,
                },
                priority: match todo["priority"].as_str() {
                    Some("high") => PlanPriority::High,
                    Some("low") => PlanPriority::Low,
                    _ => PlanPriority::Medium,
                },
            })
            .collect(),
    )
}

/// Map a Claude tool name onto the shared action-kind vocabulary.
fn claude_tool_kind(name: &str) -> &'static str {
    match name {
        "Read" | "NotebookRead" => "read",
        "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => "edit",
        "Bash" => "execute",
        "Grep" | "Glob" | "WebSearch" => "search",
        _ => "other",
    }
}
