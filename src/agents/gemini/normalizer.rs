//! Normalizer for the bidirectional protocol's notification stream.
//!
//! The executor serializes every `session/update` notification as one JSON
//! line, plus small envelope lines for turn completion and connection
//! errors. This normalizer maps those lines onto the unified event model
//! with the shared coalescer and tool tracker.

use serde_json::Value;

use crate::acp::protocol::{SessionNotification, SessionUpdate};
use crate::events::{EntryPatch, EntryType, NormalizedEntry};
use crate::normalize::{
    render_plan, ChunkCoalescer, ChunkRole, EntryIndexer, OutputNormalizer, ToolCallTracker,
};

pub struct AcpNormalizer {
    indexer: EntryIndexer,
    coalescer: ChunkCoalescer,
    tracker: ToolCallTracker,
    session_id: Option<String>,
}

impl AcpNormalizer {
    pub fn new() -> Self {
        Self {
            indexer: EntryIndexer::new(),
            coalescer: ChunkCoalescer::new(),
            tracker: ToolCallTracker::new(),
            session_id: None,
        }
    }

    fn emit(&mut self, entry_type: EntryType, content: String) -> EntryPatch {
        let mut entry = NormalizedEntry::new(self.indexer.next(), entry_type, content);
        if let Some(session_id) = &self.session_id {
            entry = entry.with_session_id(session_id.clone());
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

    fn push_chunk(&mut self, role: ChunkRole, text: String, out: &mut Vec<EntryPatch>) {
        if let Some((flushed_role, flushed)) = self.coalescer.push(role, &text) {
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

    fn on_update(&mut self, update: SessionUpdate, out: &mut Vec<EntryPatch>) {
        match update {
            SessionUpdate::UserMessageChunk { content } => {
                self.push_chunk(ChunkRole::User, content.display_text(), out);
            }
            SessionUpdate::AgentMessageChunk { content } => {
                self.push_chunk(ChunkRole::Assistant, content.display_text(), out);
            }
            SessionUpdate::AgentThoughtChunk { content } => {
                self.push_chunk(ChunkRole::Thinking, content.display_text(), out);
            }
            SessionUpdate::ToolCall(call) => {
                self.flush_chunks(out);
                let tool_use = self.tracker.start(call);
                let content = format!("Tool call: {}", tool_use.tool_name);
                let patch = self.emit(EntryType::ToolUse { tool: tool_use }, content);
                out.push(patch);
            }
            SessionUpdate::ToolCallUpdate(update) => {
                if let Some(tool_use) = self.tracker.update(update) {
                    self.flush_chunks(out);
                    let content = format!("Tool call: {}", tool_use.tool_name);
                    let patch = self.emit(EntryType::ToolUse { tool: tool_use }, content);
                    out.push(patch);
                }
            }
            SessionUpdate::Plan { entries } => {
                self.flush_chunks(out);
                let rendered = render_plan(&entries);
                let patch = self.emit(EntryType::SystemMessage, rendered);
                out.push(patch);
            }
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                let names: Vec<&str> = available_commands
                    .iter()
                    .map(|command| command.name.as_str())
                    .collect();
                let patch = self.emit(
                    EntryType::SystemMessage,
                    format!("Available commands: {}", names.join(", ")),
                );
                out.push(patch);
            }
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                let patch = self.emit(
                    EntryType::SystemMessage,
                    format!("Mode: {current_mode_id}"),
                );
                out.push(patch);
            }
        }
    }
}

impl Default for AcpNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputNormalizer for AcpNormalizer {
    fn process_line(&mut self, line: &str) -> Vec<EntryPatch> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let frame_type = value["type"].as_str().map(str::to_string);
        match frame_type.as_deref() {
            Some("turn_complete") => {
                self.flush_chunks(&mut out);
                let stop_reason = value["stopReason"].as_str().unwrap_or("end_turn");
                let patch = self.emit(
                    EntryType::SystemMessage,
                    format!("Turn complete ({stop_reason})"),
                );
                out.push(patch);
            }
            Some("error") => {
                self.flush_chunks(&mut out);
                let message = value["message"]
                    .as_str()
                    .unwrap_or("protocol error")
                    .to_string();
                let patch = self.emit(
                    EntryType::Error {
                        message: message.clone(),
                    },
                    message,
                );
                out.push(patch);
            }
            _ => {
                let Ok(notification) = serde_json::from_value::<SessionNotification>(value)
                else {
                    return out;
                };
                if self.session_id.is_none() {
                    self.session_id = Some(notification.session_id.clone());
                }
                self.on_update(notification.update, &mut out);
            }
        }
        out
    }

    fn flush(&mut self) -> Vec<EntryPatch> {
        let mut out = Vec::new();
        self.flush_chunks(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ToolStatus;

    fn entries(patches: Vec<EntryPatch>) -> Vec<NormalizedEntry> {
        patches.into_iter().map(EntryPatch::into_entry).collect()
    }

    fn notification_line(update: &str) -> String {
        format!(r#"{{"sessionId":"s1","update":{update}}}"#)
    }

    #[test]
    fn message_chunks_coalesce_across_notifications() {
        let mut n = AcpNormalizer::new();
        assert!(n
            .process_line(&notification_line(
                r#"{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Hello "}}"#
            ))
            .is_empty());
        assert!(n
            .process_line(&notification_line(
                r#"{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"there"}}"#
            ))
            .is_empty());
        let out = entries(n.flush());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "Hello there");
        assert_eq!(out[0].metadata.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn tool_call_flushes_pending_chunks_first() {
        let mut n = AcpNormalizer::new();
        n.process_line(&notification_line(
            r#"{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Running tests"}}"#,
        ));
        let out = entries(n.process_line(&notification_line(
            r#"{"sessionUpdate":"tool_call","toolCallId":"t1","kind":"execute","status":"pending","title":"Run `cargo test`"}"#,
        )));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "Running tests");
        let EntryType::ToolUse { tool } = &out[1].entry_type else {
            panic!("expected tool_use");
        };
        assert_eq!(tool.status, ToolStatus::Created);
    }

    #[test]
    fn plan_renders_to_system_message() {
        let mut n = AcpNormalizer::new();
        let out = entries(n.process_line(&notification_line(
            r#"{"sessionUpdate":"plan","entries":[
                {"content":"explore","status":"completed","priority":"medium"},
                {"content":"implement","status":"in_progress","priority":"high"}
            ]}"#,
        )));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry_type, EntryType::SystemMessage);
        assert_eq!(
            out[0].content,
            "## Plan\n\n● explore\n◐ implement [high]\n"
        );
    }

    #[test]
    fn turn_complete_and_error_envelopes() {
        let mut n = AcpNormalizer::new();
        let out = entries(n.process_line(r#"{"type":"turn_complete","stopReason":"end_turn"}"#));
        assert_eq!(out[0].content, "Turn complete (end_turn)");

        let out = entries(n.process_line(r#"{"type":"error","message":"agent crashed"}"#));
        assert_eq!(
            out[0].entry_type,
            EntryType::Error {
                message: "agent crashed".into()
            }
        );
    }

    #[test]
    fn image_chunks_render_placeholder_text() {
        let mut n = AcpNormalizer::new();
        n.process_line(&notification_line(
            r#"{"sessionUpdate":"agent_message_chunk","content":{"type":"image","mimeType":"image/png"}}"#,
        ));
        let out = entries(n.flush());
        assert_eq!(out[0].content, "[Image]");
    }
}
