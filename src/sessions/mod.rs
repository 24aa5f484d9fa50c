//! Session persistence
//!
//! One append-only jsonl file per session under a per-agent namespaced
//! directory: `<home>/.conductor/[dev/]<namespace>/<sessionId>.jsonl`, one
//! tagged [`SessionEvent`] per line. Forking is a byte copy under a new id;
//! resuming synthesizes a prompt header from the tail of the log.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::acp::protocol::{AvailableCommand, SessionUpdate};
use crate::normalize::{PlanEntry, ToolCall, ToolCallUpdate};

/// How many trailing events feed the synthesized resume prompt.
pub const DEFAULT_RESUME_HISTORY: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Normalized session log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    User { content: String },
    Assistant { content: String },
    Thinking { content: String },
    ToolCall(ToolCall),
    ToolUpdate(ToolCallUpdate),
    Plan { entries: Vec<PlanEntry> },
    AvailableCommands { commands: Vec<AvailableCommand> },
    CurrentMode { mode_id: String },
}

impl SessionEvent {
    /// Normalize a protocol update for persistence. Non-text chunks and
    /// anything without a session-log shape are skipped.
    pub fn from_update(update: &SessionUpdate) -> Option<Self> {
        match update {
            SessionUpdate::UserMessageChunk { content } => content
                .as_text()
                .map(|text| SessionEvent::User {
                    content: text.to_string(),
                }),
            SessionUpdate::AgentMessageChunk { content } => content
                .as_text()
                .map(|text| SessionEvent::Assistant {
                    content: text.to_string(),
                }),
            SessionUpdate::AgentThoughtChunk { content } => content
                .as_text()
                .map(|text| SessionEvent::Thinking {
                    content: text.to_string(),
                }),
            SessionUpdate::ToolCall(call) => Some(SessionEvent::ToolCall(call.clone())),
            SessionUpdate::ToolCallUpdate(update) => {
                Some(SessionEvent::ToolUpdate(update.clone()))
            }
            SessionUpdate::Plan { entries } => Some(SessionEvent::Plan {
                entries: entries.clone(),
            }),
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                Some(SessionEvent::AvailableCommands {
                    commands: available_commands.clone(),
                })
            }
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                Some(SessionEvent::CurrentMode {
                    mode_id: current_mode_id.clone(),
                })
            }
        }
    }

    /// Role-prefixed one-liner for resume synthesis.
    fn replay_line(&self) -> String {
        match self {
            SessionEvent::User { content } => format!("user: {content}"),
            SessionEvent::Assistant { content } => format!("assistant: {content}"),
            SessionEvent::Thinking { content } => format!("thinking: {content}"),
            SessionEvent::ToolCall(call) => {
                let label = call
                    .title
                    .clone()
                    .or_else(|| call.kind.clone())
                    .unwrap_or_else(|| call.tool_call_id.clone());
                format!("tool: {label}")
            }
            SessionEvent::ToolUpdate(update) => format!(
                "tool: {} ({})",
                update.tool_call_id,
                update.status.as_deref().unwrap_or("update")
            ),
            SessionEvent::Plan { entries } => format!("plan: {} step(s)", entries.len()),
            SessionEvent::AvailableCommands { commands } => {
                let names: Vec<&str> = commands.iter().map(|c| c.name.as_str()).collect();
                format!("commands: {}", names.join(", "))
            }
            SessionEvent::CurrentMode { mode_id } => format!("mode: {mode_id}"),
        }
    }
}

/// Append-only jsonl store for one agent namespace.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    namespace: String,
}

impl SessionStore {
    /// Store under the user's home directory (`dev/` inset in debug builds).
    pub fn new(namespace: &str) -> Self {
        let mut root = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".conductor");
        if cfg!(debug_assertions) {
            root = root.join("dev");
        }
        Self::with_root(root, namespace)
    }

    /// Store under an explicit root; tests point this at a temp dir.
    pub fn with_root(root: impl Into<PathBuf>, namespace: &str) -> Self {
        Self {
            root: root.into(),
            namespace: namespace.to_string(),
        }
    }

    fn dir(&self) -> PathBuf {
        self.root.join(&self.namespace)
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir().join(format!("{session_id}.jsonl"))
    }

    /// Append one event to the session log, creating the file on first use.
    pub async fn append(
        &self,
        session_id: &str,
        event: &SessionEvent,
    ) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(self.dir()).await?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Read the full event log in write order.
    pub async fn load_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, SessionError> {
        let path = self.session_path(session_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, SessionError> {
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".jsonl") {
                sessions.push(id.to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Byte-copy the log under a fresh id and return it.
    pub async fn fork(&self, session_id: &str) -> Result<String, SessionError> {
        let source = self.session_path(session_id);
        if !source.exists() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let fork_id = Uuid::new_v4().to_string();
        tokio::fs::copy(&source, self.session_path(&fork_id)).await?;
        Ok(fork_id)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        match tokio::fs::remove_file(self.session_path(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionError::NotFound(session_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Synthesize a resume prompt: the last [`DEFAULT_RESUME_HISTORY`]
    /// events as role-prefixed lines, a separator, then the new request. A
    /// missing session yields the raw prompt unchanged.
    pub async fn resume_prompt(&self, session_id: &str, prompt: &str) -> String {
        self.resume_prompt_with_history(session_id, prompt, DEFAULT_RESUME_HISTORY)
            .await
    }

    pub async fn resume_prompt_with_history(
        &self,
        session_id: &str,
        prompt: &str,
        history: usize,
    ) -> String {
        let events = match self.load_events(session_id).await {
            Ok(events) => events,
            Err(_) => return prompt.to_string(),
        };
        let mut lines: Vec<String> = events
            .iter()
            .rev()
            .take(history)
            .map(SessionEvent::replay_line)
            .collect();
        lines.reverse();
        let mut out = lines.join("\n");
        out.push_str("\n---\nNew request: ");
        out.push_str(prompt);
        out
    }
}
