//! Unified event model
//!
//! Every agent protocol is normalized into a stream of [`NormalizedEntry`]
//! values. Entries carry a per-executor monotone index; streaming protocols
//! may refine an already-emitted entry with a [`EntryPatch::Replace`] at the
//! same index.

pub mod content;
pub mod tool;

pub use content::ContentBlock;
pub use tool::{ActionType, FileChange, ToolStatus, ToolUse};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type EntryIndex = u64;

/// A single normalized event in an agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntry {
    pub index: EntryIndex,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry_type: EntryType,
    pub content: String,
    #[serde(default, skip_serializing_if = "EntryMetadata::is_empty")]
    pub metadata: EntryMetadata,
}

impl NormalizedEntry {
    pub fn new(index: EntryIndex, entry_type: EntryType, content: impl Into<String>) -> Self {
        Self {
            index,
            timestamp: Utc::now(),
            entry_type,
            content: content.into(),
            metadata: EntryMetadata::default(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.metadata.session_id = Some(session_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }
}

/// Tagged entry variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryType {
    UserMessage,
    AssistantMessage,
    Thinking { reasoning: String },
    ToolUse { tool: ToolUse },
    Plan,
    SystemMessage,
    Error { message: String },
}

/// Optional per-entry metadata. `extra` carries arbitrary protocol-specific
/// fields verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EntryMetadata {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.model.is_none() && self.extra.is_empty()
    }
}

/// Streaming refinement over the entry stream.
///
/// `Add` introduces a new entry at a freshly allocated index; `Replace`
/// re-delivers an entry already emitted at `index` with updated content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntryPatch {
    Add { entry: NormalizedEntry },
    Replace { index: EntryIndex, entry: NormalizedEntry },
}

impl EntryPatch {
    pub fn add(entry: NormalizedEntry) -> Self {
        EntryPatch::Add { entry }
    }

    pub fn replace(entry: NormalizedEntry) -> Self {
        EntryPatch::Replace {
            index: entry.index,
            entry,
        }
    }

    pub fn entry(&self) -> &NormalizedEntry {
        match self {
            EntryPatch::Add { entry } => entry,
            EntryPatch::Replace { entry, .. } => entry,
        }
    }

    pub fn into_entry(self) -> NormalizedEntry {
        match self {
            EntryPatch::Add { entry } => entry,
            EntryPatch::Replace { entry, .. } => entry,
        }
    }
}

/// Fold a patch stream into the materialized entry list.
pub fn apply_patch(entries: &mut Vec<NormalizedEntry>, patch: EntryPatch) {
    match patch {
        EntryPatch::Add { entry } => entries.push(entry),
        EntryPatch::Replace { index, entry } => {
            match entries.iter().position(|e| e.index == index) {
                Some(pos) => entries[pos] = entry,
                None => entries.push(entry),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_type_serializes_with_snake_case_tag() {
        let entry = NormalizedEntry::new(
            3,
            EntryType::Thinking {
                reasoning: "planning".into(),
            },
            "planning",
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "thinking");
        assert_eq!(json["reasoning"], "planning");
        assert_eq!(json["index"], 3);

        let back: NormalizedEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn empty_metadata_is_omitted() {
        let entry = NormalizedEntry::new(0, EntryType::AssistantMessage, "hi");
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("metadata").is_none());

        let tagged = entry.with_session_id("abc");
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["metadata"]["session_id"], "abc");
    }

    #[test]
    fn replace_patch_overwrites_matching_index() {
        let mut entries = Vec::new();
        apply_patch(
            &mut entries,
            EntryPatch::add(NormalizedEntry::new(0, EntryType::AssistantMessage, "par")),
        );
        apply_patch(
            &mut entries,
            EntryPatch::replace(NormalizedEntry::new(
                0,
                EntryType::AssistantMessage,
                "paragraph",
            )),
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "paragraph");
    }
}
