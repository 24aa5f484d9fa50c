//! Tool-use sub-records carried inside `tool_use` entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured tool invocation reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool_name: String,
    pub action: ActionType,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// What the tool call actually does, inferred from its kind, locations, and
/// raw input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionType {
    FileRead {
        path: String,
    },
    FileWrite {
        path: String,
    },
    FileEdit {
        path: String,
        changes: Vec<FileChange>,
    },
    CommandRun {
        command: String,
    },
    Search {
        query: String,
    },
    Tool {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

/// One change inside a `file_edit` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileChange {
    Edit { unified_diff: String },
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Created,
    Running,
    Success,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_round_trips() {
        let action = ActionType::FileEdit {
            path: "src/main.rs".into(),
            changes: vec![FileChange::Edit {
                unified_diff: "--- a/src/main.rs\n+++ b/src/main.rs\n".into(),
            }],
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "file_edit");
        let back: ActionType = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn tool_status_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&ToolStatus::Running).unwrap(),
            "\"running\""
        );
    }
}
