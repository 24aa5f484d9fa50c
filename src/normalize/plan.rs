//! Plan updates rendered as a one-off system message.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    #[serde(default)]
    pub status: PlanEntryStatus,
    #[serde(default)]
    pub priority: PlanPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPriority {
    High,
    #[default]
    Medium,
    Low,
}

/// Render a plan update to markdown: a `## Plan` header, then one line per
/// entry with a status glyph and a priority tag when non-medium.
pub fn render_plan(entries: &[PlanEntry]) -> String {
    let mut out = String::from("## Plan\n\n");
    for entry in entries {
        let glyph = match entry.status {
            PlanEntryStatus::Pending => '○',
            PlanEntryStatus::InProgress => '◐',
            PlanEntryStatus::Completed => '●',
        };
        out.push(glyph);
        out.push(' ');
        out.push_str(&entry.content);
        match entry.priority {
            PlanPriority::Medium => {}
            PlanPriority::High => out.push_str(" [high]"),
            PlanPriority::Low => out.push_str(" [low]"),
        }
        out.push('\n');
    }
    out
}
