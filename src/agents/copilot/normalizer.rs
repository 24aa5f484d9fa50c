//! Plain-text normalizer with paragraph batching.
//!
//! The child writes free-form text with ANSI escapes. Non-blank lines group
//! into paragraphs: the first line of a paragraph emits an `add` patch at a
//! fresh index, each following line a `replace` patch with the cumulative
//! content, and a blank line a final `replace` before the buffer resets.
//! Session marker lines bypass batching entirely.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::events::{EntryIndex, EntryPatch, EntryType, NormalizedEntry};
use crate::normalize::{EntryIndexer, OutputNormalizer};

pub const SESSION_MARKER_PREFIX: &str = "[copilot-session] ";

/// Render the marker line injected into the stdout stream.
pub fn format_session_marker(session_id: &str) -> String {
    format!("{SESSION_MARKER_PREFIX}{session_id}\n")
}

/// A line is a session marker iff it starts with the marker prefix; the
/// remainder (trimmed) is the session id.
pub fn parse_session_marker(line: &str) -> Option<String> {
    line.strip_prefix(SESSION_MARKER_PREFIX)
        .map(|rest| rest.trim().to_string())
}

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

pub fn strip_ansi(line: &str) -> String {
    ANSI_RE.replace_all(line, "").to_string()
}

pub struct PlainTextNormalizer {
    indexer: EntryIndexer,
    paragraph: Option<(EntryIndex, Vec<String>)>,
}

impl PlainTextNormalizer {
    pub fn new() -> Self {
        Self {
            indexer: EntryIndexer::new(),
            paragraph: None,
        }
    }

    fn paragraph_entry(index: EntryIndex, lines: &[String]) -> NormalizedEntry {
        NormalizedEntry::new(index, EntryType::AssistantMessage, lines.join("\n"))
    }

    fn close_paragraph(&mut self) -> Option<EntryPatch> {
        let (index, lines) = self.paragraph.take()?;
        Some(EntryPatch::replace(Self::paragraph_entry(index, &lines)))
    }
}

impl Default for PlainTextNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputNormalizer for PlainTextNormalizer {
    fn process_line(&mut self, line: &str) -> Vec<EntryPatch> {
        if let Some(session_id) = parse_session_marker(line) {
            let entry = NormalizedEntry::new(
                self.indexer.next(),
                EntryType::SystemMessage,
                format!("Session id: {session_id}"),
            )
            .with_session_id(session_id);
            return vec![EntryPatch::add(entry)];
        }

        let stripped = strip_ansi(line);
        if stripped.trim().is_empty() {
            return self.close_paragraph().into_iter().collect();
        }

        if let Some((index, lines)) = &mut self.paragraph {
            lines.push(stripped);
            let entry = Self::paragraph_entry(*index, lines);
            return vec![EntryPatch::replace(entry)];
        }

        let index = self.indexer.next();
        self.paragraph = Some((index, vec![stripped.clone()]));
        vec![EntryPatch::add(Self::paragraph_entry(index, &[stripped]))]
    }

    fn flush(&mut self) -> Vec<EntryPatch> {
        self.close_paragraph().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips() {
        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        let line = format_session_marker(uuid);
        assert_eq!(parse_session_marker(line.trim_end()), Some(uuid.to_string()));
        assert_eq!(parse_session_marker("not a marker"), None);
        // Prefix match is exact.
        assert_eq!(parse_session_marker("[copilot-session]x"), None);
    }

    #[test]
    fn paragraph_batching_emits_add_then_replaces() {
        let mut n = PlainTextNormalizer::new();

        let first = n.process_line("Working on it");
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], EntryPatch::Add { .. }));
        assert_eq!(first[0].entry().content, "Working on it");

        let second = n.process_line("still going");
        assert!(matches!(second[0], EntryPatch::Replace { index: 0, .. }));
        assert_eq!(second[0].entry().content, "Working on it\nstill going");

        let blank = n.process_line("");
        assert!(matches!(blank[0], EntryPatch::Replace { index: 0, .. }));

        // Next paragraph gets a fresh index.
        let next = n.process_line("new paragraph");
        assert!(matches!(next[0], EntryPatch::Add { .. }));
        assert_eq!(next[0].entry().index, 1);
    }

    #[test]
    fn blank_line_on_empty_buffer_emits_nothing() {
        let mut n = PlainTextNormalizer::new();
        assert!(n.process_line("").is_empty());
        assert!(n.process_line("   ").is_empty());
    }

    #[test]
    fn stream_close_emits_final_replace() {
        let mut n = PlainTextNormalizer::new();
        n.process_line("tail paragraph");
        let out = n.flush();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], EntryPatch::Replace { .. }));
        assert_eq!(out[0].entry().content, "tail paragraph");
        assert!(n.flush().is_empty());
    }

    #[test]
    fn ansi_escapes_are_stripped() {
        let mut n = PlainTextNormalizer::new();
        let out = n.process_line("\x1b[32mgreen text\x1b[0m");
        assert_eq!(out[0].entry().content, "green text");
    }

    #[test]
    fn marker_gets_fresh_index_without_disturbing_paragraph() {
        let mut n = PlainTextNormalizer::new();
        n.process_line("paragraph start");
        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        let marker = n.process_line(&format!("{SESSION_MARKER_PREFIX}{uuid}"));
        assert_eq!(marker.len(), 1);
        let entry = marker[0].entry();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.entry_type, EntryType::SystemMessage);
        assert!(entry.content.contains(uuid));
        assert_eq!(entry.metadata.session_id.as_deref(), Some(uuid));

        // The paragraph keeps batching at its own index.
        let cont = n.process_line("paragraph continues");
        assert!(matches!(cont[0], EntryPatch::Replace { index: 0, .. }));
    }
}
