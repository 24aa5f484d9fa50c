//! Same-role chunk coalescing.

/// Role of a streamed text chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRole {
    User,
    Assistant,
    Thinking,
}

/// Concatenates consecutive chunks of the same role into one buffer.
///
/// A chunk of a different role flushes the pending buffer first. At stream
/// end, `flush` emits the residue unless it is whitespace-only.
#[derive(Debug)]
pub struct ChunkCoalescer {
    enabled: bool,
    pending: Option<(ChunkRole, String)>,
}

impl ChunkCoalescer {
    pub fn new() -> Self {
        Self {
            enabled: true,
            pending: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            pending: None,
        }
    }

    /// Feed one chunk. Returns the flushed (role, text) pair when a role
    /// switch closed the previous buffer.
    pub fn push(&mut self, role: ChunkRole, text: &str) -> Option<(ChunkRole, String)> {
        if !self.enabled {
            return Some((role, text.to_string()));
        }

        if let Some((pending_role, buffer)) = &mut self.pending {
            if *pending_role == role {
                buffer.push_str(text);
                return None;
            }
        }

        let flushed = self.take_pending();
        self.pending = Some((role, text.to_string()));
        flushed
    }

    /// Emit whatever is buffered. Whitespace-only residue is dropped.
    pub fn flush(&mut self) -> Option<(ChunkRole, String)> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<(ChunkRole, String)> {
        match self.pending.take() {
            Some((_, text)) if text.trim().is_empty() => None,
            other => other,
        }
    }
}

impl Default for ChunkCoalescer {
    fn default() -> Self {
        Self::new()
    }
}
