//! Session state machine for bidirectional-protocol agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Ready,
    Prompting,
    Cancelled,
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("Cannot {operation} a session in state {state:?}")]
pub struct SessionStateError {
    pub operation: &'static str,
    pub state: SessionState,
}

/// One logical conversation with an agent over the RPC connection.
///
/// Legal transitions: `initializing → ready → prompting → (ready | cancelled
/// | closed)`. Prompting is rejected outside `ready`; cancel is a no-op
/// outside `prompting`.
#[derive(Debug, Clone)]
pub struct AcpSession {
    pub id: String,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    state: SessionState,
}

impl AcpSession {
    pub fn new(id: impl Into<String>, work_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            work_dir,
            created_at: now,
            last_activity: now,
            state: SessionState::Initializing,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Initialization handshake finished.
    pub fn mark_ready(&mut self) -> Result<(), SessionStateError> {
        match self.state {
            SessionState::Initializing => {
                self.state = SessionState::Ready;
                self.touch();
                Ok(())
            }
            state => Err(SessionStateError {
                operation: "mark ready",
                state,
            }),
        }
    }

    /// Enter the prompting state. Rejected unless the session is ready.
    pub fn begin_prompt(&mut self) -> Result<(), SessionStateError> {
        match self.state {
            SessionState::Ready => {
                self.state = SessionState::Prompting;
                self.touch();
                Ok(())
            }
            state => Err(SessionStateError {
                operation: "prompt",
                state,
            }),
        }
    }

    /// A prompt turn ended normally; the session can take another prompt.
    pub fn finish_prompt(&mut self) {
        if self.state == SessionState::Prompting {
            self.state = SessionState::Ready;
            self.touch();
        }
    }

    /// Cancel the in-flight prompt. No-op unless currently prompting;
    /// returns whether a cancellation actually happened.
    pub fn cancel(&mut self) -> bool {
        if self.state == SessionState::Prompting {
            self.state = SessionState::Cancelled;
            self.touch();
            true
        } else {
            false
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AcpSession {
        AcpSession::new("s1", PathBuf::from("/tmp"))
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Initializing);
        s.mark_ready().unwrap();
        assert_eq!(s.state(), SessionState::Ready);
        s.begin_prompt().unwrap();
        assert_eq!(s.state(), SessionState::Prompting);
        s.finish_prompt();
        assert_eq!(s.state(), SessionState::Ready);
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn prompt_rejected_unless_ready() {
        let mut s = session();
        assert!(s.begin_prompt().is_err());
        s.mark_ready().unwrap();
        s.begin_prompt().unwrap();
        // Already prompting: a second prompt is rejected too.
        assert!(s.begin_prompt().is_err());
    }

    #[test]
    fn cancel_is_noop_unless_prompting() {
        let mut s = session();
        assert!(!s.cancel());
        s.mark_ready().unwrap();
        assert!(!s.cancel());
        s.begin_prompt().unwrap();
        assert!(s.cancel());
        assert_eq!(s.state(), SessionState::Cancelled);
        // Cancelled is terminal for this turn: no further cancel.
        assert!(!s.cancel());
    }

    #[test]
    fn finish_prompt_outside_prompting_changes_nothing() {
        let mut s = session();
        s.mark_ready().unwrap();
        s.finish_prompt();
        assert_eq!(s.state(), SessionState::Ready);
    }
}
