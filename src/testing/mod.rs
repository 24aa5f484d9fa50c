//! Testing utilities
//!
//! A scripted [`MockTaskRunner`] stands in for real agent children: each
//! task id can be given a sequence of per-attempt outcomes, everything else
//! falls back to the default outcome, and a spawn counter makes
//! "never spawned" assertions possible.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::engine::{CancelToken, ExecutionResult, Task, TaskId, TaskRunner};
use crate::events::NormalizedEntry;

/// One scripted attempt outcome.
#[derive(Debug, Clone)]
pub struct MockOutcome {
    pub exit_code: i32,
    pub delay: Duration,
    pub error: Option<String>,
    pub entries: Vec<NormalizedEntry>,
    pub session_id: Option<String>,
}

impl MockOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            delay: Duration::from_millis(10),
            error: None,
            entries: Vec::new(),
            session_id: None,
        }
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::success()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_entries(mut self, entries: Vec<NormalizedEntry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Scripted task runner for engine, resilience, and workflow tests.
pub struct MockTaskRunner {
    scripts: Mutex<HashMap<TaskId, VecDeque<MockOutcome>>>,
    default_outcome: Mutex<MockOutcome>,
    spawn_count: AtomicUsize,
    history: Mutex<Vec<(TaskId, u32)>>,
}

impl MockTaskRunner {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_outcome: Mutex::new(MockOutcome::success()),
            spawn_count: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Script successive attempts for one task id. Exhausted scripts fall
    /// back to the default outcome.
    pub fn script(&self, task_id: impl Into<TaskId>, outcomes: Vec<MockOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.into(), outcomes.into());
    }

    pub fn set_default(&self, outcome: MockOutcome) {
        *self.default_outcome.lock().unwrap() = outcome;
    }

    /// How many attempts actually started.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// `(task_id, attempt)` pairs in dispatch order.
    pub fn history(&self) -> Vec<(TaskId, u32)> {
        self.history.lock().unwrap().clone()
    }

    fn next_outcome(&self, task_id: &str) -> MockOutcome {
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .get_mut(task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_outcome.lock().unwrap().clone())
    }
}

impl Default for MockTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TaskRunner for MockTaskRunner {
    async fn run(&self, task: &Task, attempt: u32, cancel: &CancelToken) -> ExecutionResult {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        self.history
            .lock()
            .unwrap()
            .push((task.id.clone(), attempt));
        let outcome = self.next_outcome(&task.id);
        let started_at = Utc::now();

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(outcome.delay) => false,
            _ = cancel.cancelled() => true,
        };

        if cancelled {
            let mut result = ExecutionResult::cancelled(&task.id);
            result.started_at = started_at;
            result.attempts = attempt;
            return result;
        }

        let success = outcome.exit_code == 0;
        ExecutionResult {
            task_id: task.id.clone(),
            success,
            exit_code: Some(outcome.exit_code),
            error: if success {
                None
            } else {
                outcome.error.clone().or_else(|| {
                    Some(format!("process exited with code {}", outcome.exit_code))
                })
            },
            entries: outcome.entries,
            session_id: outcome.session_id,
            attempts: attempt,
            started_at,
            completed_at: Utc::now(),
        }
    }
}
