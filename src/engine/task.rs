//! Task model: the immutable unit of work plus its engine-internal record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::events::NormalizedEntry;
use crate::process::ProcessId;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Per-task knobs; everything here is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TaskConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Engine-level retries: a failing task re-enters the queue front up to
    /// this many extra attempts before the failure event fires.
    pub max_retries: u32,
    /// Agent to run the task with; the engine default applies when unset.
    pub agent: Option<String>,
    /// Resume this session instead of starting fresh.
    pub resume_session: Option<String>,
    pub env: HashMap<String, String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Unit of work submitted to the engine. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Open task-type tag (`issue`, `spec`, `custom`, ...); also the circuit
    /// breaker key in the resilience layer.
    pub task_type: String,
    pub prompt: String,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub priority: i32,
    /// Ids of tasks that must complete successfully first.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub config: TaskConfig,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        task_type: impl Into<String>,
        prompt: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            prompt: prompt.into(),
            work_dir: work_dir.into(),
            priority: 0,
            dependencies: Vec::new(),
            created_at: Utc::now(),
            config: TaskConfig::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.agent = Some(agent.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }
}

/// Terminal outcome of one task handed back to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub entries: Vec<NormalizedEntry>,
    pub session_id: Option<String>,
    /// Attempts actually made, counting the first run.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn failure(task_id: impl Into<TaskId>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            success: false,
            exit_code: None,
            error: Some(error.into()),
            entries: Vec::new(),
            session_id: None,
            attempts: 0,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn cancelled(task_id: impl Into<TaskId>) -> Self {
        Self::failure(task_id, "cancelled")
    }

    pub fn duration(&self) -> Duration {
        (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Engine-internal mutable state wrapped around a submitted task.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub process_id: Option<ProcessId>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Queued,
            attempts: 0,
            started_at: None,
            completed_at: None,
            process_id: None,
            last_error: None,
            cancel_requested: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_helpers_compose() {
        let task = Task::new("t1", "issue", "fix it", "/tmp/repo")
            .with_priority(5)
            .with_dependencies(["t0"])
            .with_max_retries(2)
            .with_agent("gemini");
        assert_eq!(task.priority, 5);
        assert_eq!(task.dependencies, vec!["t0"]);
        assert_eq!(task.config.max_retries, 2);
        assert_eq!(task.config.agent.as_deref(), Some("gemini"));
    }

    #[test]
    fn task_config_serde_defaults() {
        let config: TaskConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_retries, 0);
        assert!(config.timeout.is_none());

        let config: TaskConfig =
            serde_json::from_str(r#"{"timeout":"30s","max_retries":2}"#).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }
}
