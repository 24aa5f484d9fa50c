//! Task execution seam.
//!
//! The engine never talks to agents directly; it hands each dispatched task
//! to a [`TaskRunner`]. The default runner resolves the agent executor from
//! the global registry, drives the child through the process manager, and
//! folds the normalized output stream into the execution result. Tests
//! inject a scripted runner instead.

use chrono::Utc;
use std::sync::Arc;

use super::task::{ExecutionResult, Task};
use super::CancelToken;
use crate::agents::registry;
use crate::events::{apply_patch, NormalizedEntry};
use crate::process::{ExitOutcome, ProcessManager};

#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one attempt of a task to its terminal outcome. Failures are
    /// encoded in the result, never thrown.
    async fn run(&self, task: &Task, attempt: u32, cancel: &CancelToken) -> ExecutionResult;
}

/// Registry-backed runner used in production.
pub struct DefaultTaskRunner {
    manager: Arc<ProcessManager>,
    default_agent: String,
}

impl DefaultTaskRunner {
    pub fn new(manager: Arc<ProcessManager>, default_agent: String) -> Self {
        Self {
            manager,
            default_agent,
        }
    }
}

#[async_trait::async_trait]
impl TaskRunner for DefaultTaskRunner {
    async fn run(&self, task: &Task, attempt: u32, cancel: &CancelToken) -> ExecutionResult {
        let started_at = Utc::now();
        let fail = |error: String| {
            let mut result = ExecutionResult::failure(&task.id, error);
            result.started_at = started_at;
            result.attempts = attempt;
            result
        };

        let agent_name = task
            .config
            .agent
            .clone()
            .unwrap_or_else(|| self.default_agent.clone());
        let Some(executor) = registry::get_executor(&agent_name) else {
            return fail(format!("unknown agent: {agent_name}"));
        };
        if !executor.check_availability().await {
            return fail(format!("agent {agent_name} is not available"));
        }

        let spawned = match &task.config.resume_session {
            Some(session_id) => {
                executor
                    .resume_task(task, session_id, &self.manager)
                    .await
            }
            None => executor.execute_task(task, &self.manager).await,
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return fail(format!("failed to launch agent: {e}")),
        };

        let mut normalizer = executor.normalizer(&task.work_dir);
        let mut entries: Vec<NormalizedEntry> = Vec::new();
        let mut session_id: Option<String> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                maybe_line = child.lines.recv() => match maybe_line {
                    Some(line) => {
                        for patch in normalizer.process_line(&line) {
                            if session_id.is_none() {
                                session_id = patch.entry().metadata.session_id.clone();
                            }
                            apply_patch(&mut entries, patch);
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    if let Err(e) = executor.interrupt(child.process_id, &self.manager).await {
                        tracing::warn!("Interrupt failed for task {}: {e}", task.id);
                    }
                }
            }
        }
        for patch in normalizer.flush() {
            if session_id.is_none() {
                session_id = patch.entry().metadata.session_id.clone();
            }
            apply_patch(&mut entries, patch);
        }

        let outcome = child.exit.await.unwrap_or(ExitOutcome {
            code: None,
            signal: None,
        });
        let timed_out = child.process.lock().await.timed_out();
        if let Err(e) = self.manager.release(child.process_id).await {
            tracing::debug!("Release after exit: {e}");
        }

        let success = outcome.success() && !cancelled;
        let error = if cancelled {
            Some("cancelled".to_string())
        } else if success {
            None
        } else if timed_out {
            Some(match task.config.timeout {
                Some(timeout) => format!("process timeout after {timeout:?}"),
                None => "process timeout".to_string(),
            })
        } else {
            Some(outcome.error_string())
        };

        ExecutionResult {
            task_id: task.id.clone(),
            success,
            exit_code: outcome.code,
            error,
            entries,
            session_id,
            attempts: attempt,
            started_at,
            completed_at: Utc::now(),
        }
    }
}
