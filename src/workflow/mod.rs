//! Linear workflow orchestrator
//!
//! Runs a definition's steps in order, each through the resilience layer.
//! Prompts are Tera templates with prior step outputs in scope.
//! Cancellation is checked between steps only; a step in flight runs to its
//! own terminal state. Every terminal outcome triggers the optional
//! lifecycle cleanup hook, whose errors are logged and never propagated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::engine::{Task, TaskConfig};
use crate::events::EntryType;
use crate::resilience::{ResilientExecutor, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Unknown workflow execution: {0}")]
    UnknownExecution(String),

    #[error("Workflow execution already exists: {0}")]
    DuplicateExecution(String),

    #[error("Workflow definition has no steps: {0}")]
    EmptyDefinition(String),

    #[error("Orchestrator is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowStep {
    pub id: String,
    pub task_type: String,
    /// Tera template; `workdir`, `previous_output`, and `steps.<id>` are in
    /// scope.
    pub prompt_template: String,
    /// Informational for readers; execution order is the definition order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config: Option<TaskConfig>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WorkflowConfig {
    /// Log a checkpoint every N completed steps; 0 disables.
    pub checkpoint_interval: u32,
    pub continue_on_step_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Concatenated assistant output of the step's final attempt.
    pub output: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub definition_id: String,
    pub status: WorkflowStatus,
    pub step_results: Vec<StepResult>,
    /// Index of the next step to run.
    pub current_step: usize,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// External cleanup invoked on every terminal outcome.
#[async_trait::async_trait]
pub trait LifecycleService: Send + Sync {
    async fn cleanup_execution(&self, execution_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub execution_id: Option<String>,
}

type Waiters = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<WorkflowExecution>>>>>;

/// Drives linear workflows over the resilience layer.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    resilient: Arc<ResilientExecutor>,
    lifecycle: Option<Arc<dyn LifecycleService>>,
    executions: Arc<Mutex<HashMap<String, WorkflowExecution>>>,
    waiters: Waiters,
}

impl WorkflowOrchestrator {
    pub fn new(resilient: Arc<ResilientExecutor>) -> Self {
        Self {
            resilient,
            lifecycle: None,
            executions: Arc::new(Mutex::new(HashMap::new())),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifecycleService>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Start a workflow in the background and return its execution id.
    pub fn start_workflow(
        &self,
        definition: WorkflowDefinition,
        base_work_dir: impl Into<PathBuf>,
        options: StartOptions,
    ) -> Result<String, WorkflowError> {
        if definition.steps.is_empty() {
            return Err(WorkflowError::EmptyDefinition(definition.id));
        }
        let execution_id = options
            .execution_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let mut executions = self.executions.lock().unwrap();
            if executions.contains_key(&execution_id) {
                return Err(WorkflowError::DuplicateExecution(execution_id));
            }
            executions.insert(
                execution_id.clone(),
                WorkflowExecution {
                    id: execution_id.clone(),
                    definition_id: definition.id.clone(),
                    status: WorkflowStatus::Pending,
                    step_results: Vec::new(),
                    current_step: 0,
                    cancel_requested: false,
                    started_at: Utc::now(),
                    completed_at: None,
                },
            );
        }

        let orchestrator = self.clone();
        let base_work_dir = base_work_dir.into();
        let id = execution_id.clone();
        tokio::spawn(async move {
            orchestrator.drive(definition, base_work_dir, id).await;
        });
        Ok(execution_id)
    }

    /// Request cancellation; the flag is read between steps, never
    /// mid-step.
    pub fn cancel_workflow(&self, execution_id: &str) -> Result<(), WorkflowError> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| WorkflowError::UnknownExecution(execution_id.to_string()))?;
        execution.cancel_requested = true;
        Ok(())
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.executions.lock().unwrap().get(execution_id).cloned()
    }

    /// Await the terminal state of an execution.
    pub async fn wait_for_workflow(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let rx = {
            let executions = self.executions.lock().unwrap();
            let execution = executions
                .get(execution_id)
                .ok_or_else(|| WorkflowError::UnknownExecution(execution_id.to_string()))?;
            if execution.status.is_terminal() {
                return Ok(execution.clone());
            }
            let (tx, rx) = oneshot::channel();
            self.waiters
                .lock()
                .unwrap()
                .entry(execution_id.to_string())
                .or_default()
                .push(tx);
            rx
        };
        rx.await.map_err(|_| WorkflowError::ShutDown)
    }

    async fn drive(
        &self,
        definition: WorkflowDefinition,
        base_work_dir: PathBuf,
        execution_id: String,
    ) {
        self.update(&execution_id, |execution| {
            execution.status = WorkflowStatus::Running;
        });
        tracing::info!(
            "Workflow {} started ({} step(s))",
            execution_id,
            definition.steps.len()
        );

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut previous_output = String::new();
        let mut terminal = WorkflowStatus::Completed;

        for (index, step) in definition.steps.iter().enumerate() {
            let cancel_requested = self
                .get_execution(&execution_id)
                .map(|execution| execution.cancel_requested)
                .unwrap_or(true);
            if cancel_requested {
                tracing::info!("Workflow {execution_id} cancelled before step {}", step.id);
                terminal = WorkflowStatus::Cancelled;
                break;
            }

            let prompt = match render_prompt(
                &step.prompt_template,
                &base_work_dir,
                &previous_output,
                &outputs,
            ) {
                Ok(prompt) => prompt,
                Err(e) => {
                    let result = StepResult {
                        step_id: step.id.clone(),
                        task_id: String::new(),
                        success: false,
                        error: Some(format!("prompt template error: {e}")),
                        output: String::new(),
                        attempts: 0,
                    };
                    self.push_step_result(&execution_id, result, index);
                    if definition.config.continue_on_step_failure {
                        continue;
                    }
                    terminal = WorkflowStatus::Failed;
                    break;
                }
            };

            let task_id = format!("{execution_id}::{}", step.id);
            let mut task = Task::new(&task_id, &step.task_type, prompt, &base_work_dir);
            if let Some(config) = &step.config {
                task.config = config.clone();
            }
            // Step dependencies stay informational: linear order already
            // guarantees the referenced steps ran.

            let result = self
                .resilient
                .execute_task(task, step.retry_policy.clone())
                .await;

            let output = result
                .final_attempt
                .as_ref()
                .map(assistant_output)
                .unwrap_or_default();
            let error = if result.success {
                None
            } else if result.circuit_breaker_triggered {
                Some("circuit breaker open".to_string())
            } else {
                result
                    .final_attempt
                    .as_ref()
                    .and_then(|attempt| attempt.error.clone())
            };

            let step_result = StepResult {
                step_id: step.id.clone(),
                task_id,
                success: result.success,
                error,
                output: output.clone(),
                attempts: result.total_attempts,
            };
            let success = step_result.success;
            self.push_step_result(&execution_id, step_result, index);

            if success {
                outputs.insert(step.id.clone(), output.clone());
                previous_output = output;
            }

            if definition.config.checkpoint_interval > 0
                && (index as u32 + 1) % definition.config.checkpoint_interval == 0
            {
                tracing::info!(
                    "Workflow {execution_id} checkpoint after step {} ({}/{})",
                    step.id,
                    index + 1,
                    definition.steps.len()
                );
            }

            if !success && !definition.config.continue_on_step_failure {
                terminal = WorkflowStatus::Failed;
                break;
            }
        }

        if let Some(snapshot) = self.finish(&execution_id, terminal) {
            let waiters = self
                .waiters
                .lock()
                .unwrap()
                .remove(&execution_id)
                .unwrap_or_default();
            for waiter in waiters {
                let _ = waiter.send(snapshot.clone());
            }
        }

        if let Some(lifecycle) = &self.lifecycle {
            if let Err(e) = lifecycle.cleanup_execution(&execution_id).await {
                tracing::warn!("Workflow {execution_id} cleanup failed: {e}");
            }
        }
    }

    fn update<F>(&self, execution_id: &str, mutate: F)
    where
        F: FnOnce(&mut WorkflowExecution),
    {
        let mut executions = self.executions.lock().unwrap();
        if let Some(execution) = executions.get_mut(execution_id) {
            mutate(execution);
        }
    }

    fn push_step_result(&self, execution_id: &str, result: StepResult, index: usize) {
        self.update(execution_id, |execution| {
            execution.step_results.push(result);
            execution.current_step = index + 1;
        });
    }

    fn finish(&self, execution_id: &str, status: WorkflowStatus) -> Option<WorkflowExecution> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions.get_mut(execution_id)?;
        execution.status = status;
        execution.completed_at = Some(Utc::now());
        tracing::info!("Workflow {execution_id} finished: {status:?}");
        Some(execution.clone())
    }
}

/// Render a step prompt with the workflow context in scope.
fn render_prompt(
    template: &str,
    work_dir: &Path,
    previous_output: &str,
    outputs: &HashMap<String, String>,
) -> Result<String, tera::Error> {
    let mut context = tera::Context::new();
    context.insert("workdir", &work_dir.to_string_lossy());
    context.insert("previous_output", previous_output);
    context.insert("steps", outputs);
    tera::Tera::one_off(template, &context, false)
}

/// Concatenated assistant-message content of a task's entries.
fn assistant_output(result: &crate::engine::ExecutionResult) -> String {
    result
        .entries
        .iter()
        .filter(|entry| matches!(entry.entry_type, EntryType::AssistantMessage))
        .map(|entry| entry.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prompt_substitutes_context() {
        let mut outputs = HashMap::new();
        outputs.insert("plan".to_string(), "the plan".to_string());
        let rendered = render_prompt(
            "In {{ workdir }}: apply {{ steps.plan }} after {{ previous_output }}",
            Path::new("/repo"),
            "earlier",
            &outputs,
        )
        .unwrap();
        assert_eq!(rendered, "In /repo: apply the plan after earlier");
    }

    #[test]
    fn render_prompt_reports_template_errors() {
        let outputs = HashMap::new();
        let result = render_prompt("{{ missing_var }}", Path::new("/repo"), "", &outputs);
        assert!(result.is_err());
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let definition: WorkflowDefinition = serde_json::from_str(
            r#"{
                "id": "wf-1",
                "steps": [
                    {"id": "plan", "task_type": "spec", "prompt_template": "Plan {{ workdir }}"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(definition.steps.len(), 1);
        assert_eq!(definition.config.checkpoint_interval, 0);
        assert!(!definition.config.continue_on_step_failure);
    }
}
