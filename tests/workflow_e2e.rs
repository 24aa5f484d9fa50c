//! Linear workflow orchestration end to end over the mock runner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor::engine::{EngineConfig, ExecutionEngine};
use conductor::events::{EntryType, NormalizedEntry};
use conductor::process::ProcessManager;
use conductor::resilience::ResilientExecutor;
use conductor::testing::{MockOutcome, MockTaskRunner};
use conductor::workflow::{
    LifecycleService, StartOptions, WorkflowConfig, WorkflowDefinition, WorkflowError,
    WorkflowOrchestrator, WorkflowStatus, WorkflowStep,
};

fn stack() -> (WorkflowOrchestrator, Arc<MockTaskRunner>) {
    let runner = Arc::new(MockTaskRunner::new());
    let manager = Arc::new(ProcessManager::new(4));
    let engine = Arc::new(ExecutionEngine::with_runner(
        EngineConfig::default(),
        runner.clone(),
        manager,
    ));
    let resilient = Arc::new(ResilientExecutor::new(engine));
    (WorkflowOrchestrator::new(resilient), runner)
}

fn step(id: &str, template: &str) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        task_type: "custom".to_string(),
        prompt_template: template.to_string(),
        dependencies: Vec::new(),
        config: None,
        retry_policy: None,
    }
}

fn definition(id: &str, steps: Vec<WorkflowStep>, config: WorkflowConfig) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        name: None,
        steps,
        config,
    }
}

fn assistant_entry(index: u64, content: &str) -> NormalizedEntry {
    NormalizedEntry::new(index, EntryType::AssistantMessage, content)
}

struct RecordingLifecycle {
    cleaned: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait::async_trait]
impl LifecycleService for RecordingLifecycle {
    async fn cleanup_execution(&self, execution_id: &str) -> anyhow::Result<()> {
        self.cleaned.lock().unwrap().push(execution_id.to_string());
        if self.fail {
            anyhow::bail!("cleanup exploded");
        }
        Ok(())
    }
}

#[tokio::test]
async fn steps_run_in_order_and_share_outputs() {
    let (orchestrator, runner) = stack();
    runner.script(
        "exec-1::plan",
        vec![MockOutcome::success()
            .with_entries(vec![assistant_entry(0, "1. read 2. write")])],
    );
    runner.script("exec-1::build", vec![MockOutcome::success()]);

    let execution_id = orchestrator
        .start_workflow(
            definition(
                "wf-chain",
                vec![
                    step("plan", "Plan the work in {{ workdir }}"),
                    step("build", "Build using: {{ previous_output }}"),
                ],
                WorkflowConfig::default(),
            ),
            "/tmp/repo",
            StartOptions {
                execution_id: Some("exec-1".to_string()),
            },
        )
        .unwrap();
    assert_eq!(execution_id, "exec-1");

    let execution = orchestrator.wait_for_workflow("exec-1").await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.step_results.len(), 2);
    assert!(execution.step_results.iter().all(|result| result.success));
    assert_eq!(execution.step_results[0].output, "1. read 2. write");
    assert_eq!(execution.current_step, 2);
    assert!(execution.completed_at.is_some());

    // The dispatch order followed the definition order.
    let history = runner.history();
    assert_eq!(history[0].0, "exec-1::plan");
    assert_eq!(history[1].0, "exec-1::build");
}

#[tokio::test]
async fn step_failure_stops_by_default() {
    let (orchestrator, runner) = stack();
    runner.script("exec-2::first", vec![MockOutcome::failure(2)]);

    orchestrator
        .start_workflow(
            definition(
                "wf-stop",
                vec![step("first", "one"), step("second", "two")],
                WorkflowConfig::default(),
            ),
            "/tmp",
            StartOptions {
                execution_id: Some("exec-2".to_string()),
            },
        )
        .unwrap();

    let execution = orchestrator.wait_for_workflow("exec-2").await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(execution.step_results.len(), 1);
    assert!(!execution.step_results[0].success);
    // The second step never ran.
    assert_eq!(runner.spawn_count(), 1);
}

#[tokio::test]
async fn continue_on_step_failure_runs_the_rest() {
    let (orchestrator, runner) = stack();
    runner.script("exec-3::first", vec![MockOutcome::failure(2)]);
    runner.script("exec-3::second", vec![MockOutcome::success()]);

    orchestrator
        .start_workflow(
            definition(
                "wf-continue",
                vec![step("first", "one"), step("second", "two")],
                WorkflowConfig {
                    continue_on_step_failure: true,
                    ..WorkflowConfig::default()
                },
            ),
            "/tmp",
            StartOptions {
                execution_id: Some("exec-3".to_string()),
            },
        )
        .unwrap();

    let execution = orchestrator.wait_for_workflow("exec-3").await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.step_results.len(), 2);
    assert!(!execution.step_results[0].success);
    assert!(execution.step_results[1].success);
}

#[tokio::test]
async fn cancellation_is_checked_between_steps() {
    let (orchestrator, runner) = stack();
    runner.set_default(MockOutcome::success().with_delay(Duration::from_millis(150)));

    orchestrator
        .start_workflow(
            definition(
                "wf-cancel",
                vec![step("a", "one"), step("b", "two"), step("c", "three")],
                WorkflowConfig::default(),
            ),
            "/tmp",
            StartOptions {
                execution_id: Some("exec-4".to_string()),
            },
        )
        .unwrap();

    // Cancel while the first step is in flight: it runs to completion, the
    // rest never start.
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel_workflow("exec-4").unwrap();

    let execution = orchestrator.wait_for_workflow("exec-4").await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Cancelled);
    assert_eq!(execution.step_results.len(), 1);
    assert!(execution.step_results[0].success);
    assert_eq!(runner.spawn_count(), 1);
}

#[tokio::test]
async fn cleanup_runs_on_every_terminal_outcome() {
    let (orchestrator, runner) = stack();
    let lifecycle = Arc::new(RecordingLifecycle {
        cleaned: Mutex::new(Vec::new()),
        fail: false,
    });
    let orchestrator = orchestrator.with_lifecycle(lifecycle.clone());

    runner.script("ok::only", vec![MockOutcome::success()]);
    runner.script("bad::only", vec![MockOutcome::failure(2)]);

    orchestrator
        .start_workflow(
            definition("wf-ok", vec![step("only", "x")], WorkflowConfig::default()),
            "/tmp",
            StartOptions {
                execution_id: Some("ok".to_string()),
            },
        )
        .unwrap();
    orchestrator.wait_for_workflow("ok").await.unwrap();

    orchestrator
        .start_workflow(
            definition("wf-bad", vec![step("only", "x")], WorkflowConfig::default()),
            "/tmp",
            StartOptions {
                execution_id: Some("bad".to_string()),
            },
        )
        .unwrap();
    orchestrator.wait_for_workflow("bad").await.unwrap();

    let mut cleaned = lifecycle.cleaned.lock().unwrap().clone();
    cleaned.sort();
    assert_eq!(cleaned, vec!["bad".to_string(), "ok".to_string()]);
}

#[tokio::test]
async fn cleanup_errors_never_propagate() {
    let (orchestrator, _runner) = stack();
    let lifecycle = Arc::new(RecordingLifecycle {
        cleaned: Mutex::new(Vec::new()),
        fail: true,
    });
    let orchestrator = orchestrator.with_lifecycle(lifecycle.clone());

    orchestrator
        .start_workflow(
            definition("wf", vec![step("only", "x")], WorkflowConfig::default()),
            "/tmp",
            StartOptions {
                execution_id: Some("exec-5".to_string()),
            },
        )
        .unwrap();

    let execution = orchestrator.wait_for_workflow("exec-5").await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(*lifecycle.cleaned.lock().unwrap(), vec!["exec-5".to_string()]);
}

#[tokio::test]
async fn duplicate_and_unknown_executions_are_rejected() {
    let (orchestrator, _runner) = stack();
    orchestrator
        .start_workflow(
            definition("wf", vec![step("a", "x")], WorkflowConfig::default()),
            "/tmp",
            StartOptions {
                execution_id: Some("same".to_string()),
            },
        )
        .unwrap();
    let err = orchestrator
        .start_workflow(
            definition("wf2", vec![step("a", "x")], WorkflowConfig::default()),
            "/tmp",
            StartOptions {
                execution_id: Some("same".to_string()),
            },
        )
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateExecution(_)));

    assert!(matches!(
        orchestrator.cancel_workflow("missing"),
        Err(WorkflowError::UnknownExecution(_))
    ));
    assert!(orchestrator.get_execution("missing").is_none());
}
