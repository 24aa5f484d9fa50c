//! Resilience layer integration: retry policy and circuit breaking over
//! the engine, with the mock runner's spawn counter proving that an open
//! circuit never reaches the process layer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor::engine::{EngineConfig, ExecutionEngine, Task};
use conductor::process::ProcessManager;
use conductor::resilience::{
    CircuitBreakerConfig, CircuitState, ResilientExecutor, RetryPolicy,
};
use conductor::testing::{MockOutcome, MockTaskRunner};

fn stack(max_concurrent: usize) -> (Arc<ResilientExecutor>, Arc<MockTaskRunner>) {
    let runner = Arc::new(MockTaskRunner::new());
    let manager = Arc::new(ProcessManager::new(max_concurrent));
    let engine = Arc::new(ExecutionEngine::with_runner(
        EngineConfig {
            max_concurrent,
            ..EngineConfig::default()
        },
        runner.clone(),
        manager,
    ));
    (Arc::new(ResilientExecutor::new(engine)), runner)
}

fn spec_task(id: &str) -> Task {
    Task::new(id, "spec", "write the spec", "/tmp")
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: false,
        ..RetryPolicy::default()
    }
}

#[tokio::test]
async fn circuit_opens_and_short_circuits_without_spawning() {
    let (resilient, runner) = stack(2);
    runner.set_default(MockOutcome::failure(2));

    let opened: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let opened = opened.clone();
        resilient.on_circuit_open(move |name| opened.lock().unwrap().push(name.to_string()));
    }

    // Exit code 2 is not retryable, so each task burns exactly one attempt.
    for i in 0..5 {
        let result = resilient
            .execute_task(spec_task(&format!("s{i}")), Some(fast_policy(1)))
            .await;
        assert!(!result.success);
        assert!(!result.circuit_breaker_triggered);
        assert_eq!(result.total_attempts, 1);
    }

    assert_eq!(resilient.circuit_state("spec"), Some(CircuitState::Open));
    assert_eq!(*opened.lock().unwrap(), vec!["spec".to_string()]);
    assert_eq!(runner.spawn_count(), 5);

    // The sixth task short-circuits: no submission, no spawn.
    let result = resilient
        .execute_task(spec_task("s5"), Some(fast_policy(1)))
        .await;
    assert!(!result.success);
    assert!(result.circuit_breaker_triggered);
    assert!(result.final_attempt.is_none());
    assert_eq!(runner.spawn_count(), 5);

    resilient.engine().shutdown().await;
}

#[tokio::test]
async fn breaker_is_scoped_per_task_type() {
    let (resilient, runner) = stack(2);
    runner.set_default(MockOutcome::failure(2));

    for i in 0..5 {
        resilient
            .execute_task(spec_task(&format!("s{i}")), Some(fast_policy(1)))
            .await;
    }
    assert_eq!(resilient.circuit_state("spec"), Some(CircuitState::Open));

    // A different task type has its own breaker and still executes.
    runner.script("issue-1", vec![MockOutcome::success()]);
    let result = resilient
        .execute_task(
            Task::new("issue-1", "issue", "fix", "/tmp"),
            Some(fast_policy(1)),
        )
        .await;
    assert!(result.success);
    assert_eq!(resilient.circuit_state("issue"), Some(CircuitState::Closed));

    resilient.engine().shutdown().await;
}

#[tokio::test]
async fn retryable_failure_retries_and_records_attempts() {
    let (resilient, runner) = stack(2);
    // Exit code 1 is retryable by default.
    runner.script(
        "flaky",
        vec![MockOutcome::failure(1), MockOutcome::success()],
    );

    let retries: Arc<Mutex<Vec<(String, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let retries = retries.clone();
        resilient.on_retry_attempt(move |task_id, attempt| {
            retries.lock().unwrap().push((task_id.to_string(), attempt));
        });
    }

    let result = resilient
        .execute_task(spec_task("flaky"), Some(fast_policy(3)))
        .await;

    assert!(result.success);
    assert_eq!(result.total_attempts, 2);
    assert_eq!(result.attempts.len(), 2);
    assert!(!result.attempts[0].success);
    assert!(result.attempts[0].will_retry);
    assert!(result.attempts[1].success);
    assert!(!result.attempts[1].will_retry);
    assert_eq!(*retries.lock().unwrap(), vec![("flaky".to_string(), 1)]);

    resilient.engine().shutdown().await;
}

#[tokio::test]
async fn non_retryable_error_stops_immediately() {
    let (resilient, runner) = stack(2);
    runner.set_default(MockOutcome::failure(2).with_error("segfault"));

    let result = resilient
        .execute_task(spec_task("hard"), Some(fast_policy(3)))
        .await;

    assert!(!result.success);
    assert_eq!(result.total_attempts, 1);
    assert!(!result.attempts[0].will_retry);
    assert_eq!(runner.spawn_count(), 1);

    resilient.engine().shutdown().await;
}

#[tokio::test]
async fn retryable_error_substring_matches() {
    let (resilient, runner) = stack(2);
    runner.script(
        "netty",
        vec![
            MockOutcome::failure(7).with_error("connect: ECONNREFUSED"),
            MockOutcome::success(),
        ],
    );

    let result = resilient
        .execute_task(spec_task("netty"), Some(fast_policy(2)))
        .await;
    assert!(result.success);
    assert_eq!(result.total_attempts, 2);

    resilient.engine().shutdown().await;
}

#[tokio::test]
async fn reset_closes_an_open_breaker() {
    let (resilient, runner) = stack(2);
    runner.set_default(MockOutcome::failure(2));

    for i in 0..5 {
        resilient
            .execute_task(spec_task(&format!("s{i}")), Some(fast_policy(1)))
            .await;
    }
    assert_eq!(resilient.circuit_state("spec"), Some(CircuitState::Open));

    resilient.reset_circuit_breaker("spec");
    assert_eq!(resilient.circuit_state("spec"), Some(CircuitState::Closed));

    runner.script("after-reset", vec![MockOutcome::success()]);
    let result = resilient
        .execute_task(spec_task("after-reset"), Some(fast_policy(1)))
        .await;
    assert!(result.success);

    resilient.engine().shutdown().await;
}

#[tokio::test]
async fn half_open_recovery_closes_after_successes() {
    let runner = Arc::new(MockTaskRunner::new());
    let manager = Arc::new(ProcessManager::new(2));
    let engine = Arc::new(ExecutionEngine::with_runner(
        EngineConfig::default(),
        runner.clone(),
        manager,
    ));
    let resilient = ResilientExecutor::new(engine).with_breaker_config(CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 2,
        timeout: Duration::from_millis(50),
    });

    runner.set_default(MockOutcome::failure(2));
    for i in 0..2 {
        resilient
            .execute_task(spec_task(&format!("f{i}")), Some(fast_policy(1)))
            .await;
    }
    assert_eq!(resilient.circuit_state("spec"), Some(CircuitState::Open));

    tokio::time::sleep(Duration::from_millis(80)).await;
    runner.set_default(MockOutcome::success());
    for i in 0..2 {
        let result = resilient
            .execute_task(spec_task(&format!("r{i}")), Some(fast_policy(1)))
            .await;
        assert!(result.success);
    }
    assert_eq!(resilient.circuit_state("spec"), Some(CircuitState::Closed));

    resilient.engine().shutdown().await;
}
