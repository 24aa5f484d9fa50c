//! Resilience layer
//!
//! Wraps the scheduling engine with a retry policy and a per-task-type
//! circuit breaker. Every attempt is recorded; an open circuit
//! short-circuits before anything is submitted to the engine.

pub mod circuit;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use retry::{Backoff, RetryPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::engine::{ExecutionEngine, ExecutionResult, Task, TaskId};

/// One attempt as seen by the resilience layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub will_retry: bool,
}

/// Aggregated outcome of a resilient execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilientExecutionResult {
    pub task_id: TaskId,
    pub success: bool,
    pub circuit_breaker_triggered: bool,
    pub attempts: Vec<ExecutionAttempt>,
    pub total_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_attempt: Option<ExecutionResult>,
}

type RetryHook = Arc<dyn Fn(&str, u32) + Send + Sync>;
type CircuitHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Retry + circuit-breaker wrapper over the engine.
pub struct ResilientExecutor {
    engine: Arc<ExecutionEngine>,
    default_policy: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    retry_hooks: Mutex<Vec<RetryHook>>,
    open_hooks: Mutex<Vec<CircuitHook>>,
}

impl ResilientExecutor {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            default_policy: RetryPolicy::default(),
            breaker_config: CircuitBreakerConfig::default(),
            breakers: Mutex::new(HashMap::new()),
            retry_hooks: Mutex::new(Vec::new()),
            open_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Fires for each non-terminal failure (one that will be retried).
    pub fn on_retry_attempt<F>(&self, hook: F)
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.retry_hooks.lock().unwrap().push(Arc::new(hook));
    }

    /// Fires when a breaker transitions to open; the transition is recorded
    /// before the hook runs.
    pub fn on_circuit_open<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.open_hooks.lock().unwrap().push(Arc::new(hook));
    }

    /// The breaker for a task type, created on first use.
    pub fn breaker(&self, task_type: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        Arc::clone(breakers.entry(task_type.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                task_type,
                self.breaker_config.clone(),
            ))
        }))
    }

    pub fn circuit_state(&self, task_type: &str) -> Option<CircuitState> {
        self.breakers
            .lock()
            .unwrap()
            .get(task_type)
            .map(|breaker| breaker.state())
    }

    /// Force a breaker closed and zero its counters.
    pub fn reset_circuit_breaker(&self, task_type: &str) {
        if let Some(breaker) = self.breakers.lock().unwrap().get(task_type) {
            breaker.reset();
        }
    }

    /// Execute a task through the engine under the retry policy, consulting
    /// the task-type breaker before every submission.
    pub async fn execute_task(
        &self,
        task: Task,
        policy: Option<RetryPolicy>,
    ) -> ResilientExecutionResult {
        let policy = policy.unwrap_or_else(|| self.default_policy.clone());
        let breaker = self.breaker(&task.task_type);
        let mut attempts: Vec<ExecutionAttempt> = Vec::new();

        for attempt_number in 1..=policy.max_attempts.max(1) {
            if !breaker.can_execute() {
                tracing::warn!(
                    "Circuit {} open, short-circuiting task {}",
                    task.task_type,
                    task.id
                );
                let total_attempts = attempts.len() as u32;
                return ResilientExecutionResult {
                    task_id: task.id.clone(),
                    success: false,
                    circuit_breaker_triggered: true,
                    attempts,
                    total_attempts,
                    final_attempt: None,
                };
            }

            let started_at = Utc::now();
            let result = self.run_once(task.clone()).await;

            if result.success {
                breaker.record_success();
                attempts.push(ExecutionAttempt {
                    attempt_number,
                    started_at,
                    success: true,
                    error: None,
                    will_retry: false,
                });
                let total_attempts = attempts.len() as u32;
                return ResilientExecutionResult {
                    task_id: task.id.clone(),
                    success: true,
                    circuit_breaker_triggered: false,
                    attempts,
                    total_attempts,
                    final_attempt: Some(result),
                };
            }

            if breaker.record_failure() {
                let hooks: Vec<CircuitHook> = self.open_hooks.lock().unwrap().clone();
                for hook in hooks {
                    hook(&task.task_type);
                }
            }

            let will_retry = attempt_number < policy.max_attempts
                && policy.is_retryable(result.error.as_deref(), result.exit_code);
            attempts.push(ExecutionAttempt {
                attempt_number,
                started_at,
                success: false,
                error: result.error.clone(),
                will_retry,
            });

            if !will_retry {
                let total_attempts = attempts.len() as u32;
                return ResilientExecutionResult {
                    task_id: task.id.clone(),
                    success: false,
                    circuit_breaker_triggered: false,
                    attempts,
                    total_attempts,
                    final_attempt: Some(result),
                };
            }

            let hooks: Vec<RetryHook> = self.retry_hooks.lock().unwrap().clone();
            for hook in hooks {
                hook(&task.id, attempt_number);
            }

            let delay = policy.jittered(policy.delay_for_attempt(attempt_number));
            tracing::info!(
                "Retrying task {} (attempt {}/{}) after {delay:?}",
                task.id,
                attempt_number + 1,
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }

        // Unreachable: the loop always returns. Kept for totality.
        let total_attempts = attempts.len() as u32;
        ResilientExecutionResult {
            task_id: task.id,
            success: false,
            circuit_breaker_triggered: false,
            attempts,
            total_attempts,
            final_attempt: None,
        }
    }

    /// One engine round trip. The id is released afterwards so a retry can
    /// resubmit it.
    async fn run_once(&self, task: Task) -> ExecutionResult {
        let id = task.id.clone();
        let submitted = self.engine.submit_task(task);
        let result = match submitted {
            Ok(_) => match self.engine.wait_for_task(&id).await {
                Ok(result) => result,
                Err(e) => ExecutionResult::failure(&id, e.to_string()),
            },
            Err(e) => ExecutionResult::failure(&id, e.to_string()),
        };
        self.engine.forget_task(&id);
        result
    }
}
