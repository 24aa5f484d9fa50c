//! Scheduling engine
//!
//! Bounded-concurrency dispatch over a FIFO readiness queue: tasks wait for
//! their dependencies, run on free slots, retry at the queue front, and
//! report terminal outcomes through completion events and awaitable
//! results. A single mutex-serialized state block owns the queue, the
//! record map, and the slot counter; execution itself is injected through
//! [`TaskRunner`] so tests can drive mock children.

pub mod runner;
pub mod task;

pub use runner::{DefaultTaskRunner, TaskRunner};
pub use task::{ExecutionResult, Task, TaskConfig, TaskId, TaskStatus};

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

use crate::process::ProcessManager;
use task::TaskRecord;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Task already submitted: {0}")]
    DuplicateTask(TaskId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Engine is shut down")]
    ShutDown,
}

/// Cooperative cancellation signal handed to the runner.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub default_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_agent: "claude".to_string(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

/// Defensive snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_submitted: u64,
}

type EventHandler = Arc<dyn Fn(&ExecutionResult) + Send + Sync>;

struct EngineState {
    queue: VecDeque<TaskId>,
    records: HashMap<TaskId, TaskRecord>,
    results: HashMap<TaskId, ExecutionResult>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<ExecutionResult>>>,
    cancels: HashMap<TaskId, CancelToken>,
    running: usize,
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_submitted: u64,
    complete_handlers: Vec<EventHandler>,
    failed_handlers: Vec<EventHandler>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            records: HashMap::new(),
            results: HashMap::new(),
            waiters: HashMap::new(),
            cancels: HashMap::new(),
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            total_submitted: 0,
            complete_handlers: Vec::new(),
            failed_handlers: Vec::new(),
        }
    }

    /// All listed dependencies present in the successful-results map.
    fn dependencies_ready(&self, record: &TaskRecord) -> bool {
        record.task.dependencies.iter().all(|dep| {
            self.results
                .get(dep)
                .map(|result| result.success)
                .unwrap_or(false)
        })
    }

    /// Some dependency reached a terminal non-success outcome, so this task
    /// can never become ready.
    fn dependency_failed(&self, record: &TaskRecord) -> Option<TaskId> {
        record.task.dependencies.iter().find_map(|dep| {
            self.results
                .get(dep)
                .filter(|result| !result.success)
                .map(|_| dep.clone())
        })
    }
}

/// Engine event plus everything needed to deliver it outside the lock.
struct Finalized {
    result: ExecutionResult,
    handlers: Vec<EventHandler>,
    waiters: Vec<oneshot::Sender<ExecutionResult>>,
}

impl Finalized {
    fn deliver(self) {
        for handler in &self.handlers {
            handler(&self.result);
        }
        for waiter in self.waiters {
            let _ = waiter.send(self.result.clone());
        }
    }
}

/// Bounded-concurrency task scheduler. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ExecutionEngine {
    config: EngineConfig,
    runner: Arc<dyn TaskRunner>,
    manager: Arc<ProcessManager>,
    state: Arc<Mutex<EngineState>>,
    shut_down: Arc<AtomicBool>,
}

impl ExecutionEngine {
    /// Production engine: a process manager sized to the concurrency cap
    /// and the registry-backed default runner.
    pub fn new(config: EngineConfig) -> Self {
        let manager = Arc::new(ProcessManager::new(config.max_concurrent));
        let runner: Arc<dyn TaskRunner> = Arc::new(DefaultTaskRunner::new(
            Arc::clone(&manager),
            config.default_agent.clone(),
        ));
        Self::with_runner(config, runner, manager)
    }

    /// Engine over an injected runner; tests pass a mock.
    pub fn with_runner(
        config: EngineConfig,
        runner: Arc<dyn TaskRunner>,
        manager: Arc<ProcessManager>,
    ) -> Self {
        Self {
            config,
            runner,
            manager,
            state: Arc::new(Mutex::new(EngineState::new())),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn process_manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    /// Queue a task. Returns immediately; duplicate ids are rejected.
    pub fn submit_task(&self, task: Task) -> Result<TaskId, EngineError> {
        let ids = self.submit_tasks(vec![task])?;
        Ok(ids.into_iter().next().unwrap_or_default())
    }

    pub fn submit_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let ids = {
            let mut state = self.state.lock().unwrap();
            let mut seen: Vec<&TaskId> = Vec::new();
            for task in &tasks {
                if state.records.contains_key(&task.id)
                    || state.results.contains_key(&task.id)
                    || seen.contains(&&task.id)
                {
                    return Err(EngineError::DuplicateTask(task.id.clone()));
                }
                seen.push(&task.id);
            }

            let mut ids = Vec::with_capacity(tasks.len());
            for task in tasks {
                let id = task.id.clone();
                tracing::debug!("Queued task {id} (type {})", task.task_type);
                state.queue.push_back(id.clone());
                state.records.insert(id.clone(), TaskRecord::new(task));
                state.total_submitted += 1;
                ids.push(id);
            }
            ids
        };

        self.pump();
        Ok(ids)
    }

    /// Current status, or `None` for ids the engine has never seen (or has
    /// already cleared at shutdown).
    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        let state = self.state.lock().unwrap();
        state.records.get(id).map(|record| record.status)
    }

    /// Await the terminal result of a task.
    pub async fn wait_for_task(&self, id: &str) -> Result<ExecutionResult, EngineError> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if let Some(result) = state.results.get(id) {
                return Ok(result.clone());
            }
            if !state.records.contains_key(id) {
                return Err(EngineError::UnknownTask(id.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(id.to_string()).or_default().push(tx);
            rx
        };
        rx.await.map_err(|_| EngineError::ShutDown)
    }

    pub async fn wait_for_tasks(
        &self,
        ids: &[TaskId],
    ) -> Result<Vec<ExecutionResult>, EngineError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.wait_for_task(id).await?);
        }
        Ok(results)
    }

    /// Cancel a task: silently drop it from the queue, or interrupt it when
    /// running (the failure event then fires with reason `cancelled`).
    pub fn cancel_task(&self, id: &str) -> Result<(), EngineError> {
        let (token, finalized) = {
            let mut state = self.state.lock().unwrap();
            if let Some(pos) = state.queue.iter().position(|queued| queued == id) {
                state.queue.remove(pos);
                let record = state
                    .records
                    .get_mut(id)
                    .ok_or_else(|| EngineError::UnknownTask(id.to_string()))?;
                record.status = TaskStatus::Cancelled;
                record.completed_at = Some(Utc::now());
                state.cancelled += 1;
                let result = ExecutionResult::cancelled(id);
                state.results.insert(id.to_string(), result.clone());
                let waiters = state.waiters.remove(id).unwrap_or_default();
                // Queued cancellation fires no event.
                (
                    None,
                    Some(Finalized {
                        result,
                        handlers: Vec::new(),
                        waiters,
                    }),
                )
            } else {
                let status = state.records.get(id).map(|record| record.status);
                match status {
                    Some(TaskStatus::Running) => {
                        if let Some(record) = state.records.get_mut(id) {
                            record.cancel_requested = true;
                        }
                        (state.cancels.get(id).cloned(), None)
                    }
                    Some(_) => (None, None),
                    None if state.results.contains_key(id) => (None, None),
                    None => return Err(EngineError::UnknownTask(id.to_string())),
                }
            }
        };

        if let Some(token) = token {
            tracing::debug!("Cancelling running task {id}");
            token.cancel();
        }
        if let Some(finalized) = finalized {
            finalized.deliver();
        }
        Ok(())
    }

    pub fn metrics(&self) -> EngineMetrics {
        let state = self.state.lock().unwrap();
        EngineMetrics {
            queued: state.queue.len(),
            running: state.running,
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            total_submitted: state.total_submitted,
        }
    }

    pub fn on_task_complete<F>(&self, handler: F)
    where
        F: Fn(&ExecutionResult) + Send + Sync + 'static,
    {
        self.state
            .lock()
            .unwrap()
            .complete_handlers
            .push(Arc::new(handler));
    }

    pub fn on_task_failed<F>(&self, handler: F)
    where
        F: Fn(&ExecutionResult) + Send + Sync + 'static,
    {
        self.state
            .lock()
            .unwrap()
            .failed_handlers
            .push(Arc::new(handler));
    }

    /// Drop a terminal task entirely once its result has been consumed.
    /// Frees the id for resubmission (the resilience layer retries this
    /// way); counters are untouched.
    pub fn forget_task(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.results.remove(id);
        if state
            .records
            .get(id)
            .map(|record| record.status.is_terminal())
            .unwrap_or(false)
        {
            state.records.remove(id);
        }
    }

    /// Stop everything: clear the queue without events, interrupt running
    /// tasks, resolve outstanding waiters, tear down the process manager,
    /// and clear results and handlers. Idempotent.
    pub async fn shutdown(&self) {
        let first = !self.shut_down.swap(true, Ordering::SeqCst);

        if first {
            let (tokens, finalized) = {
                let mut state = self.state.lock().unwrap();

                let queued: Vec<TaskId> = state.queue.drain(..).collect();
                for id in &queued {
                    if let Some(record) = state.records.get_mut(id) {
                        record.status = TaskStatus::Cancelled;
                    }
                }

                let tokens: Vec<CancelToken> = state.cancels.values().cloned().collect();

                // Resolve every waiter; no events fire for any of this.
                let mut finalized = Vec::new();
                let waiters: Vec<(TaskId, Vec<oneshot::Sender<ExecutionResult>>)> =
                    state.waiters.drain().collect();
                for (id, waiters) in waiters {
                    let result = state
                        .results
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| ExecutionResult::cancelled(&id));
                    finalized.push(Finalized {
                        result,
                        handlers: Vec::new(),
                        waiters,
                    });
                }

                state.complete_handlers.clear();
                state.failed_handlers.clear();
                state.results.clear();
                state.records.clear();
                state.cancels.clear();
                state.running = 0;
                (tokens, finalized)
            };

            for token in tokens {
                token.cancel();
            }
            for finalized in finalized {
                finalized.deliver();
            }
        }

        self.manager.shutdown().await;
    }

    /// Drain ready tasks into free slots until neither is left.
    fn pump(&self) {
        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return;
            }

            // Phase 1: fail queued tasks whose dependencies can no longer
            // succeed.
            let dead = {
                let mut state = self.state.lock().unwrap();
                let mut dead = Vec::new();
                let ids: Vec<TaskId> = state.queue.iter().cloned().collect();
                for id in ids {
                    let Some(record) = state.records.get(&id) else {
                        continue;
                    };
                    if let Some(dep) = state.dependency_failed(record) {
                        let pos = state.queue.iter().position(|queued| *queued == id);
                        if let Some(pos) = pos {
                            state.queue.remove(pos);
                        }
                        let record = state.records.get_mut(&id).unwrap();
                        record.status = TaskStatus::Failed;
                        record.completed_at = Some(Utc::now());
                        state.failed += 1;
                        let result =
                            ExecutionResult::failure(&id, format!("dependency {dep} failed"));
                        state.results.insert(id.clone(), result.clone());
                        let handlers = state.failed_handlers.clone();
                        let waiters = state.waiters.remove(&id).unwrap_or_default();
                        dead.push(Finalized {
                            result,
                            handlers,
                            waiters,
                        });
                    }
                }
                dead
            };
            let had_dead = !dead.is_empty();
            for finalized in dead {
                finalized.deliver();
            }
            if had_dead {
                continue;
            }

            // Phase 2: dispatch the first ready task, with a priority
            // tiebreak between equal submission timestamps.
            let dispatch = {
                let mut state = self.state.lock().unwrap();
                if state.running >= self.config.max_concurrent {
                    None
                } else {
                    let mut best: Option<TaskId> = None;
                    for id in state.queue.iter() {
                        let Some(record) = state.records.get(id) else {
                            continue;
                        };
                        if !state.dependencies_ready(record) {
                            continue;
                        }
                        match &best {
                            None => best = Some(id.clone()),
                            Some(current) => {
                                let current_record = &state.records[current];
                                if record.task.created_at == current_record.task.created_at
                                    && record.task.priority > current_record.task.priority
                                {
                                    best = Some(id.clone());
                                }
                            }
                        }
                    }

                    best.and_then(|id| {
                        if let Some(pos) = state.queue.iter().position(|queued| *queued == id) {
                            state.queue.remove(pos);
                        }
                        let token = CancelToken::new();
                        state.cancels.insert(id.clone(), token.clone());
                        let (task, attempts) = {
                            let record = state.records.get_mut(&id)?;
                            record.status = TaskStatus::Running;
                            record.attempts += 1;
                            record.started_at = Some(Utc::now());
                            (record.task.clone(), record.attempts)
                        };
                        state.running += 1;
                        Some((task, attempts, token))
                    })
                }
            };

            let Some((task, attempt, token)) = dispatch else {
                return;
            };

            tracing::debug!("Dispatching task {} (attempt {attempt})", task.id);
            let engine = self.clone();
            tokio::spawn(async move {
                let result = engine.runner.run(&task, attempt, &token).await;
                engine.on_task_finished(task.id.clone(), result);
            });
        }
    }

    fn on_task_finished(&self, id: TaskId, mut result: ExecutionResult) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }

        let finalized = {
            let mut state = self.state.lock().unwrap();
            state.running = state.running.saturating_sub(1);
            state.cancels.remove(&id);

            let Some(record) = state.records.get_mut(&id) else {
                return;
            };
            record.completed_at = Some(Utc::now());
            record.last_error = result.error.clone();
            result.attempts = record.attempts;

            let cancelled = record.cancel_requested;
            let max_attempts = record.task.config.max_retries + 1;

            if cancelled {
                record.status = TaskStatus::Cancelled;
                state.cancelled += 1;
                result.success = false;
                if result.error.is_none() {
                    result.error = Some("cancelled".to_string());
                }
                state.results.insert(id.clone(), result.clone());
                let handlers = state.failed_handlers.clone();
                let waiters = state.waiters.remove(&id).unwrap_or_default();
                Some(Finalized {
                    result,
                    handlers,
                    waiters,
                })
            } else if result.success {
                record.status = TaskStatus::Completed;
                state.completed += 1;
                state.results.insert(id.clone(), result.clone());
                let handlers = state.complete_handlers.clone();
                let waiters = state.waiters.remove(&id).unwrap_or_default();
                Some(Finalized {
                    result,
                    handlers,
                    waiters,
                })
            } else if record.attempts < max_attempts {
                // Retry from the queue front; the failure event is
                // suppressed until the final attempt.
                tracing::debug!(
                    "Task {id} failed (attempt {}/{max_attempts}), requeueing",
                    record.attempts
                );
                record.status = TaskStatus::Queued;
                state.queue.push_front(id.clone());
                None
            } else {
                record.status = TaskStatus::Failed;
                state.failed += 1;
                state.results.insert(id.clone(), result.clone());
                let handlers = state.failed_handlers.clone();
                let waiters = state.waiters.remove(&id).unwrap_or_default();
                Some(Finalized {
                    result,
                    handlers,
                    waiters,
                })
            }
        };

        if let Some(finalized) = finalized {
            finalized.deliver();
        }
        self.pump();
    }
}
