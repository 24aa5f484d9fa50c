//! Process supervision for external agent binaries
//!
//! The [`ProcessManager`] owns every live child process: it spawns them with
//! piped stdio, enforces a slot limit, tracks liveness and exit outcomes,
//! and tears everything down on shutdown. Executors borrow a
//! [`ManagedProcess`] handle for the duration of one task; the manager keeps
//! the authoritative map.

pub mod config;
pub mod error;

pub use config::{ProcessConfig, ProcessConfigBuilder, ProcessMode};
pub use error::{format_process_error, ProcessError};

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use uuid::Uuid;

pub type ProcessId = Uuid;

/// Shared handle to a live child. The manager holds one reference; the
/// executor driving the task holds the other.
pub type SharedProcess = Arc<tokio::sync::Mutex<ManagedProcess>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Busy,
    Idle,
}

/// Terminal outcome of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    pub fn error_string(&self) -> String {
        format_process_error(self.code, self.signal)
    }
}

/// Small per-process activity counters, filled in by whichever executor
/// drains the streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStats {
    pub stdout_lines: u64,
    pub stderr_lines: u64,
}

/// Lock-free liveness record shared between the handle, the stream pumps,
/// and the watchdog. Watchdogs must never take the handle mutex: an
/// executor holds it across the child's whole lifetime while waiting.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    last_activity_ms: Arc<AtomicI64>,
    timed_out: Arc<AtomicBool>,
}

impl ActivityTracker {
    fn new() -> Self {
        Self {
            last_activity_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    pub fn idle_for(&self) -> Duration {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis().saturating_sub(ms);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }
}

/// A child process owned by the [`ProcessManager`].
///
/// Streams are always present on a freshly spawned handle; executors take
/// them out exactly once via the `take_*` accessors.
#[derive(Debug)]
pub struct ManagedProcess {
    pub id: ProcessId,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub mode: ProcessMode,
    pub spawned_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub stats: ProcessStats,
    activity: ActivityTracker,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ManagedProcess {
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    pub fn activity(&self) -> ActivityTracker {
        self.activity.clone()
    }

    pub fn touch(&self) {
        self.activity.touch();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity.last_activity()
    }

    pub fn timed_out(&self) -> bool {
        self.activity.timed_out()
    }

    /// Wait for the child to exit and record the outcome on the handle.
    pub async fn wait(&mut self) -> Result<ExitOutcome, ProcessError> {
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => {
                return Ok(ExitOutcome {
                    code: self.exit_code,
                    signal: self.term_signal,
                })
            }
        };

        let status = child.wait().await?;
        let code = status.code();
        let signal = {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            }
            #[cfg(not(unix))]
            {
                None
            }
        };

        self.exit_code = code;
        self.term_signal = signal;
        self.status = ProcessStatus::Idle;
        self.activity.touch();
        Ok(ExitOutcome { code, signal })
    }
}

/// Point-in-time view of one active process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub pid: Option<u32>,
    pub mode: ProcessMode,
    pub spawned_at: DateTime<Utc>,
}

/// Defensive snapshot of manager-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessManagerMetrics {
    pub active: usize,
    pub total_spawned: u64,
    pub total_released: u64,
    pub total_timeouts: u64,
}

struct ProcessEntry {
    handle: SharedProcess,
    pid: Option<u32>,
    mode: ProcessMode,
    spawned_at: DateTime<Utc>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
}

struct ManagerState {
    active: HashMap<ProcessId, ProcessEntry>,
    total_spawned: u64,
    total_released: u64,
    total_timeouts: Arc<AtomicU64>,
}

/// Slot-limited supervisor for agent child processes.
pub struct ProcessManager {
    max_processes: usize,
    state: Mutex<ManagerState>,
    shut_down: AtomicBool,
}

impl ProcessManager {
    pub fn new(max_processes: usize) -> Self {
        Self {
            max_processes,
            state: Mutex::new(ManagerState {
                active: HashMap::new(),
                total_spawned: 0,
                total_released: 0,
                total_timeouts: Arc::new(AtomicU64::new(0)),
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Spawn a child for `config` and register it.
    ///
    /// Refuses with [`ProcessError::PoolExhausted`] when every slot is in
    /// use; the scheduling engine requeues in that case rather than blocking
    /// here. The returned handle always carries live stdio streams.
    pub fn acquire(&self, config: ProcessConfig) -> Result<SharedProcess, ProcessError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ProcessError::ShutDown);
        }

        let mut state = self.state.lock().unwrap();
        if state.active.len() >= self.max_processes {
            return Err(ProcessError::PoolExhausted {
                limit: self.max_processes,
            });
        }

        tracing::debug!(
            "Spawning agent process: {} {}",
            config.program,
            config.args.join(" ")
        );

        let mut cmd = tokio::process::Command::new(&config.program);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(config.program.clone())
            } else {
                ProcessError::SpawnFailed {
                    command: config.program.clone(),
                    source: e,
                }
            }
        })?;

        let id = Uuid::new_v4();
        let pid = child.id();
        let now = Utc::now();

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Stdin payload implies one-shot input: write it and close. Agents
        // that keep a stdio conversation open pass no payload and take the
        // handle themselves.
        if let Some(payload) = config.stdin.clone() {
            if let Some(mut pipe) = stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = pipe.write_all(payload.as_bytes()).await {
                        tracing::warn!("Failed to write stdin payload: {e}");
                        return;
                    }
                    if let Err(e) = pipe.shutdown().await {
                        tracing::warn!("Failed to close child stdin: {e}");
                    }
                });
            }
        }

        let activity = ActivityTracker::new();
        let handle: SharedProcess = Arc::new(tokio::sync::Mutex::new(ManagedProcess {
            id,
            pid,
            status: ProcessStatus::Busy,
            mode: config.mode,
            spawned_at: now,
            exit_code: None,
            term_signal: None,
            stats: ProcessStats::default(),
            activity: activity.clone(),
            child: Some(child),
            stdin,
            stdout,
            stderr,
        }));

        let watchdog = if config.timeout.is_some() || config.idle_timeout.is_some() {
            pid.map(|pid| {
                let timeouts = Arc::clone(&state.total_timeouts);
                tokio::spawn(watchdog_loop(
                    pid,
                    config.timeout,
                    config.idle_timeout,
                    activity,
                    timeouts,
                ))
            })
        } else {
            None
        };

        state.active.insert(
            id,
            ProcessEntry {
                handle: Arc::clone(&handle),
                pid,
                mode: config.mode,
                spawned_at: now,
                watchdog,
            },
        );
        state.total_spawned += 1;

        Ok(handle)
    }

    /// Remove a process from the active set, terminating it if it is still
    /// running.
    pub async fn release(&self, id: ProcessId) -> Result<(), ProcessError> {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .active
                .remove(&id)
                .ok_or(ProcessError::UnknownProcess(id))?;
            state.total_released += 1;
            entry
        };

        reap_or_terminate(entry).await;
        Ok(())
    }

    /// Send a signal to a managed process by id.
    pub fn signal(&self, id: ProcessId, signal: Signal) -> Result<(), ProcessError> {
        let pid = {
            let state = self.state.lock().unwrap();
            state
                .active
                .get(&id)
                .ok_or(ProcessError::UnknownProcess(id))?
                .pid
        };
        match pid {
            Some(pid) => kill(Pid::from_raw(pid as i32), signal).map_err(|source| {
                ProcessError::SignalFailed {
                    pid: pid as i32,
                    source,
                }
            }),
            None => Ok(()),
        }
    }

    /// Politely stop a managed process (SIGTERM now, escalation at release).
    pub fn terminate(&self, id: ProcessId) -> Result<(), ProcessError> {
        self.signal(id, Signal::SIGTERM)
    }

    /// Terminate every child and clear the active set. Idempotent; when this
    /// returns no child remains and no watchdog timer is pending.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let entries: Vec<ProcessEntry> = {
            let mut state = self.state.lock().unwrap();
            state.active.drain().map(|(_, entry)| entry).collect()
        };

        if entries.is_empty() {
            return;
        }

        tracing::debug!("Shutting down {} active process(es)", entries.len());
        let terminations: Vec<_> = entries.into_iter().map(reap_or_terminate).collect();
        futures::future::join_all(terminations).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> ProcessManagerMetrics {
        let state = self.state.lock().unwrap();
        ProcessManagerMetrics {
            active: state.active.len(),
            total_spawned: state.total_spawned,
            total_released: state.total_released,
            total_timeouts: state.total_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn active_processes(&self) -> Vec<ProcessInfo> {
        let state = self.state.lock().unwrap();
        state
            .active
            .iter()
            .map(|(id, entry)| ProcessInfo {
                id: *id,
                pid: entry.pid,
                mode: entry.mode,
                spawned_at: entry.spawned_at,
            })
            .collect()
    }
}

/// Stop a child on its way out of the active set. When the handle is free
/// we reap directly; when an executor is mid-wait on it, a pid-level
/// SIGTERM lets that wait return and reap for us.
async fn reap_or_terminate(entry: ProcessEntry) {
    if let Some(watchdog) = entry.watchdog {
        watchdog.abort();
    }

    match entry.handle.try_lock() {
        Ok(mut proc) => {
            if proc.exit_code.is_some() || proc.term_signal.is_some() {
                return;
            }
            if let Some(pid) = entry.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            if tokio::time::timeout(Duration::from_secs(5), proc.wait())
                .await
                .is_err()
            {
                if let Some(pid) = entry.pid {
                    tracing::warn!("Process {pid} survived SIGTERM, sending SIGKILL");
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = proc.wait().await;
            }
        }
        Err(_) => {
            if let Some(pid) = entry.pid {
                terminate_pid(pid, Duration::from_secs(5)).await;
            }
        }
    }
}

/// Enforce hard and idle timeouts by liveness polling. Never takes the
/// handle mutex: the executor reaping the child holds it for the child's
/// whole lifetime.
async fn watchdog_loop(
    pid: u32,
    timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    activity: ActivityTracker,
    timeouts: Arc<AtomicU64>,
) {
    let target = Pid::from_raw(pid as i32);
    let started = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if kill(target, None).is_err() {
            // Child is gone.
            return;
        }

        let hard_expired = timeout
            .map(|t| started.elapsed() >= t)
            .unwrap_or(false);
        let idle_expired = idle_timeout
            .map(|t| activity.idle_for() >= t)
            .unwrap_or(false);
        if hard_expired || idle_expired {
            activity.mark_timed_out();
            timeouts.fetch_add(1, Ordering::Relaxed);
            if hard_expired {
                tracing::warn!("Process {pid} exceeded its timeout, sending SIGTERM");
            } else {
                tracing::warn!("Process {pid} idle past its idle timeout, sending SIGTERM");
            }
            let _ = kill(target, Signal::SIGTERM);
            return;
        }
    }
}

/// SIGTERM, poll for exit within the grace period, then SIGKILL.
async fn terminate_pid(pid: u32, grace: Duration) {
    let target = Pid::from_raw(pid as i32);
    if kill(target, Signal::SIGTERM).is_err() {
        // Already gone.
        return;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if kill(target, None).is_err() {
            return;
        }
    }

    tracing::warn!("Process {pid} survived SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_spawns_with_streams_present() {
        let manager = ProcessManager::new(2);
        let handle = manager
            .acquire(ProcessConfigBuilder::new("echo").arg("hi").build())
            .unwrap();

        {
            let mut proc = handle.lock().await;
            assert!(proc.take_stdout().is_some());
            assert!(proc.take_stderr().is_some());
            let outcome = proc.wait().await.unwrap();
            assert!(outcome.success());
        }
        manager.release(handle.lock().await.id).await.unwrap();
        assert_eq!(manager.metrics().active, 0);
    }

    #[tokio::test]
    async fn acquire_refuses_when_full() {
        let manager = ProcessManager::new(1);
        let first = manager
            .acquire(ProcessConfigBuilder::new("sleep").arg("5").build())
            .unwrap();

        let err = manager
            .acquire(ProcessConfigBuilder::new("echo").build())
            .unwrap_err();
        assert!(matches!(err, ProcessError::PoolExhausted { limit: 1 }));

        let id = first.lock().await.id;
        let active = manager.active_processes();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].pid, first.lock().await.pid);
        assert_eq!(active[0].mode, ProcessMode::Structured);

        manager.release(id).await.unwrap();
        assert!(manager.active_processes().is_empty());
        manager
            .acquire(ProcessConfigBuilder::new("echo").build())
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let manager = ProcessManager::new(1);
        let err = manager
            .acquire(ProcessConfigBuilder::new("definitely-not-a-real-binary-404").build())
            .unwrap_err();
        assert!(matches!(err, ProcessError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_clears_children() {
        let manager = ProcessManager::new(4);
        manager
            .acquire(ProcessConfigBuilder::new("sleep").arg("30").build())
            .unwrap();
        manager
            .acquire(ProcessConfigBuilder::new("sleep").arg("30").build())
            .unwrap();

        manager.shutdown().await;
        assert_eq!(manager.metrics().active, 0);
        manager.shutdown().await;
        assert_eq!(manager.metrics().active, 0);

        let err = manager
            .acquire(ProcessConfigBuilder::new("echo").build())
            .unwrap_err();
        assert!(matches!(err, ProcessError::ShutDown));
    }

    #[tokio::test]
    async fn timeout_watchdog_terminates_child() {
        let manager = ProcessManager::new(1);
        let handle = manager
            .acquire(
                ProcessConfigBuilder::new("sleep")
                    .arg("30")
                    .timeout(Duration::from_millis(100))
                    .build(),
            )
            .unwrap();

        let outcome = {
            let mut proc = handle.lock().await;
            proc.wait().await.unwrap()
        };
        assert!(!outcome.success());
        assert_eq!(outcome.signal, Some(15));
        assert!(handle.lock().await.timed_out());
    }

    #[tokio::test]
    async fn idle_watchdog_terminates_silent_child() {
        let manager = ProcessManager::new(1);
        let handle = manager
            .acquire(
                ProcessConfigBuilder::new("sleep")
                    .arg("30")
                    .idle_timeout(Duration::from_millis(150))
                    .build(),
            )
            .unwrap();

        let outcome = {
            let mut proc = handle.lock().await;
            proc.wait().await.unwrap()
        };
        assert_eq!(outcome.signal, Some(15));
        assert!(handle.lock().await.timed_out());
    }
}
