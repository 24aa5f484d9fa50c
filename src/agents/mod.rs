//! Agent adapters and executors
//!
//! An *adapter* knows how to turn an [`AgentConfig`] into a spawnable
//! [`ProcessConfig`] and how to validate it. An *executor* drives one agent
//! end to end: launch (fresh or resumed), optional mid-session messages,
//! interrupt, and normalization of the agent's wire protocol into the
//! unified event stream. Executors are registered globally in
//! [`registry`] and resolved by name.

pub mod claude;
pub mod copilot;
pub mod gemini;
pub mod registry;

pub use claude::ClaudeExecutor;
pub use copilot::CopilotExecutor;
pub use gemini::GeminiExecutor;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};

use crate::acp::protocol::McpServer;
use crate::acp::AcpError;
use crate::engine::task::Task;
use crate::normalize::OutputNormalizer;
use crate::process::{
    ExitOutcome, ProcessConfig, ProcessError, ProcessId, ProcessManager, ProcessMode,
    SharedProcess,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {agent} does not support {operation}")]
    Unsupported { agent: String, operation: String },

    #[error("Agent not available: {0}")]
    NotAvailable(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] AcpError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Wire protocol an agent speaks on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentProtocol {
    StreamJson,
    Jsonl,
    Acp,
    Custom,
}

/// Capability descriptor driving feature gating across the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentCapabilities {
    pub supports_session_resume: bool,
    pub requires_setup: bool,
    pub supports_approvals: bool,
    pub supports_mcp: bool,
    pub protocol: AgentProtocol,
    pub supports_mid_execution_messages: bool,
}

/// User-facing per-agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AgentConfig {
    /// Override for the agent binary path. Defaults to the adapter's
    /// well-known name on `$PATH`.
    pub program: Option<String>,
    pub model: Option<String>,
    pub auto_approve: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
    pub mcp_servers: Vec<McpServer>,
    pub metadata: serde_json::Map<String, Value>,
}

/// Per-agent metadata plus config/argv construction.
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn supported_modes(&self) -> &'static [ProcessMode];
    fn supports_streaming(&self) -> bool;
    fn supports_structured_output(&self) -> bool;

    /// Build the base process config for this agent. Task-specific pieces
    /// (working directory, prompt, resume flags, timeouts) are layered on by
    /// the executor.
    fn build_process_config(&self, config: &AgentConfig) -> Result<ProcessConfig, AgentError>;

    /// Accumulate every problem with `config`; an empty list means valid.
    fn validate_config(&self, config: &AgentConfig) -> Vec<String>;

    fn default_config(&self) -> AgentConfig {
        AgentConfig::default()
    }
}

/// Decision returned by an approval service, passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub agent: String,
    pub tool_name: String,
    pub description: String,
    pub metadata: Option<Value>,
}

/// Optional approval hook. When no service is set, executors auto-approve.
#[async_trait::async_trait]
pub trait ApprovalService: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// A launched agent child, ready for the scheduling engine to drive.
///
/// `lines` delivers the child's normalizable output one line at a time
/// (including any synthetic lines an executor injects); `exit` resolves with
/// the task's logical exit. Protocol executors that outlive their prompt
/// turn may synthesize the outcome instead of reporting the raw child exit.
pub struct SpawnedChild {
    pub process_id: ProcessId,
    pub process: SharedProcess,
    pub lines: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<ExitOutcome>,
}

/// Uniform driver interface over one agent, regardless of wire protocol.
#[async_trait::async_trait]
pub trait AgentExecutor: Send + Sync {
    fn adapter(&self) -> &dyn AgentAdapter;
    fn capabilities(&self) -> AgentCapabilities;

    async fn execute_task(
        &self,
        task: &Task,
        manager: &Arc<ProcessManager>,
    ) -> Result<SpawnedChild, AgentError>;

    /// Resume a previous session. Fails for agents without session resume.
    async fn resume_task(
        &self,
        _task: &Task,
        _session_id: &str,
        _manager: &Arc<ProcessManager>,
    ) -> Result<SpawnedChild, AgentError> {
        Err(AgentError::Unsupported {
            agent: self.adapter().name().to_string(),
            operation: "session resume".to_string(),
        })
    }

    /// Deliver a message into a running execution. Capability-gated.
    async fn send_message(&self, _process_id: ProcessId, _text: &str) -> Result<(), AgentError> {
        Err(AgentError::Unsupported {
            agent: self.adapter().name().to_string(),
            operation: "mid-execution messages".to_string(),
        })
    }

    /// Protocol-specific interrupt for a running execution.
    async fn interrupt(
        &self,
        process_id: ProcessId,
        manager: &Arc<ProcessManager>,
    ) -> Result<(), AgentError>;

    /// Fresh stateful normalizer for one task's output stream.
    fn normalizer(&self, work_dir: &Path) -> Box<dyn OutputNormalizer>;

    async fn check_availability(&self) -> bool;

    fn set_approval_service(&self, service: Arc<dyn ApprovalService>);
}

/// Probe for an agent binary by running `<program> --version`.
pub(crate) async fn probe_binary(program: &str) -> bool {
    let result = tokio::process::Command::new(program)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!("Agent binary {program} not available: {e}");
            false
        }
    }
}

/// Stream pumps shared by the line-oriented executors: stdout lines fan into
/// an injectable channel, stderr is logged, and a waiter task reaps the
/// child and reports its real exit.
pub(crate) struct StdioPumps {
    pub lines_tx: mpsc::UnboundedSender<String>,
    pub lines_rx: mpsc::UnboundedReceiver<String>,
    pub exit_rx: oneshot::Receiver<ExitOutcome>,
}

pub(crate) async fn pump_process_output(
    process: &SharedProcess,
) -> Result<StdioPumps, AgentError> {
    let (lines_tx, lines_rx) = mpsc::unbounded_channel::<String>();
    let (exit_tx, exit_rx) = oneshot::channel::<ExitOutcome>();

    let (stdout, stderr, id, activity) = {
        let mut proc = process.lock().await;
        let stdout = proc
            .take_stdout()
            .ok_or_else(|| AgentError::Session("process stdout already taken".into()))?;
        (stdout, proc.take_stderr(), proc.id, proc.activity())
    };

    let stdout_process = Arc::clone(process);
    let stdout_tx = lines_tx.clone();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        let mut count = 0u64;
        while let Ok(Some(line)) = lines.next_line().await {
            count += 1;
            activity.touch();
            if stdout_tx.send(line).is_err() {
                break;
            }
        }
        let mut proc = stdout_process.lock().await;
        proc.stats.stdout_lines += count;
    });

    if let Some(stderr) = stderr {
        let stderr_process = Arc::clone(process);
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            let mut count = 0u64;
            while let Ok(Some(line)) = lines.next_line().await {
                count += 1;
                tracing::debug!(process = %id, "agent stderr: {line}");
            }
            let mut proc = stderr_process.lock().await;
            proc.stats.stderr_lines += count;
        });
    }

    let waiter_process = Arc::clone(process);
    tokio::spawn(async move {
        let outcome = {
            let mut proc = waiter_process.lock().await;
            proc.wait().await
        };
        match outcome {
            Ok(outcome) => {
                let _ = exit_tx.send(outcome);
            }
            Err(e) => {
                tracing::warn!("Failed to reap agent process: {e}");
                let _ = exit_tx.send(ExitOutcome {
                    code: None,
                    signal: None,
                });
            }
        }
    });

    Ok(StdioPumps {
        lines_tx,
        lines_rx,
        exit_rx,
    })
}

/// Layer task-level settings over an adapter-produced process config.
pub(crate) fn apply_task_settings(config: &mut ProcessConfig, task: &Task) {
    config.working_dir = Some(task.work_dir.clone());
    if let Some(timeout) = task.config.timeout {
        config.timeout = Some(timeout);
    }
    for (key, value) in &task.config.env {
        config.env.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_default_is_permissive() {
        let config = AgentConfig::default();
        assert!(config.program.is_none());
        assert!(!config.auto_approve);
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn agent_protocol_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&AgentProtocol::StreamJson).unwrap(),
            "\"stream-json\""
        );
        assert_eq!(
            serde_json::to_string(&AgentProtocol::Acp).unwrap(),
            "\"acp\""
        );
    }

    #[tokio::test]
    async fn probe_binary_detects_missing_program() {
        assert!(!probe_binary("definitely-not-a-real-binary-404").await);
    }
}
