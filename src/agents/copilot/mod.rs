//! GitHub Copilot CLI agent: free-form text on stdout, session id discovered
//! through the debug log directory.

pub mod discovery;
mod normalizer;

pub use normalizer::{
    format_session_marker, parse_session_marker, strip_ansi, PlainTextNormalizer,
    SESSION_MARKER_PREFIX,
};

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    apply_task_settings, probe_binary, pump_process_output, AgentAdapter, AgentCapabilities,
    AgentConfig, AgentError, AgentExecutor, AgentProtocol, ApprovalService, SpawnedChild,
};
use crate::engine::task::Task;
use crate::normalize::OutputNormalizer;
use crate::process::{
    ProcessConfig, ProcessConfigBuilder, ProcessId, ProcessManager, ProcessMode,
};

const DEFAULT_PROGRAM: &str = "copilot";

/// Flags the executor owns for log discovery; user args may not collide.
const MANAGED_FLAGS: &[&str] = &["--log-dir", "--log-level", "--no-color", "--resume"];

pub struct CopilotAdapter;

impl AgentAdapter for CopilotAdapter {
    fn name(&self) -> &'static str {
        "copilot"
    }

    fn display_name(&self) -> &'static str {
        "GitHub Copilot CLI"
    }

    fn supported_modes(&self) -> &'static [ProcessMode] {
        &[ProcessMode::Hybrid]
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_structured_output(&self) -> bool {
        false
    }

    fn build_process_config(&self, config: &AgentConfig) -> Result<ProcessConfig, AgentError> {
        let program = config
            .program
            .clone()
            .unwrap_or_else(|| DEFAULT_PROGRAM.to_string());
        let mut builder = ProcessConfigBuilder::new(&program)
            .arg("--no-color")
            .args(["--log-level", "debug"])
            .mode(ProcessMode::Hybrid);

        if let Some(model) = &config.model {
            builder = builder.args(["--model", model]);
        }
        if config.auto_approve {
            builder = builder.arg("--allow-all-tools");
        }
        for tool in &config.allowed_tools {
            builder = builder.args(["--allow-tool", tool]);
        }
        for tool in &config.disallowed_tools {
            builder = builder.args(["--deny-tool", tool]);
        }
        for arg in &config.extra_args {
            builder = builder.arg(arg);
        }
        builder = builder.envs(config.env.iter());

        Ok(builder.build())
    }

    fn validate_config(&self, config: &AgentConfig) -> Vec<String> {
        let mut errors = Vec::new();
        for tool in &config.allowed_tools {
            if config.disallowed_tools.contains(tool) {
                errors.push(format!("tool '{tool}' is both allowed and denied"));
            }
        }
        if !config.mcp_servers.is_empty() {
            errors.push("copilot does not support MCP servers".to_string());
        }
        for flag in MANAGED_FLAGS {
            if config.extra_args.iter().any(|arg| arg == flag) {
                errors.push(format!("extra_args may not contain managed flag '{flag}'"));
            }
        }
        errors
    }
}

/// Executor for the plain-text agent. The prompt goes in on stdin; a
/// background poller watches the log directory and injects the session
/// marker into the same line stream the normalizer consumes.
pub struct CopilotExecutor {
    adapter: CopilotAdapter,
    config: AgentConfig,
    approval: Mutex<Option<Arc<dyn ApprovalService>>>,
    poll_interval: Duration,
    discovery_timeout: Duration,
}

impl CopilotExecutor {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            adapter: CopilotAdapter,
            config,
            approval: Mutex::new(None),
            poll_interval: discovery::POLL_INTERVAL,
            discovery_timeout: discovery::DISCOVERY_TIMEOUT,
        }
    }

    /// Shorten the discovery cadence; used by tests.
    pub fn with_discovery_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.discovery_timeout = timeout;
        self
    }

    async fn launch(
        &self,
        task: &Task,
        resume_session: Option<&str>,
        manager: &Arc<ProcessManager>,
    ) -> Result<SpawnedChild, AgentError> {
        let errors = self.adapter.validate_config(&self.config);
        if !errors.is_empty() {
            return Err(AgentError::InvalidConfig(errors.join("; ")));
        }

        let log_dir = discovery::create_log_dir(self.adapter.name(), &task.work_dir)?;
        let mut config = self.adapter.build_process_config(&self.config)?;
        config.args.push("--log-dir".to_string());
        config.args.push(log_dir.to_string_lossy().to_string());
        if let Some(session_id) = resume_session {
            config.args.push("--resume".to_string());
            config.args.push(session_id.to_string());
        }
        apply_task_settings(&mut config, task);
        config.stdin = Some(task.prompt.clone());

        let process = manager.acquire(config)?;
        let process_id = process.lock().await.id;
        let pumps = pump_process_output(&process).await?;

        // Fire-and-forget discovery tied to the child's lifetime: the marker
        // is just another line in the stream, and a timeout is non-fatal.
        let marker_tx = pumps.lines_tx.clone();
        let poll_interval = self.poll_interval;
        let timeout = self.discovery_timeout;
        tokio::spawn(async move {
            match discovery::discover_session_id(&log_dir, poll_interval, timeout).await {
                Some(session_id) => {
                    let marker = format_session_marker(&session_id);
                    let _ = marker_tx.send(marker.trim_end().to_string());
                }
                None => {
                    tracing::warn!(
                        "Session id discovery timed out after {timeout:?} in {}",
                        log_dir.display()
                    );
                }
            }
        });

        Ok(SpawnedChild {
            process_id,
            process,
            lines: pumps.lines_rx,
            exit: pumps.exit_rx,
        })
    }
}

#[async_trait::async_trait]
impl AgentExecutor for CopilotExecutor {
    fn adapter(&self) -> &dyn AgentAdapter {
        &self.adapter
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            supports_session_resume: true,
            requires_setup: true,
            supports_approvals: false,
            supports_mcp: false,
            protocol: AgentProtocol::Custom,
            supports_mid_execution_messages: false,
        }
    }

    async fn execute_task(
        &self,
        task: &Task,
        manager: &Arc<ProcessManager>,
    ) -> Result<SpawnedChild, AgentError> {
        self.launch(task, None, manager).await
    }

    async fn resume_task(
        &self,
        task: &Task,
        session_id: &str,
        manager: &Arc<ProcessManager>,
    ) -> Result<SpawnedChild, AgentError> {
        self.launch(task, Some(session_id), manager).await
    }

    async fn interrupt(
        &self,
        process_id: ProcessId,
        manager: &Arc<ProcessManager>,
    ) -> Result<(), AgentError> {
        manager.terminate(process_id)?;
        Ok(())
    }

    fn normalizer(&self, _work_dir: &Path) -> Box<dyn OutputNormalizer> {
        Box::new(PlainTextNormalizer::new())
    }

    async fn check_availability(&self) -> bool {
        let program = self.config.program.as_deref().unwrap_or(DEFAULT_PROGRAM);
        probe_binary(program).await
    }

    fn set_approval_service(&self, service: Arc<dyn ApprovalService>) {
        *self.approval.lock().unwrap() = Some(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_config_carries_log_discovery_flags() {
        let adapter = CopilotAdapter;
        let config = adapter.build_process_config(&AgentConfig::default()).unwrap();
        assert_eq!(config.program, "copilot");
        assert!(config.args.contains(&"--no-color".to_string()));
        let pos = config.args.iter().position(|a| a == "--log-level").unwrap();
        assert_eq!(config.args[pos + 1], "debug");
    }

    #[test]
    fn mcp_servers_are_rejected() {
        let adapter = CopilotAdapter;
        let errors = adapter.validate_config(&AgentConfig {
            mcp_servers: vec![crate::acp::protocol::McpServer {
                name: "fs".into(),
                command: "mcp-fs".into(),
                args: vec![],
                env: Default::default(),
            }],
            ..AgentConfig::default()
        });
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("MCP"));
    }

    #[test]
    fn managed_flags_in_extra_args_are_rejected() {
        let adapter = CopilotAdapter;
        let errors = adapter.validate_config(&AgentConfig {
            extra_args: vec!["--log-dir".into(), "/tmp/x".into()],
            ..AgentConfig::default()
        });
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("--log-dir"));
    }
}
