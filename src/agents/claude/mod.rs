//! Claude Code agent: one-shot child emitting stream-JSON on stdout.

mod normalizer;

pub use normalizer::StreamJsonNormalizer;

use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{
    apply_task_settings, probe_binary, pump_process_output, AgentAdapter, AgentCapabilities,
    AgentConfig, AgentError, AgentExecutor, AgentProtocol, ApprovalService, SpawnedChild,
};
use crate::engine::task::Task;
use crate::normalize::OutputNormalizer;
use crate::process::{
    ProcessConfig, ProcessConfigBuilder, ProcessId, ProcessManager, ProcessMode,
};

const DEFAULT_PROGRAM: &str = "claude";

/// Flags the executor owns; user-supplied extra args may not collide.
const MANAGED_FLAGS: &[&str] = &["-p", "--output-format", "--verbose", "--resume"];

pub struct ClaudeAdapter;

impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn display_name(&self) -> &'static str {
        "Claude Code"
    }

    fn supported_modes(&self) -> &'static [ProcessMode] {
        &[ProcessMode::Structured]
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    fn build_process_config(&self, config: &AgentConfig) -> Result<ProcessConfig, AgentError> {
        let program = config
            .program
            .clone()
            .unwrap_or_else(|| DEFAULT_PROGRAM.to_string());
        let mut builder = ProcessConfigBuilder::new(&program)
            .arg("-p")
            .args(["--output-format", "stream-json"])
            .arg("--verbose")
            .mode(ProcessMode::Structured);

        if let Some(model) = &config.model {
            builder = builder.args(["--model", model]);
        }
        if config.auto_approve {
            builder = builder.arg("--dangerously-skip-permissions");
        }
        if !config.allowed_tools.is_empty() {
            builder = builder.args(["--allowed-tools", &config.allowed_tools.join(",")]);
        }
        if !config.disallowed_tools.is_empty() {
            builder = builder.args(["--disallowed-tools", &config.disallowed_tools.join(",")]);
        }
        if !config.mcp_servers.is_empty() {
            let mut servers = serde_json::Map::new();
            for server in &config.mcp_servers {
                servers.insert(
                    server.name.clone(),
                    serde_json::json!({
                        "command": server.command,
                        "args": server.args,
                        "env": server.env,
                    }),
                );
            }
            let mcp_config =
                serde_json::to_string(&serde_json::json!({ "mcpServers": servers }))?;
            builder = builder.args(["--mcp-config", &mcp_config]);
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
                errors.push(format!("tool '{tool}' is both allowed and disallowed"));
            }
        }
        if config.auto_approve && !config.disallowed_tools.is_empty() {
            errors.push(
                "auto_approve skips permission checks and is incompatible with disallowed_tools"
                    .to_string(),
            );
        }
        if let Some(model) = &config.model {
            if model.trim().is_empty() {
                errors.push("model must not be empty".to_string());
            }
        }
        for flag in MANAGED_FLAGS {
            if config.extra_args.iter().any(|arg| arg == flag) {
                errors.push(format!("extra_args may not contain managed flag '{flag}'"));
            }
        }
        errors
    }
}

/// One-shot executor for the Claude CLI. The prompt goes in on stdin; the
/// child streams newline-delimited JSON until it exits.
pub struct ClaudeExecutor {
    adapter: ClaudeAdapter,
    config: AgentConfig,
    approval: Mutex<Option<Arc<dyn ApprovalService>>>,
}

impl ClaudeExecutor {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            adapter: ClaudeAdapter,
            config,
            approval: Mutex::new(None),
        }
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

        let mut config = self.adapter.build_process_config(&self.config)?;
        if let Some(session_id) = resume_session {
            config.args.push("--resume".to_string());
            config.args.push(session_id.to_string());
        }
        apply_task_settings(&mut config, task);
        config.stdin = Some(task.prompt.clone());

        let process = manager.acquire(config)?;
        let process_id = process.lock().await.id;
        let pumps = pump_process_output(&process).await?;

        Ok(SpawnedChild {
            process_id,
            process,
            lines: pumps.lines_rx,
            exit: pumps.exit_rx,
        })
    }
}

#[async_trait::async_trait]
impl AgentExecutor for ClaudeExecutor {
    fn adapter(&self) -> &dyn AgentAdapter {
        &self.adapter
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            supports_session_resume: true,
            requires_setup: false,
            supports_approvals: false,
            supports_mcp: true,
            protocol: AgentProtocol::StreamJson,
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
        Box::new(StreamJsonNormalizer::new())
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
    fn build_config_includes_stream_json_flags() {
        let adapter = ClaudeAdapter;
        let config = adapter
            .build_process_config(&AgentConfig {
                model: Some("sonnet".into()),
                auto_approve: true,
                ..AgentConfig::default()
            })
            .unwrap();
        assert_eq!(config.program, "claude");
        assert!(config.args.contains(&"--output-format".to_string()));
        assert!(config.args.contains(&"stream-json".to_string()));
        assert!(config
            .args
            .contains(&"--dangerously-skip-permissions".to_string()));
        let model_pos = config.args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(config.args[model_pos + 1], "sonnet");
    }

    #[test]
    fn validation_accumulates_all_errors() {
        let adapter = ClaudeAdapter;
        let errors = adapter.validate_config(&AgentConfig {
            model: Some("  ".into()),
            auto_approve: true,
            allowed_tools: vec!["Bash".into()],
            disallowed_tools: vec!["Bash".into()],
            extra_args: vec!["--output-format".into()],
            ..AgentConfig::default()
        });
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("both allowed")));
        assert!(errors.iter().any(|e| e.contains("auto_approve")));
        assert!(errors.iter().any(|e| e.contains("must not be empty")));
        assert!(errors.iter().any(|e| e.contains("managed flag")));
    }

    #[test]
    fn valid_config_has_no_errors() {
        let adapter = ClaudeAdapter;
        assert!(adapter.validate_config(&AgentConfig::default()).is_empty());
    }
}
