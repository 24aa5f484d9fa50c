//! Host-side services for the protocol connection: permissions, file
//! access, terminals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::terminal::TerminalManager;
use crate::acp::protocol::{
    option_of_kind, CreateTerminalParams, CreateTerminalResult, PermissionOptionKind,
    ReadTextFileParams, ReadTextFileResult, RequestPermissionOutcome, RequestPermissionParams,
    RequestPermissionResult, RpcError, TerminalIdParams, TerminalOutputResult,
    WaitForExitResult, WriteTextFileParams,
};
use crate::acp::AcpDelegate;
use crate::agents::{ApprovalDecision, ApprovalRequest, ApprovalService};

pub struct GeminiDelegate {
    agent_name: String,
    auto_approve: bool,
    approval: Option<Arc<dyn ApprovalService>>,
    work_dir: PathBuf,
    terminals: TerminalManager,
}

impl GeminiDelegate {
    pub fn new(
        agent_name: &str,
        auto_approve: bool,
        approval: Option<Arc<dyn ApprovalService>>,
        work_dir: PathBuf,
    ) -> Self {
        let terminals = TerminalManager::new(work_dir.clone());
        Self {
            agent_name: agent_name.to_string(),
            auto_approve,
            approval,
            work_dir,
            terminals,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

fn selected(option_id: &str) -> RequestPermissionResult {
    RequestPermissionResult {
        outcome: RequestPermissionOutcome::Selected {
            option_id: option_id.to_string(),
        },
    }
}

fn cancelled() -> RequestPermissionResult {
    RequestPermissionResult {
        outcome: RequestPermissionOutcome::Cancelled,
    }
}

#[async_trait::async_trait]
impl AcpDelegate for GeminiDelegate {
    /// Permission policy: auto-approve picks the first `allow_once` option
    /// (falling back to the first option); a configured approval service
    /// maps approve/deny onto `allow_once`/`reject_once`, cancelling when
    /// the expected option is missing; otherwise `reject_once`.
    async fn request_permission(
        &self,
        params: RequestPermissionParams,
    ) -> Result<RequestPermissionResult, RpcError> {
        let options = &params.options;

        if self.auto_approve {
            let option = option_of_kind(options, PermissionOptionKind::AllowOnce)
                .or_else(|| options.first());
            return Ok(match option {
                Some(option) => selected(&option.option_id),
                None => cancelled(),
            });
        }

        if let Some(service) = &self.approval {
            let tool_name = params
                .tool_call
                .title
                .clone()
                .or_else(|| params.tool_call.kind.clone())
                .unwrap_or_else(|| params.tool_call.tool_call_id.clone());
            let decision = service
                .request_approval(ApprovalRequest {
                    agent: self.agent_name.clone(),
                    tool_name: tool_name.clone(),
                    description: format!("Agent requests permission to run {tool_name}"),
                    metadata: params.tool_call.raw_input.clone(),
                })
                .await;
            let wanted = match decision {
                ApprovalDecision::Approved => PermissionOptionKind::AllowOnce,
                ApprovalDecision::Denied => PermissionOptionKind::RejectOnce,
                ApprovalDecision::Timeout => return Ok(cancelled()),
            };
            return Ok(match option_of_kind(options, wanted) {
                Some(option) => selected(&option.option_id),
                None => cancelled(),
            });
        }

        Ok(match option_of_kind(options, PermissionOptionKind::RejectOnce) {
            Some(option) => selected(&option.option_id),
            None => cancelled(),
        })
    }

    async fn read_text_file(
        &self,
        params: ReadTextFileParams,
    ) -> Result<ReadTextFileResult, RpcError> {
        let path = self.resolve(&params.path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RpcError::internal(format!("read {}: {e}", path.display())))?;

        let content = match (params.line, params.limit) {
            (None, None) => content,
            (line, limit) => {
                let start = line.map(|l| l.saturating_sub(1) as usize).unwrap_or(0);
                let lines: Vec<&str> = content.lines().collect();
                let end = limit
                    .map(|l| (start + l as usize).min(lines.len()))
                    .unwrap_or(lines.len());
                lines[start.min(lines.len())..end].join("\n")
            }
        };
        Ok(ReadTextFileResult { content })
    }

    async fn write_text_file(&self, params: WriteTextFileParams) -> Result<(), RpcError> {
        let path = self.resolve(&params.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RpcError::internal(format!("mkdir {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, params.content)
            .await
            .map_err(|e| RpcError::internal(format!("write {}: {e}", path.display())))
    }

    async fn create_terminal(
        &self,
        params: CreateTerminalParams,
    ) -> Result<CreateTerminalResult, RpcError> {
        self.terminals.create(params)
    }

    async fn terminal_output(
        &self,
        params: TerminalIdParams,
    ) -> Result<TerminalOutputResult, RpcError> {
        self.terminals.output(&params.terminal_id)
    }

    async fn release_terminal(&self, params: TerminalIdParams) -> Result<(), RpcError> {
        self.terminals.release(&params.terminal_id)
    }

    async fn wait_for_terminal_exit(
        &self,
        params: TerminalIdParams,
    ) -> Result<WaitForExitResult, RpcError> {
        self.terminals.wait_for_exit(&params.terminal_id).await
    }

    async fn kill_terminal(&self, params: TerminalIdParams) -> Result<(), RpcError> {
        self.terminals.kill(&params.terminal_id)
    }
}
