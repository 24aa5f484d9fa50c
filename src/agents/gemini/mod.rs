//! Gemini CLI agent, driven over the bidirectional protocol.
//!
//! The child stays resident for the whole task: the executor initializes
//! the connection, opens (or loads) a session, sends one prompt turn, and
//! mirrors every notification into both the session store and the
//! normalizable line stream. The child is torn down once the turn ends.

mod delegate;
mod normalizer;
mod terminal;

pub use delegate::GeminiDelegate;
pub use normalizer::AcpNormalizer;
pub use terminal::TerminalManager;

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};

use super::{
    apply_task_settings, probe_binary, AgentAdapter, AgentCapabilities, AgentConfig, AgentError,
    AgentExecutor, AgentProtocol, ApprovalService, SpawnedChild,
};
use crate::acp::protocol::{
    ClientCapabilities, ClientInfo, FsCapabilities, InitializeParams, LoadSessionParams,
    NewSessionParams, PromptParams, SetSessionModelParams, StopReason,
};
use crate::acp::{AcpClient, AcpSession, SessionNotification};
use crate::engine::task::Task;
use crate::events::ContentBlock;
use crate::normalize::OutputNormalizer;
use crate::process::{
    ExitOutcome, ProcessConfig, ProcessConfigBuilder, ProcessId, ProcessManager, ProcessMode,
    SharedProcess,
};
use crate::sessions::{SessionEvent, SessionStore};

const DEFAULT_PROGRAM: &str = "gemini";

const MANAGED_FLAGS: &[&str] = &["--experimental-acp"];

pub struct GeminiAdapter;

impl AgentAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn display_name(&self) -> &'static str {
        "Gemini CLI"
    }

    fn supported_modes(&self) -> &'static [ProcessMode] {
        &[ProcessMode::Interactive]
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
            .arg("--experimental-acp")
            .mode(ProcessMode::Interactive);

        if config.auto_approve {
            builder = builder.arg("--yolo");
        }
        for arg in &config.extra_args {
            builder = builder.arg(arg);
        }
        builder = builder.envs(config.env.iter());

        Ok(builder.build())
    }

    fn validate_config(&self, config: &AgentConfig) -> Vec<String> {
        let mut errors = Vec::new();
        if !config.allowed_tools.is_empty() || !config.disallowed_tools.is_empty() {
            errors.push(
                "tool allow/deny lists are not supported; permissions flow through the protocol"
                    .to_string(),
            );
        }
        for flag in MANAGED_FLAGS {
            if config.extra_args.iter().any(|arg| arg == flag) {
                errors.push(format!("extra_args may not contain managed flag '{flag}'"));
            }
        }
        errors
    }
}

#[derive(Clone)]
struct GeminiConnection {
    client: Arc<AcpClient>,
    session: Arc<Mutex<AcpSession>>,
    session_id: String,
}

type ConnectionMap = Arc<Mutex<HashMap<ProcessId, GeminiConnection>>>;

pub struct GeminiExecutor {
    adapter: GeminiAdapter,
    config: AgentConfig,
    approval: Mutex<Option<Arc<dyn ApprovalService>>>,
    store: SessionStore,
    connections: ConnectionMap,
}

impl GeminiExecutor {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            adapter: GeminiAdapter,
            config,
            approval: Mutex::new(None),
            store: SessionStore::new("gemini"),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Point the session store somewhere else; used by tests.
    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.store = store;
        self
    }

    async fn launch(
        &self,
        task: &Task,
        resume_session: Option<String>,
        manager: &Arc<ProcessManager>,
    ) -> Result<SpawnedChild, AgentError> {
        let errors = self.adapter.validate_config(&self.config);
        if !errors.is_empty() {
            return Err(AgentError::InvalidConfig(errors.join("; ")));
        }

        let mut config = self.adapter.build_process_config(&self.config)?;
        apply_task_settings(&mut config, task);

        let process = manager.acquire(config)?;
        let (process_id, stdin, stdout, stderr) = {
            let mut proc = process.lock().await;
            let stdin = proc
                .take_stdin()
                .ok_or_else(|| AgentError::Session("process stdin already taken".into()))?;
            let stdout = proc
                .take_stdout()
                .ok_or_else(|| AgentError::Session("process stdout already taken".into()))?;
            (proc.id, stdin, stdout, proc.take_stderr())
        };

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("gemini stderr: {line}");
                }
            });
        }

        let (lines_tx, lines_rx) = mpsc::unbounded_channel::<String>();
        let (exit_tx, exit_rx) = oneshot::channel::<ExitOutcome>();
        let (notif_tx, notif_rx) = mpsc::unbounded_channel::<SessionNotification>();

        let approval = self.approval.lock().unwrap().clone();
        let delegate = Arc::new(GeminiDelegate::new(
            self.adapter.name(),
            self.config.auto_approve,
            approval,
            task.work_dir.clone(),
        ));
        let client = Arc::new(AcpClient::new(stdout, stdin, delegate, notif_tx));

        let ctx = DriveContext {
            client,
            process: Arc::clone(&process),
            process_id,
            manager: Arc::clone(manager),
            connections: Arc::clone(&self.connections),
            store: self.store.clone(),
            work_dir: task.work_dir.clone(),
            prompt: task.prompt.clone(),
            model: self.config.model.clone(),
            mcp_servers: self.config.mcp_servers.clone(),
            resume_session,
            lines_tx,
            exit_tx,
            notif_rx,
        };
        tokio::spawn(drive_session(ctx));

        Ok(SpawnedChild {
            process_id,
            process,
            lines: lines_rx,
            exit: exit_rx,
        })
    }
}

#[async_trait::async_trait]
impl AgentExecutor for GeminiExecutor {
    fn adapter(&self) -> &dyn AgentAdapter {
        &self.adapter
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            supports_session_resume: true,
            requires_setup: false,
            supports_approvals: true,
            supports_mcp: true,
            protocol: AgentProtocol::Acp,
            supports_mid_execution_messages: true,
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
        self.launch(task, Some(session_id.to_string()), manager).await
    }

    async fn send_message(&self, process_id: ProcessId, text: &str) -> Result<(), AgentError> {
        let connection = self
            .connections
            .lock()
            .unwrap()
            .get(&process_id)
            .cloned()
            .ok_or_else(|| AgentError::Session(format!("no session for process {process_id}")))?;

        connection
            .session
            .lock()
            .unwrap()
            .begin_prompt()
            .map_err(|e| AgentError::Session(e.to_string()))?;

        let params = PromptParams {
            session_id: connection.session_id.clone(),
            prompt: vec![ContentBlock::text(text)],
        };
        tokio::spawn(async move {
            let result = connection.client.prompt(params).await;
            connection.session.lock().unwrap().finish_prompt();
            if let Err(e) = result {
                tracing::warn!("Follow-up prompt failed: {e}");
            }
        });
        Ok(())
    }

    /// Interrupt via the protocol: cancel the in-flight prompt and mark the
    /// session cancelled. Falls back to SIGTERM when no session is up yet.
    async fn interrupt(
        &self,
        process_id: ProcessId,
        manager: &Arc<ProcessManager>,
    ) -> Result<(), AgentError> {
        let connection = self.connections.lock().unwrap().get(&process_id).cloned();
        match connection {
            Some(connection) => {
                if connection.session.lock().unwrap().cancel() {
                    connection.client.cancel(&connection.session_id)?;
                }
                Ok(())
            }
            None => {
                manager.terminate(process_id)?;
                Ok(())
            }
        }
    }

    fn normalizer(&self, _work_dir: &Path) -> Box<dyn OutputNormalizer> {
        Box::new(AcpNormalizer::new())
    }

    async fn check_availability(&self) -> bool {
        let program = self.config.program.as_deref().unwrap_or(DEFAULT_PROGRAM);
        probe_binary(program).await
    }

    fn set_approval_service(&self, service: Arc<dyn ApprovalService>) {
        *self.approval.lock().unwrap() = Some(service);
    }
}

struct DriveContext {
    client: Arc<AcpClient>,
    process: SharedProcess,
    process_id: ProcessId,
    manager: Arc<ProcessManager>,
    connections: ConnectionMap,
    store: SessionStore,
    work_dir: PathBuf,
    prompt: String,
    model: Option<String>,
    mcp_servers: Vec<crate::acp::protocol::McpServer>,
    resume_session: Option<String>,
    lines_tx: mpsc::UnboundedSender<String>,
    exit_tx: oneshot::Sender<ExitOutcome>,
    notif_rx: mpsc::UnboundedReceiver<SessionNotification>,
}

/// One full session drive: handshake, prompt turn, teardown.
async fn drive_session(ctx: DriveContext) {
    let DriveContext {
        client,
        process,
        process_id,
        manager,
        connections,
        store,
        work_dir,
        prompt,
        model,
        mcp_servers,
        resume_session,
        lines_tx,
        exit_tx,
        mut notif_rx,
    } = ctx;

    // Mirror notifications into the session store and the line stream.
    let pump_store = store.clone();
    let pump_lines = lines_tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(notification) = notif_rx.recv().await {
            if let Some(event) = SessionEvent::from_update(&notification.update) {
                if let Err(e) = pump_store.append(&notification.session_id, &event).await {
                    tracing::warn!("Failed to persist session event: {e}");
                }
            }
            if let Ok(line) = serde_json::to_string(&notification) {
                let _ = pump_lines.send(line);
            }
        }
    });

    let turn: Result<StopReason, AgentError> = async {
        client
            .initialize(InitializeParams {
                protocol_version: crate::acp::PROTOCOL_VERSION,
                client_capabilities: ClientCapabilities {
                    fs: FsCapabilities {
                        read_text_file: true,
                        write_text_file: true,
                    },
                    terminal: true,
                },
                client_info: ClientInfo {
                    name: "conductor".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            })
            .await?;

        let session_id = match &resume_session {
            Some(session_id) => {
                client
                    .load_session(LoadSessionParams {
                        cwd: work_dir.clone(),
                        mcp_servers: mcp_servers.clone(),
                        session_id: session_id.clone(),
                    })
                    .await?;
                session_id.clone()
            }
            None => {
                client
                    .new_session(NewSessionParams {
                        cwd: work_dir.clone(),
                        mcp_servers: mcp_servers.clone(),
                        meta: None,
                    })
                    .await?
                    .session_id
            }
        };

        if let Some(model) = &model {
            if let Err(e) = client
                .set_session_model(SetSessionModelParams {
                    session_id: session_id.clone(),
                    model_id: model.clone(),
                })
                .await
            {
                tracing::debug!("Agent rejected model selection: {e}");
            }
        }

        let session = Arc::new(Mutex::new(AcpSession::new(
            session_id.clone(),
            work_dir.clone(),
        )));
        session
            .lock()
            .unwrap()
            .mark_ready()
            .map_err(|e| AgentError::Session(e.to_string()))?;
        connections.lock().unwrap().insert(
            process_id,
            GeminiConnection {
                client: Arc::clone(&client),
                session: Arc::clone(&session),
                session_id: session_id.clone(),
            },
        );

        session
            .lock()
            .unwrap()
            .begin_prompt()
            .map_err(|e| AgentError::Session(e.to_string()))?;
        let result = client
            .prompt(PromptParams {
                session_id,
                prompt: vec![ContentBlock::text(prompt)],
            })
            .await;
        session.lock().unwrap().finish_prompt();
        Ok(result?.stop_reason)
    }
    .await;

    match &turn {
        Ok(stop_reason) => {
            let line = json!({
                "type": "turn_complete",
                "stopReason": stop_reason,
            });
            let _ = lines_tx.send(line.to_string());
        }
        Err(e) => {
            let line = json!({"type": "error", "message": e.to_string()});
            let _ = lines_tx.send(line.to_string());
        }
    }

    // Teardown cascade: client, then child, then the session entry.
    client.shutdown();
    let _ = pump.await;
    let _ = manager.terminate(process_id);
    {
        let mut proc = process.lock().await;
        if let Err(e) = proc.wait().await {
            tracing::debug!("Reaping agent child failed: {e}");
        }
    }
    connections.lock().unwrap().remove(&process_id);

    let outcome = match turn {
        Ok(_) => ExitOutcome {
            code: Some(0),
            signal: None,
        },
        Err(_) => ExitOutcome {
            code: Some(1),
            signal: None,
        },
    };
    let _ = exit_tx.send(outcome);
}
