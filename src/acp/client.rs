//! NDJSON JSON-RPC peer over child stdio.
//!
//! Both sides issue requests: the host drives the session, the agent asks
//! back for permissions, file access, and terminals. Outbound replies are
//! matched through an id-keyed pending map; inbound requests are served on
//! their own tasks so a slow permission prompt never stalls the stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::protocol::{self, methods, RpcError, SessionNotification};

#[derive(Debug, thiserror::Error)]
pub enum AcpError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Agent connection closed")]
    ConnectionClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Host-side services the agent may call back into.
///
/// Terminal methods default to `MethodNotFound`; executors that advertise
/// the terminal capability override them.
#[async_trait::async_trait]
pub trait AcpDelegate: Send + Sync {
    async fn request_permission(
        &self,
        params: protocol::RequestPermissionParams,
    ) -> Result<protocol::RequestPermissionResult, RpcError>;

    async fn read_text_file(
        &self,
        params: protocol::ReadTextFileParams,
    ) -> Result<protocol::ReadTextFileResult, RpcError>;

    async fn write_text_file(
        &self,
        params: protocol::WriteTextFileParams,
    ) -> Result<(), RpcError>;

    async fn create_terminal(
        &self,
        _params: protocol::CreateTerminalParams,
    ) -> Result<protocol::CreateTerminalResult, RpcError> {
        Err(RpcError::method_not_found(methods::TERMINAL_CREATE))
    }

    async fn terminal_output(
        &self,
        _params: protocol::TerminalIdParams,
    ) -> Result<protocol::TerminalOutputResult, RpcError> {
        Err(RpcError::method_not_found(methods::TERMINAL_OUTPUT))
    }

    async fn release_terminal(
        &self,
        _params: protocol::TerminalIdParams,
    ) -> Result<(), RpcError> {
        Err(RpcError::method_not_found(methods::TERMINAL_RELEASE))
    }

    async fn wait_for_terminal_exit(
        &self,
        _params: protocol::TerminalIdParams,
    ) -> Result<protocol::WaitForExitResult, RpcError> {
        Err(RpcError::method_not_found(methods::TERMINAL_WAIT_FOR_EXIT))
    }

    async fn kill_terminal(&self, _params: protocol::TerminalIdParams) -> Result<(), RpcError> {
        Err(RpcError::method_not_found(methods::TERMINAL_KILL))
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// One live protocol connection to an agent child.
pub struct AcpClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl AcpClient {
    /// Wire a client over the child's stdio. `notifications` receives every
    /// parsed `session/update`; the channel closing ends delivery but not
    /// the connection.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        delegate: Arc<dyn AcpDelegate>,
        notifications: mpsc::UnboundedSender<SessionNotification>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = outgoing_rx.recv().await {
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_outgoing = outgoing_tx.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!("Dropping malformed agent frame: {e}");
                        continue;
                    }
                };
                dispatch_frame(
                    value,
                    &reader_pending,
                    &reader_outgoing,
                    &delegate,
                    &notifications,
                );
            }

            // Connection gone: fail every outstanding request.
            let mut pending = reader_pending.lock().unwrap();
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(RpcError::internal("agent connection closed")));
            }
        });

        Self {
            outgoing: outgoing_tx,
            pending,
            next_id: AtomicU64::new(1),
            reader_task,
            writer_task,
        }
    }

    /// Issue one request and await the agent's reply.
    pub async fn request<P, T>(&self, method: &str, params: P) -> Result<T, AcpError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)?,
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if self.outgoing.send(frame).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(AcpError::ConnectionClosed);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(serde_json::from_value(result)?),
            Ok(Err(error)) => Err(AcpError::Rpc(error)),
            Err(_) => Err(AcpError::ConnectionClosed),
        }
    }

    /// Fire a notification (no reply expected).
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), AcpError> {
        let frame = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": serde_json::to_value(params)?,
        }))?;
        self.outgoing
            .send(frame)
            .map_err(|_| AcpError::ConnectionClosed)
    }

    pub async fn initialize(
        &self,
        params: protocol::InitializeParams,
    ) -> Result<protocol::InitializeResult, AcpError> {
        self.request(methods::INITIALIZE, params).await
    }

    pub async fn new_session(
        &self,
        params: protocol::NewSessionParams,
    ) -> Result<protocol::NewSessionResult, AcpError> {
        self.request(methods::SESSION_NEW, params).await
    }

    pub async fn load_session(
        &self,
        params: protocol::LoadSessionParams,
    ) -> Result<Value, AcpError> {
        self.request(methods::SESSION_LOAD, params).await
    }

    pub async fn prompt(
        &self,
        params: protocol::PromptParams,
    ) -> Result<protocol::PromptResult, AcpError> {
        self.request(methods::SESSION_PROMPT, params).await
    }

    pub fn cancel(&self, session_id: &str) -> Result<(), AcpError> {
        self.notify(
            methods::SESSION_CANCEL,
            protocol::CancelParams {
                session_id: session_id.to_string(),
            },
        )
    }

    pub async fn set_session_mode(
        &self,
        params: protocol::SetSessionModeParams,
    ) -> Result<Value, AcpError> {
        self.request(methods::SESSION_SET_MODE, params).await
    }

    pub async fn set_session_model(
        &self,
        params: protocol::SetSessionModelParams,
    ) -> Result<Value, AcpError> {
        self.request(methods::SESSION_SET_MODEL, params).await
    }

    /// Drop the connection tasks. Outstanding requests fail with
    /// `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RpcError::internal("client shut down")));
        }
    }
}

impl Drop for AcpClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

fn dispatch_frame(
    value: Value,
    pending: &PendingMap,
    outgoing: &mpsc::UnboundedSender<String>,
    delegate: &Arc<dyn AcpDelegate>,
    notifications: &mpsc::UnboundedSender<SessionNotification>,
) {
    let has_method = value.get("method").is_some();
    let id = value.get("id").cloned();

    match (has_method, id) {
        // Inbound request from the agent.
        (true, Some(id)) => {
            let method = value["method"].as_str().unwrap_or_default().to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let delegate = Arc::clone(delegate);
            let outgoing = outgoing.clone();
            tokio::spawn(async move {
                let result = serve_request(&method, params, delegate.as_ref()).await;
                let frame = match result {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
                };
                if let Ok(frame) = serde_json::to_string(&frame) {
                    let _ = outgoing.send(frame);
                }
            });
        }
        // Notification.
        (true, None) => {
            let method = value["method"].as_str().unwrap_or_default();
            if method == methods::SESSION_UPDATE {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<SessionNotification>(params) {
                    Ok(notification) => {
                        let _ = notifications.send(notification);
                    }
                    Err(e) => tracing::warn!("Dropping malformed session update: {e}"),
                }
            } else {
                tracing::debug!("Ignoring agent notification: {method}");
            }
        }
        // Response to one of our requests.
        (false, Some(id)) => {
            let Some(id) = id.as_u64() else {
                tracing::warn!("Response with non-numeric id: {id}");
                return;
            };
            let waiter = pending.lock().unwrap().remove(&id);
            let Some(waiter) = waiter else {
                tracing::debug!("Response for unknown request id {id}");
                return;
            };
            let outcome = if let Some(error) = value.get("error") {
                match serde_json::from_value::<RpcError>(error.clone()) {
                    Ok(error) => Err(error),
                    Err(_) => Err(RpcError::internal("malformed error object")),
                }
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = waiter.send(outcome);
        }
        (false, None) => {
            tracing::warn!("Dropping frame with neither method nor id");
        }
    }
}

async fn serve_request(
    method: &str,
    params: Value,
    delegate: &dyn AcpDelegate,
) -> Result<Value, RpcError> {
    fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
        serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
    }

    match method {
        methods::SESSION_REQUEST_PERMISSION => {
            let result = delegate.request_permission(parse(params)?).await?;
            Ok(serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        methods::FS_READ_TEXT_FILE => {
            let result = delegate.read_text_file(parse(params)?).await?;
            Ok(serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        methods::FS_WRITE_TEXT_FILE => {
            delegate.write_text_file(parse(params)?).await?;
            Ok(Value::Null)
        }
        methods::TERMINAL_CREATE => {
            let result = delegate.create_terminal(parse(params)?).await?;
            Ok(serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        methods::TERMINAL_OUTPUT => {
            let result = delegate.terminal_output(parse(params)?).await?;
            Ok(serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        methods::TERMINAL_RELEASE => {
            delegate.release_terminal(parse(params)?).await?;
            Ok(Value::Null)
        }
        methods::TERMINAL_WAIT_FOR_EXIT => {
            let result = delegate.wait_for_terminal_exit(parse(params)?).await?;
            Ok(serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))?)
        }
        methods::TERMINAL_KILL => {
            delegate.kill_terminal(parse(params)?).await?;
            Ok(Value::Null)
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::protocol::{
        ClientCapabilities, ClientInfo, InitializeParams, RequestPermissionOutcome,
        RequestPermissionResult,
    };
    use tokio::io::AsyncReadExt;

    struct AllowFirstDelegate;

    #[async_trait::async_trait]
    impl AcpDelegate for AllowFirstDelegate {
        async fn request_permission(
            &self,
            params: protocol::RequestPermissionParams,
        ) -> Result<RequestPermissionResult, RpcError> {
            let option = params
                .options
                .first()
                .ok_or_else(|| RpcError::invalid_params("no options"))?;
            Ok(RequestPermissionResult {
                outcome: RequestPermissionOutcome::Selected {
                    option_id: option.option_id.clone(),
                },
            })
        }

        async fn read_text_file(
            &self,
            _params: protocol::ReadTextFileParams,
        ) -> Result<protocol::ReadTextFileResult, RpcError> {
            Ok(protocol::ReadTextFileResult {
                content: "stub".into(),
            })
        }

        async fn write_text_file(
            &self,
            _params: protocol::WriteTextFileParams,
        ) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn test_client(
        agent_to_host: tokio::io::DuplexStream,
        host_to_agent: tokio::io::DuplexStream,
    ) -> (AcpClient, mpsc::UnboundedReceiver<SessionNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let client = AcpClient::new(
            agent_to_host,
            host_to_agent,
            Arc::new(AllowFirstDelegate),
            notify_tx,
        );
        (client, notify_rx)
    }

    #[tokio::test]
    async fn request_resolves_from_matching_response() {
        let (host_read, mut agent_write) = tokio::io::duplex(4096);
        let (mut agent_read, host_write) = tokio::io::duplex(4096);
        let (client, _notify) = test_client(host_read, host_write);

        // Agent side: read the initialize request, answer it.
        let agent = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = agent_read.read(&mut buf).await.unwrap();
            let frame: Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(frame["method"], "initialize");
            let id = frame["id"].as_u64().unwrap();
            let reply = format!(
                "{}\n",
                json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": 1}})
            );
            agent_write.write_all(reply.as_bytes()).await.unwrap();
        });

        let result = client
            .initialize(InitializeParams {
                protocol_version: 1,
                client_capabilities: ClientCapabilities::default(),
                client_info: ClientInfo {
                    name: "conductor".into(),
                    version: "0.1.0".into(),
                },
            })
            .await
            .unwrap();
        assert_eq!(result.protocol_version, 1);
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_permission_request_is_served() {
        let (host_read, mut agent_write) = tokio::io::duplex(4096);
        let (mut agent_read, host_write) = tokio::io::duplex(4096);
        let (_client, _notify) = test_client(host_read, host_write);

        let request = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "session/request_permission",
            "params": {
                "sessionId": "s1",
                "toolCall": {"toolCallId": "t1"},
                "options": [
                    {"optionId": "opt-allow", "name": "Allow", "kind": "allow_once"}
                ]
            }
        });
        agent_write
            .write_all(format!("{request}\n").as_bytes())
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = agent_read.read(&mut buf).await.unwrap();
        let reply: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"]["outcome"]["outcome"], "selected");
        assert_eq!(reply["result"]["outcome"]["optionId"], "opt-allow");
    }

    #[tokio::test]
    async fn notifications_are_forwarded() {
        let (host_read, mut agent_write) = tokio::io::duplex(4096);
        let (_agent_read, host_write) = tokio::io::duplex(4096);
        let (_client, mut notify) = test_client(host_read, host_write);

        let frame = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": "s1",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": "hello"}
                }
            }
        });
        agent_write
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();

        let notification = notify.recv().await.unwrap();
        assert_eq!(notification.session_id, "s1");
    }

    #[tokio::test]
    async fn unknown_inbound_method_gets_method_not_found() {
        let (host_read, mut agent_write) = tokio::io::duplex(4096);
        let (mut agent_read, host_write) = tokio::io::duplex(4096);
        let (_client, _notify) = test_client(host_read, host_write);

        let request = json!({"jsonrpc": "2.0", "id": 9, "method": "no/such_method"});
        agent_write
            .write_all(format!("{request}\n").as_bytes())
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = agent_read.read(&mut buf).await.unwrap();
        let reply: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_silently() {
        let (host_read, mut agent_write) = tokio::io::duplex(4096);
        let (_agent_read, host_write) = tokio::io::duplex(4096);
        let (_client, mut notify) = test_client(host_read, host_write);

        agent_write.write_all(b"this is not json\n").await.unwrap();
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {
                "sessionId": "s2",
                "update": {
                    "sessionUpdate": "current_mode_update",
                    "currentModeId": "architect"
                }
            }
        });
        agent_write
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .unwrap();

        let notification = notify.recv().await.unwrap();
        assert_eq!(notification.session_id, "s2");
    }
}
