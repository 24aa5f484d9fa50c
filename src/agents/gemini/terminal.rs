//! Host-side terminals served to the agent over the protocol.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::acp::protocol::{
    CreateTerminalParams, CreateTerminalResult, RpcError, TerminalExitStatus,
    TerminalOutputResult, WaitForExitResult,
};

/// Output kept per terminal before truncation kicks in.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
struct TerminalBuffer {
    data: String,
    truncated: bool,
}

struct TerminalEntry {
    pid: Option<u32>,
    buffer: Arc<Mutex<TerminalBuffer>>,
    exit: watch::Receiver<Option<TerminalExitStatus>>,
}

/// Terminals created on the agent's behalf, keyed by id.
pub struct TerminalManager {
    work_dir: PathBuf,
    terminals: Mutex<HashMap<String, TerminalEntry>>,
}

impl TerminalManager {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            terminals: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, params: CreateTerminalParams) -> Result<CreateTerminalResult, RpcError> {
        let mut cmd = tokio::process::Command::new(&params.command);
        cmd.args(&params.args);
        cmd.current_dir(params.cwd.as_ref().unwrap_or(&self.work_dir));
        for (key, value) in &params.env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::internal(format!("failed to spawn terminal: {e}")))?;

        let terminal_id = Uuid::new_v4().to_string();
        let pid = child.id();
        let buffer = Arc::new(Mutex::new(TerminalBuffer::default()));
        let (exit_tx, exit_rx) = watch::channel(None);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stdout) = stdout {
            spawn_collector(stdout, Arc::clone(&buffer));
        }
        if let Some(stderr) = stderr {
            spawn_collector(stderr, Arc::clone(&buffer));
        }

        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => {
                    let signal = {
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            status.signal().map(|sig| sig.to_string())
                        }
                        #[cfg(not(unix))]
                        {
                            None
                        }
                    };
                    TerminalExitStatus {
                        exit_code: status.code(),
                        signal,
                    }
                }
                Err(_) => TerminalExitStatus {
                    exit_code: None,
                    signal: None,
                },
            };
            let _ = exit_tx.send(Some(status));
        });

        self.terminals.lock().unwrap().insert(
            terminal_id.clone(),
            TerminalEntry {
                pid,
                buffer,
                exit: exit_rx,
            },
        );

        Ok(CreateTerminalResult { terminal_id })
    }

    pub fn output(&self, terminal_id: &str) -> Result<TerminalOutputResult, RpcError> {
        let terminals = self.terminals.lock().unwrap();
        let entry = terminals
            .get(terminal_id)
            .ok_or_else(|| RpcError::invalid_params(format!("unknown terminal {terminal_id}")))?;
        let buffer = entry.buffer.lock().unwrap();
        let exit_status = entry.exit.borrow().clone();
        let result = TerminalOutputResult {
            output: buffer.data.clone(),
            truncated: buffer.truncated,
            exit_status,
        };
        Ok(result)
    }

    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<WaitForExitResult, RpcError> {
        let mut exit = {
            let terminals = self.terminals.lock().unwrap();
            terminals
                .get(terminal_id)
                .ok_or_else(|| {
                    RpcError::invalid_params(format!("unknown terminal {terminal_id}"))
                })?
                .exit
                .clone()
        };
        loop {
            if let Some(status) = exit.borrow().clone() {
                return Ok(WaitForExitResult {
                    exit_status: status,
                });
            }
            if exit.changed().await.is_err() {
                return Err(RpcError::internal("terminal reaper died"));
            }
        }
    }

    pub fn kill(&self, terminal_id: &str) -> Result<(), RpcError> {
        let terminals = self.terminals.lock().unwrap();
        let entry = terminals
            .get(terminal_id)
            .ok_or_else(|| RpcError::invalid_params(format!("unknown terminal {terminal_id}")))?;
        if let Some(pid) = entry.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        Ok(())
    }

    pub fn release(&self, terminal_id: &str) -> Result<(), RpcError> {
        let entry = self.terminals.lock().unwrap().remove(terminal_id);
        match entry {
            Some(entry) => {
                if entry.exit.borrow().is_none() {
                    if let Some(pid) = entry.pid {
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                }
                Ok(())
            }
            None => Err(RpcError::invalid_params(format!(
                "unknown terminal {terminal_id}"
            ))),
        }
    }
}

fn spawn_collector<R>(mut reader: R, buffer: Arc<Mutex<TerminalBuffer>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut buffer = buffer.lock().unwrap();
                    let text = String::from_utf8_lossy(&chunk[..n]);
                    let room = MAX_OUTPUT_BYTES.saturating_sub(buffer.data.len());
                    if text.len() <= room {
                        buffer.data.push_str(&text);
                    } else {
                        let mut end = room;
                        while end > 0 && !text.is_char_boundary(end) {
                            end -= 1;
                        }
                        buffer.data.push_str(&text[..end]);
                        buffer.truncated = true;
                    }
                }
            }
        }
    });
}
