use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{Channel, McpService, Transport, call_tool_on, map_tools};
use crate::config::{BackendServiceConfig, TransportKind};
use crate::error::GatewayError;
use crate::registry::ToolDescriptor;

/// Grace period between SIGTERM to the process group and the hard kill.
const KILL_GRACE: Duration = Duration::from_millis(200);

/// Child-process transport.
///
/// Spawns the child directly (own unix process group) so the channel keeps
/// the `Child` handle for crash detection and kill-group cleanup.
pub struct StdioTransport {
    name: String,
    config: BackendServiceConfig,
}

impl StdioTransport {
    pub fn new(name: String, config: BackendServiceConfig) -> Self {
        Self { name, config }
    }

    fn build_command(&self) -> Result<Command, GatewayError> {
        let program = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| GatewayError::ConfigInvalid {
                service: self.name.clone(),
                reason: "stdio transport requires 'command'".to_string(),
            })?;

        let mut cmd = Command::new(program);

        if !self.config.args.is_empty() {
            cmd.args(&self.config.args);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        // Relative script paths in args resolve against this directory.
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        Ok(cmd)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, GatewayError> {
        let mut cmd = self.build_command()?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Each child in its own process group for clean kill-group cleanup.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| GatewayError::Transport {
            service: self.name.clone(),
            reason: format!("failed to spawn '{}': {e}", self.config.command.as_deref().unwrap_or("")),
        })?;

        let pid = child.id();
        debug!(service = %self.name, pid = ?pid, "spawned child process");

        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Transport {
            service: self.name.clone(),
            reason: "failed to capture child stdout".to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| GatewayError::Transport {
            service: self.name.clone(),
            reason: "failed to capture child stdin".to_string(),
        })?;

        // Drain stderr into the log so backend diagnostics aren't lost.
        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(service = %name, "stderr: {line}");
                }
            });
        }

        // rmcp accepts (AsyncRead, AsyncWrite) tuples as IntoTransport.
        let service =
            ()
                .serve((stdout, stdin))
                .await
                .map_err(|e| GatewayError::Handshake {
                    service: self.name.clone(),
                    reason: e.to_string(),
                })?;

        if let Some(peer) = service.peer_info() {
            info!(
                service = %self.name,
                pid = ?pid,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "MCP handshake complete"
            );
        } else {
            info!(service = %self.name, pid = ?pid, "MCP handshake complete (no peer info)");
        }

        Ok(Box::new(StdioChannel {
            name: self.name.clone(),
            service: RwLock::new(Some(service)),
            child: Mutex::new(Some(child)),
            pid,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Open conversation over a child's stdin/stdout.
pub struct StdioChannel {
    name: String,
    service: RwLock<Option<McpService>>,
    /// Held by `wait_closed` while waiting; `close` kills by pid instead of
    /// taking this lock.
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    closed: AtomicBool,
}

impl StdioChannel {
    fn check_open(&self) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::TransportClosed {
                service: self.name.clone(),
            });
        }
        Ok(())
    }

    /// SIGTERM the process group, then hard-kill after the grace period.
    async fn kill_process_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // Negative PID targets the whole group.
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                debug!(service = %self.name, pid, "sent SIGTERM to process group");
                tokio::time::sleep(KILL_GRACE).await;
                unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
            } else {
                warn!(service = %self.name, pid, "failed to signal process group");
            }
        }

        // Best effort direct kill if the handle is still available (not held
        // by a wait_closed waiter).
        if let Ok(mut guard) = self.child.try_lock()
            && let Some(child) = guard.as_mut()
        {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl Channel for StdioChannel {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        self.check_open()?;
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| GatewayError::TransportClosed {
            service: self.name.clone(),
        })?;
        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| GatewayError::Transport {
                service: self.name.clone(),
                reason: format!("tools/list failed: {e}"),
            })?;
        Ok(map_tools(tools))
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        self.check_open()?;
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| GatewayError::TransportClosed {
            service: self.name.clone(),
        })?;
        call_tool_on(service, &self.name, tool, args, timeout).await
    }

    async fn ping(&self, timeout: Duration) -> Result<(), GatewayError> {
        self.check_open()?;
        tokio::time::timeout(timeout, self.list_tools())
            .await
            .map_err(|_| GatewayError::Timeout {
                operation: format!("ping on service '{}'", self.name),
                millis: timeout.as_millis() as u64,
            })?
            .map(|_| ())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return; // already closed
        }

        // Cancel rmcp first (closes the child's stdin gracefully).
        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            error!(service = %self.name, error = %e, "error cancelling service");
        }

        self.kill_process_group().await;
        info!(service = %self.name, "stdio channel closed");
    }

    async fn wait_closed(&self) -> String {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.wait().await {
                Ok(status) => format!("process exited ({status})"),
                Err(e) => format!("process wait failed: {e}"),
            },
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
