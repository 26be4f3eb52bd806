//! Local MCP server endpoint over child-process stdio.
//!
//! Spawns the configured MCP server and speaks line-delimited JSON-RPC on
//! its stdin/stdout. Unlike a plain request/response client this is a full
//! duplex: notifications flow in both directions, which the gateway needs
//! for progress and initialized notifications.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use cvm::McpMessage;

/// A local MCP server reachable through its stdio pipes.
pub struct StdioMcpServer {
    to_child: mpsc::UnboundedSender<McpMessage>,
    from_child: Mutex<Option<mpsc::UnboundedReceiver<McpMessage>>>,
    child: Mutex<Option<Child>>,
}

impl StdioMcpServer {
    /// Spawn the server process and start the stdio pump tasks.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server: {command}"))?;
        let mut stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");

        let (to_child, mut outbound) = mpsc::unbounded_channel::<McpMessage>();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let line = match message.to_json() {
                    Ok(line) => line,
                    Err(e) => {
                        debug!("skipping unserializable message: {e}");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                {
                    error!("MCP server stdin closed");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        let (inbound_tx, from_child) = mpsc::unbounded_channel::<McpMessage>();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let message = McpMessage::from_json(trimmed);
                        if message == McpMessage::Invalid {
                            debug!(
                                "skipping non-JSON-RPC output: {}",
                                &trimmed[..trimmed.len().min(200)]
                            );
                            continue;
                        }
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("MCP server stdout read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            to_child,
            from_child: Mutex::new(Some(from_child)),
            child: Mutex::new(Some(child)),
        })
    }

    /// Sender for messages headed into the server.
    pub fn sender(&self) -> mpsc::UnboundedSender<McpMessage> {
        self.to_child.clone()
    }

    /// Take the stream of messages coming out of the server. Yields `None`
    /// after the first call.
    pub async fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<McpMessage>> {
        self.from_child.lock().await.take()
    }

    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvm::JsonRpcRequest;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn round_trips_lines_through_a_child_process() {
        // `cat` echoes our request line straight back.
        let server = StdioMcpServer::spawn("cat", &[], &HashMap::new()).unwrap();
        let mut receiver = server.take_receiver().await.unwrap();

        let request = McpMessage::Request(JsonRpcRequest::new(1, "tools/list", Some(json!({}))));
        server.sender().send(request.clone()).unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for echo")
            .expect("channel closed");
        assert_eq!(echoed, request);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let result = StdioMcpServer::spawn("/nonexistent/mcp-server", &[], &HashMap::new());
        assert!(result.is_err());
    }
}
