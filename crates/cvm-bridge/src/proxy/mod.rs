//! Proxy: give a local stdio caller access to a remote MCP server.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use cvm::{McpMessage, NostrClientTransport, TransportEvent};

/// Couples a client transport with a line-delimited JSON-RPC duplex.
pub struct Proxy {
    transport: NostrClientTransport,
}

impl Proxy {
    pub fn new(transport: NostrClientTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &NostrClientTransport {
        &self.transport
    }

    /// Pump stdin lines to the remote server and remote messages back as
    /// stdout lines.
    pub async fn run_stdio(self) -> Result<()> {
        self.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    pub async fn run<R, W>(self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.transport.start().await?;
        let mut events = self
            .transport
            .events()
            .await
            .context("transport consumer already taken")?;
        let mut lines = reader.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let message = McpMessage::from_json(line);
                        if message == McpMessage::Invalid {
                            warn!("skipping invalid JSON-RPC input line");
                            continue;
                        }
                        if let Err(e) = self.transport.send(&message).await {
                            warn!("failed to send request: {e}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("input read error: {e}");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some(TransportEvent::Message(message)) => match message.to_json() {
                        Ok(json) => {
                            writer.write_all(json.as_bytes()).await?;
                            writer.write_all(b"\n").await?;
                            writer.flush().await?;
                        }
                        Err(e) => warn!("skipping unserializable message: {e}"),
                    },
                    Some(TransportEvent::Error(e)) => warn!("transport error: {e}"),
                    Some(TransportEvent::Closed) | None => break,
                },
            }
        }

        self.transport.close().await;
        Ok(())
    }
}
