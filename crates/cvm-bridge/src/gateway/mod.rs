//! Gateway: expose a local MCP server to remote clients over Nostr.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::warn;

use cvm::{McpMessage, NostrServerTransport, TransportEvent};

/// Couples a server transport with a local MCP server duplex.
pub struct Gateway {
    transport: NostrServerTransport,
}

impl Gateway {
    pub fn new(transport: NostrServerTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &NostrServerTransport {
        &self.transport
    }

    /// Start the transport and pump messages both ways until either side
    /// closes. Remote traffic goes to `to_server`; whatever the local server
    /// emits on `from_server` is routed back out.
    pub async fn run(
        self,
        to_server: mpsc::UnboundedSender<McpMessage>,
        mut from_server: mpsc::UnboundedReceiver<McpMessage>,
    ) -> Result<()> {
        self.transport.start().await?;
        let mut events = self
            .transport
            .events()
            .await
            .context("transport consumer already taken")?;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        if to_server.send(message).is_err() {
                            break;
                        }
                    }
                    Some(TransportEvent::Error(e)) => warn!("transport error: {e}"),
                    Some(TransportEvent::Closed) | None => break,
                },
                message = from_server.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.transport.send(message).await {
                            warn!("failed to route local server message: {e}");
                        }
                    }
                    None => break,
                },
            }
        }

        self.transport.close().await;
        Ok(())
    }
}
