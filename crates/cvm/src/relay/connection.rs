//! A single relay connection: websocket dial, reader/writer tasks, and the
//! per-relay reconnection bookkeeping the pool's monitor acts on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::core::constants::{
    RECONNECT_INITIAL_INTERVAL, RECONNECT_MAX_INTERVAL, RELAY_CONNECT_TIMEOUT,
};
use crate::core::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Disconnected,
    Connected,
    /// Reconnection attempts exhausted; the monitor no longer touches it.
    Abandoned,
}

/// Reconnection state for one relay.
#[derive(Debug)]
pub struct RelayState {
    pub status: RelayStatus,
    pub reconnect_interval: Duration,
    pub retry_count: u32,
    pub is_reconnecting: bool,
    pub last_attempt: Option<Instant>,
}

impl RelayState {
    fn new() -> Self {
        Self {
            status: RelayStatus::Disconnected,
            reconnect_interval: RECONNECT_INITIAL_INTERVAL,
            retry_count: 0,
            is_reconnecting: false,
            last_attempt: None,
        }
    }

    /// A failed attempt: bump the counter and double the delay (capped).
    /// The current interval has already been waited out, so doubling after
    /// the attempt yields the 1 s → 2 s → … → 30 s progression.
    pub fn record_failure(&mut self) {
        self.retry_count += 1;
        self.reconnect_interval = (self.reconnect_interval * 2).min(RECONNECT_MAX_INTERVAL);
        self.is_reconnecting = false;
    }

    pub fn record_success(&mut self) {
        self.status = RelayStatus::Connected;
        self.reconnect_interval = RECONNECT_INITIAL_INTERVAL;
        self.retry_count = 0;
        self.is_reconnecting = false;
    }
}

/// One relay: url, reconnect state, and the outbound frame channel while
/// connected.
pub struct RelayConnection {
    pub url: String,
    pub state: Mutex<RelayState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl RelayConnection {
    pub fn new(url: String) -> Arc<Self> {
        Arc::new(Self {
            url,
            state: Mutex::new(RelayState::new()),
            writer: Mutex::new(None),
        })
    }

    /// Dial the relay (5 s timeout) and spawn the reader/writer tasks.
    /// Inbound text frames are forwarded to `frame_tx` tagged with this
    /// relay's url.
    pub async fn connect(
        self: &Arc<Self>,
        frame_tx: mpsc::UnboundedSender<(String, String)>,
    ) -> Result<()> {
        let dialed = tokio::time::timeout(RELAY_CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::Relay(format!("{}: connect timeout", self.url)))?
            .map_err(|e| Error::Relay(format!("{}: {e}", self.url)))?;
        let (ws, _response) = dialed;
        let (mut sink, mut stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.writer.lock().await = Some(tx.clone());
        self.state.lock().await.record_success();

        let writer_url = self.url.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("relay {writer_url}: write failed: {e}");
                    break;
                }
            }
        });

        let conn = Arc::clone(self);
        let pong_tx = tx;
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if frame_tx.send((conn.url.clone(), text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("relay {}: read error: {e}", conn.url);
                        break;
                    }
                }
            }
            conn.mark_disconnected().await;
        });

        Ok(())
    }

    /// Queue a text frame; errors when the relay is not connected.
    pub async fn send_frame(&self, frame: String) -> Result<()> {
        match self.writer.lock().await.as_ref() {
            Some(tx) => tx
                .send(Message::Text(frame))
                .map_err(|_| Error::Relay(format!("{}: connection closed", self.url))),
            None => Err(Error::Relay(format!("{}: not connected", self.url))),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.status == RelayStatus::Connected
    }

    pub async fn mark_disconnected(&self) {
        *self.writer.lock().await = None;
        let mut state = self.state.lock().await;
        if state.status == RelayStatus::Connected {
            debug!("relay {}: disconnected", self.url);
            state.status = RelayStatus::Disconnected;
        }
    }

    /// Graceful close initiated by the pool.
    pub async fn close(&self) {
        if let Some(tx) = self.writer.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }
        let mut state = self.state.lock().await;
        state.status = RelayStatus::Disconnected;
    }
}
