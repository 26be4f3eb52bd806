//! Client-side transport: publishes requests to one server, correlates the
//! response events that reference them, and surfaces server notifications.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nostr::{Event, EventId, PublicKey, Tag};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec;
use crate::core::constants::{tags, CTXVM_MESSAGES_KIND};
use crate::core::error::{Error, Result};
use crate::core::types::{EncryptionMode, McpMessage};
use crate::relay::{PoolEvent, RelayPool, Subscription};
use crate::signer::EventSigner;
use crate::transport::base::{TransportCore, TransportEvent};

#[derive(Debug, Clone)]
pub struct NostrClientTransportConfig {
    /// The server this transport talks to.
    pub server_pubkey: PublicKey,
    pub encryption_mode: EncryptionMode,
}

impl NostrClientTransportConfig {
    pub fn new(server_pubkey: PublicKey) -> Self {
        Self {
            server_pubkey,
            encryption_mode: EncryptionMode::default(),
        }
    }
}

/// The first initialize result observed from the server, kept so thin
/// wrappers can display server metadata.
#[derive(Debug, Clone)]
pub struct ServerInitialize {
    pub author: PublicKey,
    pub result: serde_json::Value,
    pub supports_encryption: bool,
}

/// Client-side Nostr transport.
pub struct NostrClientTransport {
    core: Arc<TransportCore>,
    server_pubkey: PublicKey,
    /// Event ids of published requests still waiting for a response.
    pending: Arc<RwLock<HashSet<EventId>>>,
    server_init: Arc<RwLock<Option<ServerInitialize>>>,
    /// Peer hint for `Optional` mode: the server advertised encryption
    /// support or its last message arrived wrapped.
    server_encrypted: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl NostrClientTransport {
    pub fn new(
        signer: EventSigner,
        pool: Arc<RelayPool>,
        config: NostrClientTransportConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(TransportCore::new(signer, pool, config.encryption_mode)),
            server_pubkey: config.server_pubkey,
            pending: Arc::new(RwLock::new(HashSet::new())),
            server_init: Arc::new(RwLock::new(None)),
            server_encrypted: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            dispatch: Mutex::new(None),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.core.signer().public_key()
    }

    /// Connect the pool, subscribe to inbound kinds, and start dispatching.
    pub async fn start(&self) -> Result<()> {
        self.core.connect().await?;
        let subscription = self.core.pool().subscribe(self.core.inbound_filter()).await?;

        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.core),
            self.server_pubkey,
            Arc::clone(&self.pending),
            Arc::clone(&self.server_init),
            Arc::clone(&self.server_encrypted),
            self.events_tx.clone(),
            subscription,
        ));
        *self.dispatch.lock().await = Some(handle);
        Ok(())
    }

    /// Take the consumer side of the transport. Yields `None` after the
    /// first call.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Publish one MCP message to the server. Requests are tracked until a
    /// response event references them.
    pub async fn send(&self, message: &McpMessage) -> Result<EventId> {
        let tag_set = vec![Tag::public_key(self.server_pubkey)];
        let encrypt = self.core.should_encrypt(
            CTXVM_MESSAGES_KIND,
            self.server_encrypted.load(Ordering::SeqCst),
        );
        let event_id = self
            .core
            .send_mcp_message(message, &self.server_pubkey, CTXVM_MESSAGES_KIND, tag_set, encrypt)
            .await?;
        if message.is_request() {
            self.pending.write().await.insert(event_id);
        }
        Ok(event_id)
    }

    /// The captured server initialize result, if one has been observed.
    pub async fn server_initialize(&self) -> Option<ServerInitialize> {
        self.server_init.read().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Stop dispatching, drop pending state, and close the pool.
    pub async fn close(&self) {
        if let Some(handle) = self.dispatch.lock().await.take() {
            handle.abort();
        }
        self.pending.write().await.clear();
        self.core.disconnect().await;
        let _ = self.events_tx.send(TransportEvent::Closed);
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    core: Arc<TransportCore>,
    server_pubkey: PublicKey,
    pending: Arc<RwLock<HashSet<EventId>>>,
    server_init: Arc<RwLock<Option<ServerInitialize>>>,
    server_encrypted: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut subscription: Subscription,
) {
    while let Some(pool_event) = subscription.recv().await {
        let PoolEvent::Event(event) = pool_event else {
            continue;
        };
        let (event, was_encrypted) = match core.open_inbound(*event) {
            Ok(opened) => opened,
            Err(e @ Error::DecryptFailed(_)) => {
                warn!("failed to unwrap inbound event: {e}");
                let _ = events_tx.send(TransportEvent::Error(e));
                continue;
            }
            Err(e) => {
                debug!("dropping inbound event: {e}");
                continue;
            }
        };

        // Only events addressed to us.
        if !codec::references_pubkey(&event, &core.signer().public_key()) {
            debug!("dropping event {} not addressed to us", event.id);
            continue;
        }
        if was_encrypted {
            server_encrypted.store(true, Ordering::SeqCst);
        }

        let message = codec::decode_event(&event);
        if message == McpMessage::Invalid {
            debug!("dropping undecodable content in event {}", event.id);
            continue;
        }

        if let Some(init) = capture_initialize(&event, &message, &server_pubkey) {
            let mut slot = server_init.write().await;
            if slot.is_none() {
                if init.supports_encryption {
                    server_encrypted.store(true, Ordering::SeqCst);
                }
                *slot = Some(init);
            }
        }

        match codec::first_tag_value(&event, tags::EVENT_ID) {
            Some(reference) => {
                let Ok(request_id) = EventId::from_hex(reference) else {
                    debug!("dropping event {} with malformed e tag", event.id);
                    continue;
                };
                let mut pending_guard = pending.write().await;
                if pending_guard.contains(&request_id) {
                    // Progress and payment notifications reference the same
                    // request; only its response retires the entry.
                    if matches!(message, McpMessage::Response(_)) {
                        pending_guard.remove(&request_id);
                    }
                    drop(pending_guard);
                    let _ = events_tx.send(TransportEvent::Message(message));
                } else {
                    warn!("event references unknown request {request_id}");
                }
            }
            None => match message {
                McpMessage::Notification(_) => {
                    let _ = events_tx.send(TransportEvent::Message(message));
                }
                _ => {
                    warn!(
                        "dropping uncorrelated non-notification from {}",
                        event.pubkey
                    );
                }
            },
        }
    }
    let _ = events_tx.send(TransportEvent::Closed);
}

/// An inbound message whose result looks like an initialize result, authored
/// by the configured server: capture it as server metadata.
fn capture_initialize(
    event: &Event,
    message: &McpMessage,
    server_pubkey: &PublicKey,
) -> Option<ServerInitialize> {
    let McpMessage::Response(response) = message else {
        return None;
    };
    if !response.is_initialize_result() || event.pubkey != *server_pubkey {
        return None;
    }
    let supports_encryption = event
        .tags
        .iter()
        .any(|tag| tag.as_slice().first().map(String::as_str) == Some(tags::SUPPORT_ENCRYPTION));
    Some(ServerInitialize {
        author: event.pubkey,
        result: response.result.clone().unwrap_or_default(),
        supports_encryption,
    })
}
