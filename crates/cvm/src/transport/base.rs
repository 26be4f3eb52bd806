//! Shared transport plumbing: lifecycle, the inbound subscription filter,
//! and the encrypted-or-cleartext publish path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nostr::{Event, EventId, Filter, Kind, PublicKey, Tag, Timestamp};

use crate::codec;
use crate::core::constants::{
    CTXVM_MESSAGES_KIND, GIFT_WRAP_JITTER_SECS, GIFT_WRAP_KIND,
};
use crate::core::error::{Error, Result};
use crate::core::types::{EncryptionMode, McpMessage};
use crate::relay::RelayPool;
use crate::signer::EventSigner;

/// What a transport hands its consumer.
///
/// The reference design exposed mutable onmessage/onerror/onclose slots;
/// here the three surfaces collapse into one channel.
#[derive(Debug)]
pub enum TransportEvent {
    Message(McpMessage),
    /// Non-fatal failure the consumer should see (decrypt failure, unknown
    /// correlation); the transport itself keeps running.
    Error(Error),
    Closed,
}

/// State and helpers shared by the client and server transports.
pub struct TransportCore {
    signer: EventSigner,
    pool: Arc<RelayPool>,
    encryption_mode: EncryptionMode,
    connected: AtomicBool,
}

impl TransportCore {
    pub fn new(signer: EventSigner, pool: Arc<RelayPool>, encryption_mode: EncryptionMode) -> Self {
        Self {
            signer,
            pool,
            encryption_mode,
            connected: AtomicBool::new(false),
        }
    }

    pub fn signer(&self) -> &EventSigner {
        &self.signer
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    pub fn encryption_mode(&self) -> EncryptionMode {
        self.encryption_mode
    }

    /// Connect the pool, once.
    pub async fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.pool.connect().await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.pool.disconnect().await;
        }
    }

    /// The inbound filter: message and gift-wrap kinds addressed to us,
    /// starting at now minus the gift-wrap jitter window so backdated wraps
    /// are not filtered out. The kinds are ephemeral, so the widened window
    /// does not replay stored events.
    pub fn inbound_filter(&self) -> Filter {
        Filter::new()
            .kinds(vec![
                Kind::from(CTXVM_MESSAGES_KIND),
                Kind::from(GIFT_WRAP_KIND),
            ])
            .pubkey(self.signer.public_key())
            .since(Timestamp::now() - GIFT_WRAP_JITTER_SECS)
    }

    /// Whether an outbound event of `kind` must be gift-wrapped.
    /// Discovery kinds are never encrypted; for `Optional` the caller passes
    /// what it knows about the peer (advertised support, or the direction of
    /// the last inbound message).
    pub fn should_encrypt(&self, kind: u16, peer_encrypted: bool) -> bool {
        if kind != CTXVM_MESSAGES_KIND {
            return false;
        }
        match self.encryption_mode {
            EncryptionMode::Disabled => false,
            EncryptionMode::Required => true,
            EncryptionMode::Optional => peer_encrypted,
        }
    }

    /// Encode, sign, optionally wrap, and publish one MCP message.
    /// Returns the id of the signed inner event, the correlation handle
    /// both sides use, whether or not the carrier was encrypted.
    pub async fn send_mcp_message(
        &self,
        message: &McpMessage,
        recipient: &PublicKey,
        kind: u16,
        tags: Vec<Tag>,
        encrypt: bool,
    ) -> Result<EventId> {
        let unsigned = codec::encode_mcp_message(message, self.signer.public_key(), kind, tags)?;
        let event = self.signer.sign(unsigned)?;
        let event_id = event.id;
        if encrypt {
            let wrap = codec::gift_wrap(&event, recipient)?;
            self.pool.publish(&wrap).await?;
        } else {
            self.pool.publish(&event).await?;
        }
        Ok(event_id)
    }

    /// Publish a cleartext non-message event (discovery kinds).
    pub async fn publish_event(&self, kind: u16, content: String, tags: Vec<Tag>) -> Result<EventId> {
        if content.len() > crate::core::constants::MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge {
                len: content.len(),
                max: crate::core::constants::MAX_MESSAGE_SIZE,
            });
        }
        let unsigned = nostr::EventBuilder::new(Kind::from(kind), content)
            .tags(tags)
            .build(self.signer.public_key());
        let event = self.signer.sign(unsigned)?;
        let event_id = event.id;
        self.pool.publish(&event).await?;
        Ok(event_id)
    }

    /// Unwrap an inbound event if it is a gift wrap, enforcing the
    /// encryption policy in both directions. Returns the effective event and
    /// whether it arrived encrypted.
    pub fn open_inbound(&self, event: Event) -> Result<(Event, bool)> {
        if event.kind.as_u16() == GIFT_WRAP_KIND {
            if self.encryption_mode == EncryptionMode::Disabled {
                return Err(Error::EncryptionPolicyMismatch(
                    "encrypted event while encryption is disabled".to_string(),
                ));
            }
            let inner = codec::gift_unwrap(&event, self.signer.keys())?;
            Ok((inner, true))
        } else {
            if self.encryption_mode == EncryptionMode::Required {
                return Err(Error::EncryptionPolicyMismatch(
                    "cleartext event while encryption is required".to_string(),
                ));
            }
            Ok((event, false))
        }
    }
}
