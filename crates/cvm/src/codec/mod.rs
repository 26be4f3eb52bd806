//! Event ⇄ MCP message codec and the gift-wrap encryption layer.
//!
//! Cleartext carrier: the full JSON-RPC message is the event content of a
//! kind-25910 event; the tag set is exactly what the caller supplies.
//!
//! Encrypted carrier: the signed kind-25910 event is serialized whole,
//! NIP-44-encrypted under an ephemeral keypair, and published as a kind-1059
//! envelope whose only tag names the recipient and whose timestamp is
//! jittered to hide the send time. The inner event's author is the true
//! sender.

use nostr::nips::nip44::{self, Version};
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, PublicKey, Tag, Timestamp, UnsignedEvent};
use rand::Rng;

use crate::core::constants::{GIFT_WRAP_JITTER_SECS, GIFT_WRAP_KIND, MAX_MESSAGE_SIZE};
use crate::core::error::{Error, Result};
use crate::core::types::McpMessage;

/// Encode an MCP message as an unsigned event of the given kind.
///
/// Rejects messages whose serialized form exceeds the 1 MiB event budget.
pub fn encode_mcp_message(
    message: &McpMessage,
    author: PublicKey,
    kind: u16,
    tags: Vec<Tag>,
) -> Result<UnsignedEvent> {
    let content = message.to_json()?;
    if content.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge {
            len: content.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(EventBuilder::new(Kind::from(kind), content)
        .tags(tags)
        .build(author))
}

/// Decode an event's content into an MCP message.
///
/// Oversized or unparseable content yields [`McpMessage::Invalid`]; callers
/// skip such events rather than failing their subscription.
pub fn decode_event(event: &Event) -> McpMessage {
    if event.content.len() > MAX_MESSAGE_SIZE {
        return McpMessage::Invalid;
    }
    McpMessage::from_json(&event.content)
}

/// Wrap a signed event in a kind-1059 envelope for `recipient`.
///
/// The envelope is authored by a throwaway keypair and backdated by a random
/// amount inside the jitter window.
pub fn gift_wrap(inner: &Event, recipient: &PublicKey) -> Result<Event> {
    let ephemeral = Keys::generate();
    let ciphertext = nip44::encrypt(
        ephemeral.secret_key(),
        recipient,
        inner.as_json(),
        Version::V2,
    )
    .map_err(|e| Error::EncryptFailed(e.to_string()))?;

    let jitter: u64 = rand::thread_rng().gen_range(0..=GIFT_WRAP_JITTER_SECS);
    EventBuilder::new(Kind::from(GIFT_WRAP_KIND), ciphertext)
        .tag(Tag::public_key(*recipient))
        .custom_created_at(Timestamp::now() - jitter)
        .sign_with_keys(&ephemeral)
        .map_err(|e| Error::EncryptFailed(e.to_string()))
}

/// Unwrap a kind-1059 envelope addressed to `receiver`.
///
/// Decrypts with the conversation key between the receiver secret and the
/// envelope author (the throwaway key), then parses and verifies the inner
/// signed event.
pub fn gift_unwrap(wrap: &Event, receiver: &Keys) -> Result<Event> {
    if wrap.kind.as_u16() != GIFT_WRAP_KIND {
        return Err(Error::InvalidEvent(format!(
            "kind {} is not a gift wrap",
            wrap.kind.as_u16()
        )));
    }
    let plaintext = nip44::decrypt(receiver.secret_key(), &wrap.pubkey, &wrap.content)
        .map_err(|e| Error::DecryptFailed(e.to_string()))?;
    let inner = Event::from_json(&plaintext).map_err(|e| Error::InvalidEvent(e.to_string()))?;
    inner
        .verify()
        .map_err(|e| Error::InvalidEvent(e.to_string()))?;
    Ok(inner)
}

/// First value of the named tag, if any.
pub fn first_tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|tag| {
        let slice = tag.as_slice();
        if slice.first().map(String::as_str) == Some(name) {
            slice.get(1).map(String::as_str)
        } else {
            None
        }
    })
}

/// Whether the event carries a `p` tag naming `pubkey`.
pub fn references_pubkey(event: &Event, pubkey: &PublicKey) -> bool {
    let hex = pubkey.to_hex();
    event.tags.iter().any(|tag| {
        let slice = tag.as_slice();
        slice.first().map(String::as_str) == Some(crate::core::constants::tags::PUBKEY)
            && slice.get(1).map(String::as_str) == Some(hex.as_str())
    })
}
