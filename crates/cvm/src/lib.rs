//! ContextVM core: MCP over Nostr.
//!
//! This crate bridges the Model Context Protocol (JSON-RPC 2.0) onto the
//! Nostr event network. MCP messages travel as ephemeral kind-25910 events,
//! optionally gift-wrapped (kind 1059) for end-to-end encryption, while
//! replaceable discovery events (kinds 11316–11320) announce a server and its
//! capability lists.
//!
//! The building blocks, leaves first:
//! - [`signer::EventSigner`]: keypair, event signing, NIP-44 encryption.
//! - [`relay::RelayPool`]: websocket connections to N relays with
//!   reconnection, backoff, and resubscription.
//! - [`codec`]: event to message mapping and the gift-wrap layer.
//! - [`transport`]: the client and server transports that multiplex MCP
//!   traffic over the pool.

pub mod codec;
pub mod core;
pub mod relay;
pub mod signer;
pub mod transport;

pub use crate::core::constants;
pub use crate::core::error::{Error, Result};
pub use crate::core::types::{
    CapabilityPrice, ClientSession, EncryptionMode, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, McpMessage, ServerInfo,
};
pub use relay::{PoolEvent, RelayPool, Subscription};
pub use signer::EventSigner;
pub use transport::{
    NostrClientTransport, NostrClientTransportConfig, NostrServerTransport,
    NostrServerTransportConfig, TransportEvent,
};
