//! MCP transports over the relay pool.

pub mod base;
pub mod client;
pub mod server;

pub use base::TransportEvent;
pub use client::{NostrClientTransport, NostrClientTransportConfig, ServerInitialize};
pub use server::{NostrServerTransport, NostrServerTransportConfig};
