//! Thin bridge orchestrators for ContextVM.
//!
//! Wires the `cvm` transports to local MCP endpoints: the [`gateway`]
//! exposes a local MCP server to remote Nostr clients, the [`proxy`] gives a
//! local stdio caller access to a remote server. No protocol logic lives
//! here; these modules only pump messages between a transport and a duplex.

pub mod config;
pub mod gateway;
pub mod local;
pub mod proxy;

pub use config::BridgeConfig;
pub use gateway::Gateway;
pub use local::StdioMcpServer;
pub use proxy::Proxy;
