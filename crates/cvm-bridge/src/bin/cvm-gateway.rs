//! Expose a local MCP server to the Nostr network.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nostr::nips::nip19::ToBech32;

use cvm::{EventSigner, NostrServerTransport, RelayPool};
use cvm_bridge::{BridgeConfig, Gateway, StdioMcpServer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the bridge configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nostr relay URLs (overrides config)
    #[arg(long)]
    relay: Vec<String>,

    /// Nostr private key (nsec or hex format) (overrides config)
    #[arg(long)]
    private_key: Option<String>,

    /// Encryption mode: optional, required, disabled (overrides config)
    #[arg(long)]
    encryption: Option<String>,

    /// Server display name (overrides config)
    #[arg(long)]
    name: Option<String>,

    /// Publish discovery events at startup (overrides config)
    #[arg(long)]
    public: bool,

    /// Local MCP server command (overrides config)
    #[arg(long)]
    mcp_command: Option<String>,

    /// Arguments for the local MCP server command
    #[arg(long)]
    mcp_arg: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };

    // Apply CLI overrides
    if !args.relay.is_empty() {
        config.nostr.relays = args.relay;
    }
    if let Some(private_key) = args.private_key {
        config.nostr.private_key = Some(private_key);
    }
    if let Some(encryption) = args.encryption {
        config.encryption.mode = encryption;
    }
    if let Some(name) = args.name {
        config.server.name = Some(name);
    }
    if args.public {
        config.server.public = true;
    }
    if let Some(command) = args.mcp_command {
        config.mcp.command = Some(command);
    }
    if !args.mcp_arg.is_empty() {
        config.mcp.args = args.mcp_arg;
    }

    let signer = match &config.nostr.private_key {
        Some(private_key) => EventSigner::from_secret(private_key)?,
        None => {
            let signer = EventSigner::generate();
            println!("\nGenerated new private key!");
            println!("Public key (npub): {}", signer.public_key().to_bech32()?);
            println!(
                "Save this secret to your config [nostr] section to keep the identity:\n  private_key = \"{}\"\n",
                signer.keys().secret_key().to_bech32()?
            );
            signer
        }
    };

    let command = config
        .mcp
        .command
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no local MCP server configured ([mcp] command)"))?;

    println!("Server pubkey: {}", signer.public_key().to_bech32()?);
    println!("Relays: {:?}", config.nostr.relays);
    println!("Local MCP server: {command}");

    let server = StdioMcpServer::spawn(&command, &config.mcp.args, &config.mcp.env)?;
    let to_server = server.sender();
    let from_server = server
        .take_receiver()
        .await
        .expect("receiver taken once at startup");

    let pool = Arc::new(RelayPool::new(config.nostr.relays.clone()));
    let transport = NostrServerTransport::new(signer, pool, config.server_transport_config()?);

    let gateway = Gateway::new(transport);
    let result = gateway.run(to_server, from_server).await;

    server.shutdown().await;
    result
}
