//! Reach a remote MCP server over Nostr from a local stdio caller.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nostr::nips::nip19::ToBech32;
use nostr::PublicKey;

use cvm::{EventSigner, NostrClientTransport, NostrClientTransportConfig, RelayPool};
use cvm_bridge::{BridgeConfig, Proxy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Remote server public key (hex or npub)
    #[arg(short, long)]
    server: String,

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
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout is the JSON-RPC channel.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    if !args.relay.is_empty() {
        config.nostr.relays = args.relay;
    }
    if let Some(private_key) = args.private_key {
        config.nostr.private_key = Some(private_key);
    }
    if let Some(encryption) = args.encryption {
        config.encryption.mode = encryption;
    }

    let server_pubkey = PublicKey::parse(&args.server)
        .map_err(|e| anyhow::anyhow!("invalid server pubkey {}: {e}", args.server))?;

    let signer = match &config.nostr.private_key {
        Some(private_key) => EventSigner::from_secret(private_key)?,
        None => {
            let signer = EventSigner::generate();
            eprintln!("Using throwaway identity {}", signer.public_key().to_bech32()?);
            signer
        }
    };

    let transport_config = NostrClientTransportConfig {
        server_pubkey,
        encryption_mode: config.encryption.parse_mode()?,
    };

    let pool = Arc::new(RelayPool::new(config.nostr.relays.clone()));
    let transport = NostrClientTransport::new(signer, pool, transport_config);

    Proxy::new(transport).run_stdio().await
}
