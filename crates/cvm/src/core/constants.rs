//! ContextVM protocol constants.

use std::time::Duration;

/// ContextVM messages (ephemeral events).
pub const CTXVM_MESSAGES_KIND: u16 = 25910;

/// Encrypted envelope carrying a signed ContextVM message.
pub const GIFT_WRAP_KIND: u16 = 1059;

/// Server announcement (replaceable by author + kind).
pub const SERVER_ANNOUNCEMENT_KIND: u16 = 11316;

/// Tools list (replaceable).
pub const TOOLS_LIST_KIND: u16 = 11317;

/// Resources list (replaceable).
pub const RESOURCES_LIST_KIND: u16 = 11318;

/// Resource templates list (replaceable).
pub const RESOURCETEMPLATES_LIST_KIND: u16 = 11319;

/// Prompts list (replaceable).
pub const PROMPTS_LIST_KIND: u16 = 11320;

/// Nostr tag constants.
pub mod tags {
    /// Public key tag.
    pub const PUBKEY: &str = "p";

    /// Event ID tag for request/response correlation.
    pub const EVENT_ID: &str = "e";

    /// Capability tag for pricing metadata.
    pub const CAPABILITY: &str = "cap";

    /// Name tag for server announcements.
    pub const NAME: &str = "name";

    /// Website tag for server announcements.
    pub const WEBSITE: &str = "website";

    /// Picture tag for server announcements.
    pub const PICTURE: &str = "picture";

    /// About tag for server announcements.
    pub const ABOUT: &str = "about";

    /// Presence-only tag marking that the server accepts encrypted traffic.
    pub const SUPPORT_ENCRYPTION: &str = "support_encryption";
}

/// JSON-RPC method names the transports act on.
pub mod methods {
    /// Client-side handshake completion notification.
    pub const INITIALIZED: &str = "notifications/initialized";

    /// Progress notification, routed by progress token.
    pub const PROGRESS: &str = "notifications/progress";

    /// Emitted before the result of a priced capability invocation.
    pub const PAYMENT_REQUIRED: &str = "notifications/payment_required";
}

/// JSON-RPC id used for the internal announcement bootstrap requests.
pub const ANNOUNCEMENT_BOOTSTRAP_ID: &str = "announcement";

/// Maximum serialized message / event content size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Gift-wrap timestamps are jittered backwards up to this many seconds.
/// The inbound subscription window is widened by the same amount so a
/// backdated wrap never falls outside the filter.
pub const GIFT_WRAP_JITTER_SECS: u64 = 300;

/// Per-relay connection attempt timeout.
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the pool inspects relay connection status.
pub const RECONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// First reconnection delay; doubles on every failed attempt.
pub const RECONNECT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Reconnection delay cap.
pub const RECONNECT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Failed attempts after which a relay is abandoned.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// How long the announcement bootstrap waits for the local server to
/// answer `initialize` before proceeding with a warning.
pub const ANNOUNCEMENT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sessions idle longer than this are swept (configurable per transport).
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the server transport sweeps inactive sessions.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
