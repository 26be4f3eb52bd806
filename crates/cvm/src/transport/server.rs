//! Server-side transport: multiplexes many remote clients onto one local
//! MCP server.
//!
//! Correlation works by id overloading: the JSON-RPC id of every inbound
//! request is overwritten with the carrier event's id (globally unique
//! across clients) before the request reaches the local server. When the
//! response comes back, that event id locates the session and the client's
//! original id, which is restored in the outbound content while the event id
//! becomes the `e` tag.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, EventId, PublicKey, Tag, TagKind};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::codec;
use crate::core::constants::{
    methods, tags, ANNOUNCEMENT_BOOTSTRAP_ID, ANNOUNCEMENT_INIT_TIMEOUT, CTXVM_MESSAGES_KIND,
    PROMPTS_LIST_KIND, RESOURCES_LIST_KIND, RESOURCETEMPLATES_LIST_KIND,
    SERVER_ANNOUNCEMENT_KIND, SESSION_SWEEP_INTERVAL, SESSION_TIMEOUT, TOOLS_LIST_KIND,
};
use crate::core::error::{Error, Result};
use crate::core::types::{
    CapabilityPrice, ClientSession, EncryptionMode, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpMessage, ServerInfo,
};
use crate::relay::{PoolEvent, RelayPool};
use crate::signer::EventSigner;
use crate::transport::base::{TransportCore, TransportEvent};

/// MCP protocol revision used in the synthesized announcement handshake.
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub struct NostrServerTransportConfig {
    pub server_info: ServerInfo,
    /// Publish discovery events at startup.
    pub is_public_server: bool,
    /// When set, inbound events from other authors are dropped.
    pub allowed_public_keys: Option<HashSet<PublicKey>>,
    pub encryption_mode: EncryptionMode,
    /// Capability id (tool name, resource URI, prompt name) → price.
    pub capability_pricing: HashMap<String, CapabilityPrice>,
    pub session_timeout: Duration,
}

impl Default for NostrServerTransportConfig {
    fn default() -> Self {
        Self {
            server_info: ServerInfo::default(),
            is_public_server: false,
            allowed_public_keys: None,
            encryption_mode: EncryptionMode::default(),
            capability_pricing: HashMap::new(),
            session_timeout: SESSION_TIMEOUT,
        }
    }
}

/// Server-side Nostr transport.
pub struct NostrServerTransport {
    shared: Arc<ServerShared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

struct ServerShared {
    core: TransportCore,
    config: NostrServerTransportConfig,
    sessions: RwLock<HashMap<String, ClientSession>>,
    /// The server's own initialization, used by the announcement bootstrap.
    is_initialized: AtomicBool,
    /// Waiter for the in-flight `"announcement"` bootstrap request.
    announce_slot: Mutex<Option<oneshot::Sender<JsonRpcResponse>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NostrServerTransport {
    pub fn new(
        signer: EventSigner,
        pool: Arc<RelayPool>,
        config: NostrServerTransportConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let encryption_mode = config.encryption_mode;
        Self {
            shared: Arc::new(ServerShared {
                core: TransportCore::new(signer, pool, encryption_mode),
                config,
                sessions: RwLock::new(HashMap::new()),
                is_initialized: AtomicBool::new(false),
                announce_slot: Mutex::new(None),
                events_tx,
                tasks: Mutex::new(Vec::new()),
            }),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.shared.core.signer().public_key()
    }

    /// Connect, subscribe, start the dispatch and sweeper tasks, and kick
    /// off the announcement bootstrap for public servers.
    pub async fn start(&self) -> Result<()> {
        self.shared.core.connect().await?;
        let mut subscription = self
            .shared
            .core
            .pool()
            .subscribe(self.shared.core.inbound_filter())
            .await?;

        info!(
            "server transport listening as {}",
            self.shared.core.signer().public_key_hex()
        );

        let dispatcher = Arc::clone(&self.shared);
        let inbound = tokio::spawn(async move {
            while let Some(pool_event) = subscription.recv().await {
                if let PoolEvent::Event(event) = pool_event {
                    dispatcher.handle_inbound(*event).await;
                }
            }
        });

        let sweeper_shared = Arc::clone(&self.shared);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweeper_shared.sweep_inactive().await;
            }
        });

        let mut tasks = self.shared.tasks.lock().await;
        tasks.push(inbound);
        tasks.push(sweeper);

        if self.shared.config.is_public_server {
            let announcer = Arc::clone(&self.shared);
            tasks.push(tokio::spawn(announcer.run_announcement()));
        }
        Ok(())
    }

    /// Take the consumer side: messages headed for the local MCP server plus
    /// transport errors. Yields `None` after the first call.
    pub async fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Route one message coming back from the local MCP server.
    pub async fn send(&self, message: McpMessage) -> Result<()> {
        match message {
            McpMessage::Response(response) => self.shared.send_response(response).await,
            McpMessage::Notification(notification) => {
                self.shared.send_notification(notification).await
            }
            McpMessage::Request(request) => Err(Error::InvalidEvent(format!(
                "outbound request {} has no remote routing",
                request.method
            ))),
            McpMessage::Invalid => Err(Error::InvalidEvent(
                "invalid outbound message".to_string(),
            )),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    /// Total entries across all pending maps (requests plus progress tokens).
    pub async fn pending_total(&self) -> usize {
        self.shared
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.pending.len())
            .sum()
    }

    /// Close the pool, clear sessions, and notify the consumer.
    pub async fn close(&self) {
        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.shared.core.disconnect().await;
        self.shared.sessions.write().await.clear();
        let _ = self.shared.events_tx.send(TransportEvent::Closed);
    }
}

impl ServerShared {
    /// Inbound path: unwrap, enforce policy, authorize, decode, track the session,
    /// rewrite request ids, and forward to the local server.
    async fn handle_inbound(&self, event: Event) {
        let (event, is_encrypted) = match self.core.open_inbound(event) {
            Ok(opened) => opened,
            Err(e) => {
                match &e {
                    Error::DecryptFailed(_) => {
                        warn!("failed to unwrap inbound event: {e}");
                        let _ = self.events_tx.send(TransportEvent::Error(e));
                    }
                    // Policy mismatches are dropped silently; the remote
                    // client times out instead of learning our policy.
                    Error::EncryptionPolicyMismatch(_) => debug!("{e}"),
                    _ => debug!("dropping inbound event: {e}"),
                }
                return;
            }
        };

        let author = event.pubkey;
        if let Some(allowed) = &self.config.allowed_public_keys {
            if !allowed.contains(&author) {
                // Dropped silently; no reply reveals the allowlist.
                debug!("{}", Error::Unauthorized(author.to_hex()));
                return;
            }
        }

        let message = codec::decode_event(&event);
        if message == McpMessage::Invalid {
            debug!("dropping undecodable content in event {}", event.id);
            return;
        }

        let author_hex = author.to_hex();
        let event_id_hex = event.id.to_hex();

        let forward = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.entry(author_hex.clone()).or_insert_with(|| {
                debug!("new session for {author_hex}");
                ClientSession::new(author_hex.clone(), is_encrypted)
            });
            session.update_activity();
            session.is_encrypted = is_encrypted;

            match message {
                McpMessage::Request(mut request) => {
                    session.remember_request(event_id_hex.clone(), request.id.clone());
                    if let Some(token) = request.progress_token() {
                        session.remember_progress_token(token, event_id_hex.clone());
                    }
                    // The event id is globally unique across concurrent
                    // clients; the local server sees it as the request id.
                    request.id = Value::String(event_id_hex.clone());
                    McpMessage::Request(request)
                }
                McpMessage::Notification(notification) => {
                    if notification.method == methods::INITIALIZED {
                        session.mark_initialized();
                    }
                    McpMessage::Notification(notification)
                }
                other => other,
            }
        };

        if let McpMessage::Request(request) = &forward {
            self.maybe_payment_required(&author, &event.id, request).await;
        }
        let _ = self.events_tx.send(TransportEvent::Message(forward));
    }

    /// Responses: restore the original id, tag `[p, e]`, honor the
    /// session's encryption, then drop the pending entry.
    async fn send_response(&self, mut response: JsonRpcResponse) -> Result<()> {
        if response.id.as_str() == Some(ANNOUNCEMENT_BOOTSTRAP_ID) {
            if let Some(waiter) = self.announce_slot.lock().await.take() {
                let _ = waiter.send(response);
            } else {
                debug!("announcement response arrived with no waiter");
            }
            return Ok(());
        }

        let Some(event_id_hex) = response.id.as_str().map(str::to_string) else {
            self.report(Error::NoPendingRequest(response.id.to_string()));
            return Ok(());
        };

        let located = {
            let sessions = self.sessions.read().await;
            sessions.iter().find_map(|(key, session)| {
                session
                    .original_id(&event_id_hex)
                    .map(|original| (key.clone(), original.clone(), session.is_encrypted))
            })
        };
        let Some((session_key, original_id, session_encrypted)) = located else {
            self.report(Error::NoPendingRequest(event_id_hex));
            return Ok(());
        };

        let client =
            PublicKey::parse(&session_key).map_err(|e| Error::InvalidEvent(e.to_string()))?;
        let request_event_id =
            EventId::from_hex(&event_id_hex).map_err(|e| Error::InvalidEvent(e.to_string()))?;

        let is_initialize = response.is_initialize_result();
        response.id = original_id;

        let mut tag_set = vec![Tag::public_key(client), Tag::event(request_event_id)];
        if is_initialize && session_encrypted {
            tag_set.extend(self.common_tags());
        }

        let encrypt = self
            .core
            .should_encrypt(CTXVM_MESSAGES_KIND, session_encrypted);
        self.core
            .send_mcp_message(
                &McpMessage::Response(response),
                &client,
                CTXVM_MESSAGES_KIND,
                tag_set,
                encrypt,
            )
            .await?;

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_key) {
            session.clear_request(&event_id_hex);
        }
        Ok(())
    }

    /// Notifications: progress goes to the one session that owns
    /// the token; everything else is broadcast to initialized sessions.
    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        self.sweep_inactive().await;

        if notification.method == methods::PROGRESS {
            if let Some(token) = notification.progress_token() {
                let located = {
                    let sessions = self.sessions.read().await;
                    sessions.iter().find_map(|(key, session)| {
                        session
                            .event_id_for_token(&token)
                            .map(|event_id| (key.clone(), event_id, session.is_encrypted))
                    })
                };
                let Some((session_key, event_id_hex, session_encrypted)) = located else {
                    self.report(Error::ProgressWithoutRequest(token));
                    return Ok(());
                };
                let client = PublicKey::parse(&session_key)
                    .map_err(|e| Error::InvalidEvent(e.to_string()))?;
                let request_event_id = EventId::from_hex(&event_id_hex)
                    .map_err(|e| Error::InvalidEvent(e.to_string()))?;

                let tag_set = vec![Tag::public_key(client), Tag::event(request_event_id)];
                let encrypt = self
                    .core
                    .should_encrypt(CTXVM_MESSAGES_KIND, session_encrypted);
                self.core
                    .send_mcp_message(
                        &McpMessage::Notification(notification),
                        &client,
                        CTXVM_MESSAGES_KIND,
                        tag_set,
                        encrypt,
                    )
                    .await?;
                return Ok(());
            }
        }

        let targets: Vec<(String, bool)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|session| session.is_initialized)
                .map(|session| (session.client_pubkey.clone(), session.is_encrypted))
                .collect()
        };
        for (pubkey_hex, session_encrypted) in targets {
            let Ok(client) = PublicKey::parse(&pubkey_hex) else {
                continue;
            };
            let tag_set = vec![Tag::public_key(client)];
            let encrypt = self
                .core
                .should_encrypt(CTXVM_MESSAGES_KIND, session_encrypted);
            if let Err(e) = self
                .core
                .send_mcp_message(
                    &McpMessage::Notification(notification.clone()),
                    &client,
                    CTXVM_MESSAGES_KIND,
                    tag_set,
                    encrypt,
                )
                .await
            {
                warn!("notification broadcast to {pubkey_hex} failed: {e}");
            }
        }
        Ok(())
    }

    /// Emit `notifications/payment_required` ahead of a priced invocation.
    /// The invoice is the request's event id: opaque to the client, unique
    /// per invocation.
    async fn maybe_payment_required(
        &self,
        client: &PublicKey,
        request_event_id: &EventId,
        request: &JsonRpcRequest,
    ) {
        let Some(capability) = priced_capability(request) else {
            return;
        };
        let Some(price) = self.config.capability_pricing.get(capability) else {
            return;
        };

        let notification = JsonRpcNotification::new(
            methods::PAYMENT_REQUIRED,
            Some(json!({
                "amount": price.price,
                "currency": price.currency,
                "invoice": request_event_id.to_hex(),
            })),
        );
        let tag_set = vec![Tag::public_key(*client), Tag::event(*request_event_id)];
        let session_encrypted = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&client.to_hex())
                .map(|session| session.is_encrypted)
                .unwrap_or(false)
        };
        let encrypt = self
            .core
            .should_encrypt(CTXVM_MESSAGES_KIND, session_encrypted);
        if let Err(e) = self
            .core
            .send_mcp_message(
                &McpMessage::Notification(notification),
                client,
                CTXVM_MESSAGES_KIND,
                tag_set,
                encrypt,
            )
            .await
        {
            warn!("failed to send payment notification for {capability}: {e}");
        }
    }

    async fn sweep_inactive(&self) {
        let timeout = self.config.session_timeout;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity.elapsed() < timeout);
        let swept = before - sessions.len();
        if swept > 0 {
            debug!("swept {swept} inactive session(s)");
        }
    }

    /// Discovery bootstrap: synthesize the initialize + list requests under the
    /// `"announcement"` id and publish each result as its discovery kind.
    async fn run_announcement(self: Arc<Self>) {
        let init_params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "cvm-announce",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        match self
            .bootstrap_request("initialize", init_params, ANNOUNCEMENT_INIT_TIMEOUT)
            .await
        {
            Ok(response) if response.error.is_none() => {
                let result = response.result.unwrap_or_else(|| json!({}));
                self.publish_discovery(SERVER_ANNOUNCEMENT_KIND, &result).await;
                self.is_initialized.store(true, Ordering::SeqCst);
                let initialized =
                    JsonRpcNotification::new(methods::INITIALIZED, None);
                let _ = self.events_tx.send(TransportEvent::Message(
                    McpMessage::Notification(initialized),
                ));
            }
            Ok(response) => {
                warn!(
                    "local server rejected initialize: {:?}; publishing lists anyway",
                    response.error
                );
            }
            Err(e) => {
                warn!("local server did not complete initialize: {e}; publishing lists anyway");
            }
        }

        const LISTS: [(&str, u16); 4] = [
            ("tools/list", TOOLS_LIST_KIND),
            ("resources/list", RESOURCES_LIST_KIND),
            ("resources/templates/list", RESOURCETEMPLATES_LIST_KIND),
            ("prompts/list", PROMPTS_LIST_KIND),
        ];
        for (method, kind) in LISTS {
            match self
                .bootstrap_request(method, json!({}), ANNOUNCEMENT_INIT_TIMEOUT)
                .await
            {
                Ok(response) => match (response.result, response.error) {
                    (Some(result), None) => self.publish_discovery(kind, &result).await,
                    _ => debug!("{method} not supported by the local server"),
                },
                Err(e) => warn!("no reply to {method}: {e}"),
            }
        }
    }

    async fn bootstrap_request(
        &self,
        method: &str,
        params: Value,
        wait: Duration,
    ) -> Result<JsonRpcResponse> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        *self.announce_slot.lock().await = Some(waiter_tx);

        let request = JsonRpcRequest::new(ANNOUNCEMENT_BOOTSTRAP_ID, method, Some(params));
        let _ = self
            .events_tx
            .send(TransportEvent::Message(McpMessage::Request(request)));

        match tokio::time::timeout(wait, waiter_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                *self.announce_slot.lock().await = None;
                Err(Error::Timeout("announcement bootstrap"))
            }
        }
    }

    async fn publish_discovery(&self, kind: u16, result: &Value) {
        let content = match serde_json::to_string(result) {
            Ok(content) => content,
            Err(e) => {
                warn!("cannot serialize discovery result for kind {kind}: {e}");
                return;
            }
        };
        match self.core.publish_event(kind, content, self.common_tags()).await {
            Ok(event_id) => info!("published discovery kind {kind}: {event_id}"),
            Err(e) => warn!("failed to publish discovery kind {kind}: {e}"),
        }
    }

    /// The announcement tag set: metadata, encryption support, and one `cap`
    /// tag per priced capability.
    fn common_tags(&self) -> Vec<Tag> {
        let info: &ServerInfo = &self.config.server_info;
        let mut tag_set = Vec::new();
        for (name, value) in [
            (tags::NAME, &info.name),
            (tags::ABOUT, &info.about),
            (tags::WEBSITE, &info.website),
            (tags::PICTURE, &info.picture),
        ] {
            if let Some(value) = value {
                tag_set.push(Tag::custom(TagKind::custom(name), [value.clone()]));
            }
        }
        if self.core.encryption_mode() != EncryptionMode::Disabled {
            tag_set.push(Tag::custom(
                TagKind::custom(tags::SUPPORT_ENCRYPTION),
                Vec::<String>::new(),
            ));
        }
        for (capability, price) in &self.config.capability_pricing {
            tag_set.push(Tag::custom(
                TagKind::custom(tags::CAPABILITY),
                [
                    capability.clone(),
                    price.price.clone(),
                    price.currency.clone(),
                ],
            ));
        }
        tag_set
    }

    fn report(&self, error: Error) {
        warn!("{error}");
        let _ = self.events_tx.send(TransportEvent::Error(error));
    }
}

/// The capability a request invokes, when the method is priceable.
fn priced_capability(request: &JsonRpcRequest) -> Option<&str> {
    let params = request.params.as_ref()?;
    match request.method.as_str() {
        "tools/call" => params.get("name")?.as_str(),
        "resources/read" => params.get("uri")?.as_str(),
        "prompts/get" => params.get("name")?.as_str(),
        _ => None,
    }
}
