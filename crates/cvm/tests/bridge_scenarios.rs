//! End-to-end scenarios: client and server transports talking through an
//! in-process relay.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use cvm::constants::{
    CTXVM_MESSAGES_KIND, PROMPTS_LIST_KIND, RESOURCES_LIST_KIND, RESOURCETEMPLATES_LIST_KIND,
    SERVER_ANNOUNCEMENT_KIND, TOOLS_LIST_KIND,
};
use cvm::{
    CapabilityPrice, EncryptionMode, EventSigner, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, McpMessage, NostrClientTransport,
    NostrClientTransportConfig, NostrServerTransport, NostrServerTransportConfig, RelayPool,
    ServerInfo, TransportEvent,
};
use support::MiniRelay;

/// Spin up a server transport plus a stub local MCP server that answers the
/// handshake, list, and `add` tool calls.
async fn start_add_server(
    relay_url: &str,
    config: NostrServerTransportConfig,
) -> Arc<NostrServerTransport> {
    let pool = Arc::new(RelayPool::new(vec![relay_url.to_string()]));
    let transport = Arc::new(NostrServerTransport::new(
        EventSigner::generate(),
        pool,
        config,
    ));
    transport.start().await.expect("server transport start");
    let events = transport.events().await.expect("server events");

    let responder = Arc::clone(&transport);
    tokio::spawn(run_local_add_server(responder, events));
    transport
}

/// The stub "local MCP server": consumes transport events and sends
/// responses back through the transport, like a gateway pump would.
async fn run_local_add_server(
    transport: Arc<NostrServerTransport>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let TransportEvent::Message(McpMessage::Request(request)) = event else {
            continue;
        };
        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::result(
                request.id.clone(),
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "add-server", "version": "1.0.0"},
                }),
            ),
            "tools/list" => JsonRpcResponse::result(
                request.id.clone(),
                json!({"tools": [{"name": "add", "inputSchema": {"type": "object"}}]}),
            ),
            "tools/call" => {
                if let Some(token) = request.progress_token() {
                    for step in 1..=2 {
                        let progress = JsonRpcNotification::new(
                            "notifications/progress",
                            Some(json!({"progressToken": token, "progress": step, "total": 2})),
                        );
                        let _ = transport
                            .send(McpMessage::Notification(progress))
                            .await;
                    }
                }
                let arguments = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let sum = arguments["a"].as_i64().unwrap_or(0)
                    + arguments["b"].as_i64().unwrap_or(0);
                JsonRpcResponse::result(
                    request.id.clone(),
                    json!({"content": [{"type": "text", "text": sum.to_string()}]}),
                )
            }
            "resources/list" => {
                JsonRpcResponse::result(request.id.clone(), json!({"resources": []}))
            }
            "resources/templates/list" => {
                JsonRpcResponse::result(request.id.clone(), json!({"resourceTemplates": []}))
            }
            "prompts/list" => JsonRpcResponse::result(request.id.clone(), json!({"prompts": []})),
            other => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id.clone(),
                result: None,
                error: Some(JsonRpcError {
                    code: -32601,
                    message: format!("Method not found: {other}"),
                    data: None,
                }),
            },
        };
        let _ = transport.send(McpMessage::Response(response)).await;
    }
}

async fn start_client(
    relay_url: &str,
    server: &Arc<NostrServerTransport>,
    encryption_mode: EncryptionMode,
) -> (
    Arc<NostrClientTransport>,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let pool = Arc::new(RelayPool::new(vec![relay_url.to_string()]));
    let transport = Arc::new(NostrClientTransport::new(
        EventSigner::generate(),
        pool,
        NostrClientTransportConfig {
            server_pubkey: server.public_key(),
            encryption_mode,
        },
    ));
    transport.start().await.expect("client transport start");
    let events = transport.events().await.expect("client events");
    (transport, events)
}

async fn next_message(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> McpMessage {
    match timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for a transport event")
        .expect("transport channel closed")
    {
        TransportEvent::Message(message) => message,
        TransportEvent::Error(e) => panic!("transport error: {e}"),
        TransportEvent::Closed => panic!("transport closed"),
    }
}

async fn wait_until<F, Fut>(what: &str, wait: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn plain_list_round_trip() {
    let relay = MiniRelay::start().await;
    let server = start_add_server(&relay.url, NostrServerTransportConfig::default()).await;
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Disabled).await;

    let request = JsonRpcRequest::new(7, "tools/list", Some(json!({})));
    client
        .send(&McpMessage::Request(request))
        .await
        .expect("send");

    match next_message(&mut events).await {
        McpMessage::Response(response) => {
            // The client observes exactly its own JSON-RPC id.
            assert_eq!(response.id, json!(7));
            let tools = &response.result.unwrap()["tools"];
            assert_eq!(tools[0]["name"], json!("add"));
        }
        other => panic!("expected response, got {other:?}"),
    }

    assert_eq!(client.pending_count().await, 0);
    wait_until("server pending map drains", Duration::from_secs(5), || {
        let server = Arc::clone(&server);
        async move { server.pending_total().await == 0 }
    })
    .await;

    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn concurrent_clients_get_their_own_ids_back() {
    let relay = MiniRelay::start().await;
    let server = start_add_server(&relay.url, NostrServerTransportConfig::default()).await;

    let mut clients = Vec::new();
    for i in 1..=5_i64 {
        let (client, events) = start_client(&relay.url, &server, EncryptionMode::Disabled).await;
        clients.push((i, client, events));
    }

    // All clients pick overlapping JSON-RPC ids on purpose.
    for (i, client, _) in &clients {
        let request = JsonRpcRequest::new(
            *i,
            "tools/call",
            Some(json!({"name": "add", "arguments": {"a": i, "b": 10 * i}})),
        );
        client
            .send(&McpMessage::Request(request))
            .await
            .expect("send");
    }

    for (i, _, events) in &mut clients {
        match next_message(events).await {
            McpMessage::Response(response) => {
                assert_eq!(response.id, json!(*i));
                let text = response.result.unwrap()["content"][0]["text"]
                    .as_str()
                    .unwrap()
                    .to_string();
                assert_eq!(text, (*i + 10 * *i).to_string());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    wait_until("server pending map drains", Duration::from_secs(5), || {
        let server = Arc::clone(&server);
        async move { server.pending_total().await == 0 }
    })
    .await;
    assert_eq!(server.session_count().await, 5);

    for (_, client, _) in &clients {
        client.close().await;
    }
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn required_server_ignores_cleartext_clients() {
    let relay = MiniRelay::start().await;
    let config = NostrServerTransportConfig {
        encryption_mode: EncryptionMode::Required,
        ..Default::default()
    };
    let server = start_add_server(&relay.url, config).await;
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Disabled).await;

    let request = JsonRpcRequest::new(1, "tools/list", Some(json!({})));
    client
        .send(&McpMessage::Request(request))
        .await
        .expect("send");

    // The client times out; no handshake reply betrays the policy.
    let silence = timeout(Duration::from_millis(1500), events.recv()).await;
    assert!(silence.is_err(), "expected no response, got {silence:?}");

    // No message event authored by the server targets the client.
    let server_hex = server.public_key().to_hex();
    let from_server: Vec<_> = relay
        .events_of_kind(u64::from(CTXVM_MESSAGES_KIND))
        .await
        .into_iter()
        .filter(|event| event["pubkey"].as_str() == Some(server_hex.as_str()))
        .collect();
    assert!(from_server.is_empty(), "server leaked a cleartext reply");

    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn encrypted_round_trip_never_hits_the_wire_in_clear() {
    let relay = MiniRelay::start().await;
    let server = start_add_server(&relay.url, NostrServerTransportConfig::default()).await;
    // Required on the client: every outbound message is wrapped.
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Required).await;

    let request = JsonRpcRequest::new(3, "tools/list", Some(json!({})));
    client
        .send(&McpMessage::Request(request))
        .await
        .expect("send");

    match next_message(&mut events).await {
        McpMessage::Response(response) => {
            assert_eq!(response.id, json!(3));
            assert!(response.result.is_some());
        }
        other => panic!("expected response, got {other:?}"),
    }

    // Both directions travelled as gift wraps only.
    assert!(relay
        .events_of_kind(u64::from(CTXVM_MESSAGES_KIND))
        .await
        .is_empty());
    assert!(relay.events_of_kind(1059).await.len() >= 2);

    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn progress_notifications_reach_only_the_originating_client() {
    let relay = MiniRelay::start().await;
    let server = start_add_server(&relay.url, NostrServerTransportConfig::default()).await;
    let (client_a, mut events_a) =
        start_client(&relay.url, &server, EncryptionMode::Disabled).await;
    let (client_b, mut events_b) =
        start_client(&relay.url, &server, EncryptionMode::Disabled).await;

    let tracked = JsonRpcRequest::new(
        1,
        "tools/call",
        Some(json!({
            "name": "add",
            "arguments": {"a": 1, "b": 2},
            "_meta": {"progressToken": "t-42"},
        })),
    );
    client_a
        .send(&McpMessage::Request(tracked))
        .await
        .expect("send tracked");

    let plain = JsonRpcRequest::new(
        1,
        "tools/call",
        Some(json!({"name": "add", "arguments": {"a": 5, "b": 5}})),
    );
    client_b
        .send(&McpMessage::Request(plain))
        .await
        .expect("send plain");

    // A sees its two progress notifications, in order, then the result.
    for step in 1..=2_i64 {
        match next_message(&mut events_a).await {
            McpMessage::Notification(notification) => {
                assert_eq!(notification.method, "notifications/progress");
                let params = notification.params.unwrap();
                assert_eq!(params["progressToken"], json!("t-42"));
                assert_eq!(params["progress"], json!(step));
            }
            other => panic!("expected progress notification, got {other:?}"),
        }
    }
    match next_message(&mut events_a).await {
        McpMessage::Response(response) => assert_eq!(response.id, json!(1)),
        other => panic!("expected response, got {other:?}"),
    }

    // B sees only its own response.
    match next_message(&mut events_b).await {
        McpMessage::Response(response) => assert_eq!(response.id, json!(1)),
        other => panic!("expected response, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        events_b.try_recv().is_err(),
        "client B received traffic meant for A"
    );

    client_a.close().await;
    client_b.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn public_server_announces_itself() {
    let relay = MiniRelay::start().await;
    let config = NostrServerTransportConfig {
        server_info: ServerInfo {
            name: Some("Test".to_string()),
            about: Some("integration fixture".to_string()),
            ..Default::default()
        },
        is_public_server: true,
        capability_pricing: HashMap::from([(
            "add".to_string(),
            CapabilityPrice {
                price: "10".to_string(),
                currency: "sats".to_string(),
            },
        )]),
        ..Default::default()
    };
    let server = start_add_server(&relay.url, config).await;
    let server_hex = server.public_key().to_hex();

    let announcements = relay
        .wait_for_kind(u64::from(SERVER_ANNOUNCEMENT_KIND), Duration::from_secs(5))
        .await;
    let announcement = &announcements[0];
    assert_eq!(announcement["pubkey"].as_str(), Some(server_hex.as_str()));

    let tags: Vec<Vec<String>> = announcement["tags"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tag| {
            tag.as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect()
        })
        .collect();
    assert!(tags.contains(&vec!["name".to_string(), "Test".to_string()]));
    assert!(tags.contains(&vec!["support_encryption".to_string()]));
    assert!(tags.contains(&vec![
        "cap".to_string(),
        "add".to_string(),
        "10".to_string(),
        "sats".to_string()
    ]));

    let content: serde_json::Value =
        serde_json::from_str(announcement["content"].as_str().unwrap()).unwrap();
    assert!(content.get("protocolVersion").is_some());

    // The capability lists follow as their own replaceable kinds.
    for kind in [
        TOOLS_LIST_KIND,
        RESOURCES_LIST_KIND,
        RESOURCETEMPLATES_LIST_KIND,
        PROMPTS_LIST_KIND,
    ] {
        relay
            .wait_for_kind(u64::from(kind), Duration::from_secs(5))
            .await;
    }

    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn priced_capability_emits_payment_required_first() {
    let relay = MiniRelay::start().await;
    let config = NostrServerTransportConfig {
        capability_pricing: HashMap::from([(
            "add".to_string(),
            CapabilityPrice {
                price: "21".to_string(),
                currency: "sats".to_string(),
            },
        )]),
        ..Default::default()
    };
    let server = start_add_server(&relay.url, config).await;
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Disabled).await;

    let request = JsonRpcRequest::new(
        4,
        "tools/call",
        Some(json!({"name": "add", "arguments": {"a": 2, "b": 3}})),
    );
    client
        .send(&McpMessage::Request(request))
        .await
        .expect("send");

    match next_message(&mut events).await {
        McpMessage::Notification(notification) => {
            assert_eq!(notification.method, "notifications/payment_required");
            let params = notification.params.unwrap();
            assert_eq!(params["amount"], json!("21"));
            assert_eq!(params["currency"], json!("sats"));
            assert!(params["invoice"].as_str().is_some());
        }
        other => panic!("expected payment notification, got {other:?}"),
    }
    match next_message(&mut events).await {
        McpMessage::Response(response) => {
            assert_eq!(response.id, json!(4));
            assert_eq!(
                response.result.unwrap()["content"][0]["text"],
                json!("5")
            );
        }
        other => panic!("expected response, got {other:?}"),
    }

    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn encrypted_initialize_carries_discovery_tags() {
    let relay = MiniRelay::start().await;
    let config = NostrServerTransportConfig {
        server_info: ServerInfo {
            name: Some("Wrapped".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let server = start_add_server(&relay.url, config).await;
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Required).await;

    let request = JsonRpcRequest::new(
        0,
        "initialize",
        Some(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.0.0"},
        })),
    );
    client
        .send(&McpMessage::Request(request))
        .await
        .expect("send initialize");

    match next_message(&mut events).await {
        McpMessage::Response(response) => {
            assert_eq!(response.id, json!(0));
            assert!(response.is_initialize_result());
        }
        other => panic!("expected initialize result, got {other:?}"),
    }

    // The response travelled wrapped, and the inner event carried the
    // server's metadata tags, which the client captured.
    let captured = client
        .server_initialize()
        .await
        .expect("initialize not captured");
    assert_eq!(captured.author, server.public_key());
    assert!(captured.supports_encryption);
    assert!(relay
        .events_of_kind(u64::from(CTXVM_MESSAGES_KIND))
        .await
        .is_empty());

    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn idle_sessions_are_swept_end_to_end() {
    let relay = MiniRelay::start().await;
    let config = NostrServerTransportConfig {
        session_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let server = start_add_server(&relay.url, config).await;
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Disabled).await;

    let request = JsonRpcRequest::new(1, "tools/list", Some(json!({})));
    client
        .send(&McpMessage::Request(request))
        .await
        .expect("send");
    next_message(&mut events).await;
    assert_eq!(server.session_count().await, 1);

    // Within timeout plus one sweep interval the session is gone.
    wait_until("idle session is swept", Duration::from_secs(10), || {
        let server = Arc::clone(&server);
        async move { server.session_count().await == 0 }
    })
    .await;

    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn malformed_content_does_not_break_the_subscription() {
    let relay = MiniRelay::start().await;
    let server = start_add_server(&relay.url, NostrServerTransportConfig::default()).await;

    // Hand-publish an event whose content is not JSON at all.
    let garbage_author = EventSigner::generate();
    let garbage_pool = RelayPool::new(vec![relay.url.clone()]);
    garbage_pool.connect().await.unwrap();
    let garbage = garbage_author
        .sign(
            nostr::EventBuilder::new(nostr::Kind::from(CTXVM_MESSAGES_KIND), "not json at all")
                .tag(nostr::Tag::public_key(server.public_key()))
                .build(garbage_author.public_key()),
        )
        .unwrap();
    garbage_pool.publish(&garbage).await.unwrap();

    // A valid request afterwards still gets its answer.
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Disabled).await;
    let request = JsonRpcRequest::new(11, "tools/list", Some(json!({})));
    client
        .send(&McpMessage::Request(request))
        .await
        .expect("send");

    match next_message(&mut events).await {
        McpMessage::Response(response) => assert_eq!(response.id, json!(11)),
        other => panic!("expected response, got {other:?}"),
    }

    garbage_pool.disconnect().await;
    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn responses_with_unknown_correlation_are_dropped() {
    let relay = MiniRelay::start().await;
    let server = start_add_server(&relay.url, NostrServerTransportConfig::default()).await;
    let (client, mut events) = start_client(&relay.url, &server, EncryptionMode::Disabled).await;

    // A "response" referencing an event id the client never published.
    let forger = EventSigner::generate();
    let forger_pool = RelayPool::new(vec![relay.url.clone()]);
    forger_pool.connect().await.unwrap();
    let bogus_reference = nostr::EventId::all_zeros();
    let response = McpMessage::Response(JsonRpcResponse::result(99, json!({"ok": true})));
    let event = forger
        .sign(
            cvm::codec::encode_mcp_message(
                &response,
                forger.public_key(),
                CTXVM_MESSAGES_KIND,
                vec![
                    nostr::Tag::public_key(client.public_key()),
                    nostr::Tag::event(bogus_reference),
                ],
            )
            .unwrap(),
        )
        .unwrap();
    forger_pool.publish(&event).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        events.try_recv().is_err(),
        "uncorrelated response reached the consumer"
    );

    forger_pool.disconnect().await;
    client.close().await;
    server.close().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn pool_reestablishes_subscriptions_after_a_relay_drop() {
    let relay = MiniRelay::start().await;

    let listener_pool = RelayPool::new(vec![relay.url.clone()]);
    listener_pool.connect().await.unwrap();
    let filter = nostr::Filter::new().kind(nostr::Kind::from(9999_u16));
    let mut subscription = listener_pool.subscribe(filter.clone()).await.unwrap();
    let filters_before = listener_pool.active_filters().await;

    // Kill every connection; the monitor reconnects with backoff and
    // re-issues the subscription.
    relay.disconnect_all().await;
    wait_until("listener pool reconnects", Duration::from_secs(15), || {
        let pool = &listener_pool;
        async move { pool.connected_count().await == 1 }
    })
    .await;
    assert_eq!(listener_pool.active_filters().await, filters_before);

    // A publisher (also recovering) eventually delivers through the new
    // connections.
    let publisher = EventSigner::generate();
    let publisher_pool = RelayPool::new(vec![relay.url.clone()]);
    publisher_pool.connect().await.unwrap();
    let event = publisher
        .sign(
            nostr::EventBuilder::new(nostr::Kind::from(9999_u16), "{}")
                .build(publisher.public_key()),
        )
        .unwrap();
    publisher_pool.publish(&event).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let received = timeout(deadline - tokio::time::Instant::now(), subscription.recv())
            .await
            .expect("timed out waiting for post-reconnect delivery")
            .expect("subscription closed");
        match received {
            cvm::PoolEvent::Event(delivered) => {
                assert_eq!(delivered.id, event.id);
                break;
            }
            // EOSE markers from the original and re-issued REQs.
            cvm::PoolEvent::EndOfStored => continue,
        }
    }

    publisher_pool.disconnect().await;
    listener_pool.disconnect().await;
    relay.shutdown().await;
}
