//! In-process websocket relay for integration tests.
//!
//! Speaks just enough NIP-01 for the transports: EVENT/REQ/CLOSE inbound,
//! EVENT/EOSE/OK outbound, filter matching on kinds, authors, ids, `#p`, and
//! since/until. Stores everything it accepts (replaceable kinds keep only
//! the latest per author + kind) so tests can assert on the wire traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type PeerId = u64;

pub struct MiniRelay {
    pub url: String,
    shared: Arc<RelayShared>,
    accept_task: JoinHandle<()>,
}

struct RelayShared {
    events: Mutex<Vec<Value>>,
    peers: RwLock<HashMap<PeerId, mpsc::UnboundedSender<String>>>,
    subs: RwLock<HashMap<(PeerId, String), Vec<Value>>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MiniRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let shared = Arc::new(RelayShared {
            events: Mutex::new(Vec::new()),
            peers: RwLock::new(HashMap::new()),
            subs: RwLock::new(HashMap::new()),
            conn_tasks: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            let mut next_peer: PeerId = 0;
            while let Ok((stream, _)) = listener.accept().await {
                next_peer += 1;
                let conn_shared = Arc::clone(&accept_shared);
                let handle = tokio::spawn(handle_conn(stream, next_peer, conn_shared));
                accept_shared.conn_tasks.lock().await.push(handle);
            }
        });

        Self {
            url,
            shared,
            accept_task,
        }
    }

    /// Everything the relay has accepted so far.
    pub async fn stored_events(&self) -> Vec<Value> {
        self.shared.events.lock().await.clone()
    }

    pub async fn events_of_kind(&self, kind: u64) -> Vec<Value> {
        self.stored_events()
            .await
            .into_iter()
            .filter(|event| event["kind"].as_u64() == Some(kind))
            .collect()
    }

    /// Poll until at least one event of `kind` is stored, or time out.
    pub async fn wait_for_kind(&self, kind: u64, wait: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let events = self.events_of_kind(kind).await;
            if !events.is_empty() {
                return events;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("no kind-{kind} event appeared within {wait:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Drop every client connection (the listener keeps running), so pools
    /// exercise their reconnect path.
    pub async fn disconnect_all(&self) {
        for task in self.shared.conn_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.shared.peers.write().await.clear();
        self.shared.subs.write().await.clear();
    }

    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.disconnect_all().await;
    }
}

async fn handle_conn(stream: TcpStream, peer: PeerId, shared: Arc<RelayShared>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut reader) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    shared.peers.write().await.insert(peer, tx);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = reader.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let Some(parts) = value.as_array() else {
            continue;
        };
        match parts.first().and_then(Value::as_str) {
            Some("EVENT") if parts.len() >= 2 => {
                let event = parts[1].clone();
                let event_id = event["id"].as_str().unwrap_or("").to_string();
                store_and_broadcast(&shared, event).await;
                send_to(&shared, peer, json!(["OK", event_id, true, ""]).to_string()).await;
            }
            Some("REQ") if parts.len() >= 3 => {
                let sub_id = parts[1].as_str().unwrap_or_default().to_string();
                let filters: Vec<Value> = parts[2..].to_vec();

                let stored = shared.events.lock().await.clone();
                for event in &stored {
                    if filters.iter().any(|filter| filter_matches(filter, event)) {
                        send_to(&shared, peer, json!(["EVENT", sub_id, event]).to_string()).await;
                    }
                }
                send_to(&shared, peer, json!(["EOSE", sub_id]).to_string()).await;

                shared.subs.write().await.insert((peer, sub_id), filters);
            }
            Some("CLOSE") if parts.len() >= 2 => {
                let sub_id = parts[1].as_str().unwrap_or_default().to_string();
                shared.subs.write().await.remove(&(peer, sub_id));
            }
            _ => {}
        }
    }

    shared.peers.write().await.remove(&peer);
    shared.subs.write().await.retain(|(p, _), _| *p != peer);
}

async fn send_to(shared: &Arc<RelayShared>, peer: PeerId, frame: String) {
    if let Some(sender) = shared.peers.read().await.get(&peer) {
        let _ = sender.send(frame);
    }
}

async fn store_and_broadcast(shared: &Arc<RelayShared>, event: Value) {
    let kind = event["kind"].as_u64().unwrap_or(0);
    {
        let mut events = shared.events.lock().await;
        // Replaceable range: keep only the latest per author + kind.
        if (10000..20000).contains(&kind) {
            let author = event["pubkey"].as_str().unwrap_or("").to_string();
            events.retain(|stored| {
                !(stored["kind"].as_u64() == Some(kind)
                    && stored["pubkey"].as_str() == Some(author.as_str()))
            });
        }
        events.push(event.clone());
    }

    let subs = shared.subs.read().await;
    let peers = shared.peers.read().await;
    for ((peer, sub_id), filters) in subs.iter() {
        if filters.iter().any(|filter| filter_matches(filter, &event)) {
            if let Some(sender) = peers.get(peer) {
                let _ = sender.send(json!(["EVENT", sub_id, event]).to_string());
            }
        }
    }
}

fn filter_matches(filter: &Value, event: &Value) -> bool {
    if let Some(kinds) = filter.get("kinds").and_then(Value::as_array) {
        if !kinds.contains(&event["kind"]) {
            return false;
        }
    }
    if let Some(authors) = filter.get("authors").and_then(Value::as_array) {
        if !authors.contains(&event["pubkey"]) {
            return false;
        }
    }
    if let Some(ids) = filter.get("ids").and_then(Value::as_array) {
        if !ids.contains(&event["id"]) {
            return false;
        }
    }
    if let Some(p_values) = filter.get("#p").and_then(Value::as_array) {
        let referenced: Vec<&str> = event["tags"]
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|tag| {
                        let tag = tag.as_array()?;
                        if tag.first()?.as_str()? == "p" {
                            tag.get(1)?.as_str()
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !p_values
            .iter()
            .filter_map(Value::as_str)
            .any(|p| referenced.contains(&p))
        {
            return false;
        }
    }
    if let Some(since) = filter.get("since").and_then(Value::as_u64) {
        if event["created_at"].as_u64().unwrap_or(0) < since {
            return false;
        }
    }
    if let Some(until) = filter.get("until").and_then(Value::as_u64) {
        if event["created_at"].as_u64().unwrap_or(u64::MAX) > until {
            return false;
        }
    }
    true
}
