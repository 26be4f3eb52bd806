//! Relay pool: fans subscriptions and publishes out to every configured
//! relay, merges and deduplicates inbound events, and keeps connections
//! alive with exponential-backoff reconnection.
//!
//! A background monitor wakes every 5 seconds, reconnects relays that
//! dropped (1 s initial delay doubling to a 30 s cap, abandoned after 5
//! failed attempts), and re-issues every active subscription on the relays
//! that come back.

mod connection;

pub use connection::{RelayConnection, RelayState, RelayStatus};

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use nostr::{Event, EventId, Filter};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::constants::{
    MAX_MESSAGE_SIZE, RECONNECT_CHECK_INTERVAL, RECONNECT_MAX_ATTEMPTS,
};
use crate::core::error::{Error, Result};
use connection::RelayStatus as Status;

/// How many recently seen event ids are kept for cross-relay dedup.
const SEEN_EVENTS_CAPACITY: usize = 4096;

/// What a subscription yields.
#[derive(Debug)]
pub enum PoolEvent {
    Event(Box<Event>),
    /// One relay signalled end of stored events for this subscription.
    EndOfStored,
}

/// Handle to an active subscription; drop it (or call
/// [`RelayPool::unsubscribe`]) to stop receiving.
pub struct Subscription {
    id: String,
    receiver: mpsc::UnboundedReceiver<PoolEvent>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<PoolEvent> {
        self.receiver.recv().await
    }
}

struct SubscriptionEntry {
    filter: Filter,
    sender: mpsc::UnboundedSender<PoolEvent>,
}

struct PoolShared {
    relays: Vec<Arc<RelayConnection>>,
    subscriptions: RwLock<HashMap<String, SubscriptionEntry>>,
    seen: Mutex<LruCache<EventId, ()>>,
    frame_tx: Mutex<Option<mpsc::UnboundedSender<(String, String)>>>,
    next_sub_id: AtomicU64,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Connection manager for N relays.
pub struct RelayPool {
    shared: Arc<PoolShared>,
}

impl RelayPool {
    pub fn new(relay_urls: Vec<String>) -> Self {
        let relays = relay_urls.into_iter().map(RelayConnection::new).collect();
        Self {
            shared: Arc::new(PoolShared {
                relays,
                subscriptions: RwLock::new(HashMap::new()),
                seen: Mutex::new(LruCache::new(
                    NonZeroUsize::new(SEEN_EVENTS_CAPACITY).unwrap(),
                )),
                frame_tx: Mutex::new(None),
                next_sub_id: AtomicU64::new(0),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Dial every relay and start the dispatcher and reconnect monitor.
    /// Idempotent; relays that cannot be reached now are retried with
    /// backoff by the monitor.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        *self.shared.frame_tx.lock().await = Some(frame_tx.clone());

        let mut connected = 0usize;
        for relay in &self.shared.relays {
            relay.state.lock().await.last_attempt = Some(Instant::now());
            match relay.connect(frame_tx.clone()).await {
                Ok(()) => {
                    connected += 1;
                    info!("connected to {}", relay.url);
                }
                Err(e) => {
                    warn!("failed to connect to {}: {e}", relay.url);
                    relay.state.lock().await.record_failure();
                }
            }
        }
        if connected == 0 && !self.shared.relays.is_empty() {
            warn!("no relay reachable at startup; the monitor keeps retrying");
        }

        let mut tasks = self.shared.tasks.lock().await;
        tasks.push(tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            frame_rx,
        )));
        tasks.push(tokio::spawn(monitor_loop(Arc::clone(&self.shared))));

        Ok(())
    }

    /// Close every subscription and connection. Idempotent.
    pub async fn disconnect(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.unsubscribe_all().await;
        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }
        for relay in &self.shared.relays {
            relay.close().await;
        }
        *self.shared.frame_tx.lock().await = None;
    }

    /// Publish an event to every relay. Partial failures are logged; errors
    /// only when no relay accepted the frame.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let frame = serde_json::json!(["EVENT", event]).to_string();
        let mut delivered = 0usize;
        for relay in &self.shared.relays {
            match relay.send_frame(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("publish to {} failed: {e}", relay.url),
            }
        }
        if delivered == 0 {
            return Err(Error::RelayPublish);
        }
        Ok(())
    }

    /// Open a subscription fanned out to every relay. Events are
    /// signature-verified and deduplicated across relays before delivery.
    pub async fn subscribe(&self, filter: Filter) -> Result<Subscription> {
        let id = format!(
            "cvm-sub-{}",
            self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed)
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.subscriptions.write().await.insert(
            id.clone(),
            SubscriptionEntry {
                filter: filter.clone(),
                sender,
            },
        );

        let frame = req_frame(&id, &filter);
        for relay in &self.shared.relays {
            if relay.is_connected().await {
                if let Err(e) = relay.send_frame(frame.clone()).await {
                    debug!("subscribe on {} failed: {e}", relay.url);
                }
            }
        }

        Ok(Subscription { id, receiver })
    }

    pub async fn unsubscribe(&self, subscription_id: &str) {
        if self
            .shared
            .subscriptions
            .write()
            .await
            .remove(subscription_id)
            .is_none()
        {
            return;
        }
        let frame = serde_json::json!(["CLOSE", subscription_id]).to_string();
        for relay in &self.shared.relays {
            if relay.is_connected().await {
                let _ = relay.send_frame(frame.clone()).await;
            }
        }
    }

    pub async fn unsubscribe_all(&self) {
        let ids: Vec<String> = self
            .shared
            .subscriptions
            .read()
            .await
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.unsubscribe(&id).await;
        }
    }

    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for relay in &self.shared.relays {
            if relay.is_connected().await {
                count += 1;
            }
        }
        count
    }

    /// The set of active subscription filters, for inspection.
    pub async fn active_filters(&self) -> Vec<Filter> {
        self.shared
            .subscriptions
            .read()
            .await
            .values()
            .map(|entry| entry.filter.clone())
            .collect()
    }
}

fn req_frame(subscription_id: &str, filter: &Filter) -> String {
    serde_json::json!(["REQ", subscription_id, filter]).to_string()
}

/// Re-issue every active subscription on one relay (after a reconnect).
async fn resubscribe_relay(shared: &Arc<PoolShared>, relay: &Arc<RelayConnection>) {
    let subscriptions = shared.subscriptions.read().await;
    for (id, entry) in subscriptions.iter() {
        let frame = req_frame(id, &entry.filter);
        if let Err(e) = relay.send_frame(frame).await {
            warn!("resubscribe {id} on {} failed: {e}", relay.url);
        }
    }
}

/// Parse relay frames and route events to their subscriptions.
async fn dispatch_loop(
    shared: Arc<PoolShared>,
    mut frames: mpsc::UnboundedReceiver<(String, String)>,
) {
    while let Some((relay_url, text)) = frames.recv().await {
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            debug!("relay {relay_url}: unparseable frame");
            continue;
        };
        let Some(parts) = value.as_array() else {
            continue;
        };
        match parts.first().and_then(Value::as_str) {
            Some("EVENT") if parts.len() >= 3 => {
                let Some(sub_id) = parts[1].as_str() else {
                    continue;
                };
                let event: Event = match serde_json::from_value(parts[2].clone()) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("relay {relay_url}: undecodable event: {e}");
                        continue;
                    }
                };
                if event.content.len() > MAX_MESSAGE_SIZE {
                    warn!("relay {relay_url}: dropping oversized event {}", event.id);
                    continue;
                }
                if let Err(e) = event.verify() {
                    warn!("relay {relay_url}: dropping event with bad signature: {e}");
                    continue;
                }
                {
                    // Same event arriving from another relay.
                    let mut seen = shared.seen.lock().await;
                    if seen.put(event.id, ()).is_some() {
                        continue;
                    }
                }
                let subscriptions = shared.subscriptions.read().await;
                if let Some(entry) = subscriptions.get(sub_id) {
                    let _ = entry.sender.send(PoolEvent::Event(Box::new(event)));
                }
            }
            Some("EOSE") if parts.len() >= 2 => {
                if let Some(sub_id) = parts[1].as_str() {
                    let subscriptions = shared.subscriptions.read().await;
                    if let Some(entry) = subscriptions.get(sub_id) {
                        let _ = entry.sender.send(PoolEvent::EndOfStored);
                    }
                }
            }
            Some("OK") if parts.len() >= 3 => {
                if parts[2].as_bool() == Some(false) {
                    warn!(
                        "relay {relay_url} rejected event {}: {}",
                        parts[1].as_str().unwrap_or("?"),
                        parts.get(3).and_then(|v| v.as_str()).unwrap_or("")
                    );
                }
            }
            Some("NOTICE") => {
                debug!(
                    "relay {relay_url} notice: {}",
                    parts.get(1).and_then(|v| v.as_str()).unwrap_or("")
                );
            }
            Some("CLOSED") => {
                warn!(
                    "relay {relay_url} closed subscription {}: {}",
                    parts.get(1).and_then(|v| v.as_str()).unwrap_or("?"),
                    parts.get(2).and_then(|v| v.as_str()).unwrap_or("")
                );
            }
            _ => {}
        }
    }
}

/// Reconnect dropped relays with backoff; resubscribe on success.
async fn monitor_loop(shared: Arc<PoolShared>) {
    let mut ticker = tokio::time::interval(RECONNECT_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(frame_tx) = shared.frame_tx.lock().await.clone() else {
            break;
        };
        for relay in &shared.relays {
            let attempt = {
                let mut state = relay.state.lock().await;
                if state.status != Status::Disconnected || state.is_reconnecting {
                    false
                } else if state.retry_count >= RECONNECT_MAX_ATTEMPTS {
                    state.status = Status::Abandoned;
                    warn!(
                        "abandoning relay {} after {} failed attempts",
                        relay.url, state.retry_count
                    );
                    false
                } else if state
                    .last_attempt
                    .map_or(true, |at| at.elapsed() >= state.reconnect_interval)
                {
                    state.is_reconnecting = true;
                    state.last_attempt = Some(Instant::now());
                    true
                } else {
                    false
                }
            };
            if attempt {
                let shared = Arc::clone(&shared);
                let relay = Arc::clone(relay);
                let frame_tx = frame_tx.clone();
                tokio::spawn(async move {
                    match relay.connect(frame_tx).await {
                        Ok(()) => {
                            info!("reconnected to {}", relay.url);
                            resubscribe_relay(&shared, &relay).await;
                        }
                        Err(e) => {
                            let mut state = relay.state.lock().await;
                            state.record_failure();
                            warn!(
                                "reconnect to {} failed (attempt {}): {e}",
                                relay.url, state.retry_count
                            );
                        }
                    }
                });
            }
        }
    }
}
