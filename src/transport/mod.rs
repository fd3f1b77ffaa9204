//! TransportRouter - broker connection and message dispatch
//!
//! ## Responsibilities
//!
//! - Own the single MQTT connection to the broker
//! - Manage wildcard topic subscriptions (single-level `+`)
//! - Dispatch inbound messages to registered handlers
//! - Publish outbound payloads at QoS >= 1
//!
//! ## Dispatch rule
//!
//! Handlers are scanned in registration order and the first pattern that
//! matches the inbound topic wins. Later matching patterns are never
//! invoked for that message. The scan is a plain ordered array walk, so
//! dispatch is deterministic for any handler table.
//!
//! ## Connection state machine
//!
//! `Disconnected -> Connecting -> Connected <-> Reconnecting -> Failed`
//!
//! Reconnects back off exponentially up to a bounded attempt count;
//! exceeding the bound parks the router in the terminal `Failed` state and
//! every later `publish`/`subscribe` reports `NotConnected`.

mod topic;

pub use topic::TopicPattern;

use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    /// Bound on the initial connect handshake
    pub connect_timeout: Duration,
    /// Reconnect attempts before the router parks in `Failed`
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt, capped at 60s
    pub reconnect_base_delay: Duration,
    /// Inbound queue capacity; messages arriving while full are dropped
    pub inbound_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "stickguard-server".to_string(),
            connect_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            reconnect_base_delay: Duration::from_secs(1),
            inbound_queue_capacity: 1024,
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: reconnect attempt bound exceeded
    Failed,
}

/// An inbound broker message
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Handler seam for inbound messages.
///
/// Implementations must log-and-drop their own failures; a bad payload is
/// never a router-level error.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: InboundMessage);
}

/// Outbound seam used by the command dispatcher (and tests)
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> Result<()>;
}

struct Subscription {
    pattern: TopicPattern,
    handler: Arc<dyn MessageHandler>,
}

/// Dispatch/queue counters for the system-status endpoint
#[derive(Default)]
pub struct RouterCounters {
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub dispatched: AtomicU64,
    pub unmatched: AtomicU64,
}

/// Counter snapshot plus connection state
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouterStats {
    pub state: ConnectionState,
    pub subscriptions: usize,
    pub received: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub unmatched: u64,
}

/// TransportRouter instance
pub struct TransportRouter {
    config: TransportConfig,
    client: RwLock<Option<AsyncClient>>,
    state: RwLock<ConnectionState>,
    subscriptions: RwLock<Vec<Subscription>>,
    counters: RouterCounters,
}

impl TransportRouter {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            client: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            subscriptions: RwLock::new(Vec::new()),
            counters: RouterCounters::default(),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn stats(&self) -> RouterStats {
        RouterStats {
            state: self.state().await,
            subscriptions: self.subscriptions.read().await.len(),
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
        }
    }

    /// Establish the broker connection.
    ///
    /// Spawns the event-loop task and the dispatch-loop task, then waits
    /// for the first ConnAck up to `connect_timeout`. Registered
    /// subscriptions are re-established on every (re)connect.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Connected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        // Manual reconnect handling in the poll loop; rumqttc reconnects
        // on the next poll() after an error.
        let (client, eventloop) = AsyncClient::new(options, 64);

        *self.client.write().await = Some(client);

        let (inbound_tx, inbound_rx) =
            mpsc::channel::<InboundMessage>(self.config.inbound_queue_capacity);
        let (connected_tx, connected_rx) = oneshot::channel::<()>();

        let router = Arc::clone(self);
        let poll_task = tokio::spawn(async move {
            router.run_event_loop(eventloop, inbound_tx, connected_tx).await;
        });

        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.run_dispatch_loop(inbound_rx).await;
        });

        match tokio::time::timeout(self.config.connect_timeout, connected_rx).await {
            Ok(Ok(())) => {
                info!(
                    broker = %self.config.broker_host,
                    port = self.config.broker_port,
                    "Broker connected"
                );
                Ok(())
            }
            _ => {
                poll_task.abort();
                *self.client.write().await = None;
                *self.state.write().await = ConnectionState::Disconnected;
                Err(Error::Connection(format!(
                    "broker connect timed out after {:?}",
                    self.config.connect_timeout
                )))
            }
        }
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut eventloop: rumqttc::EventLoop,
        inbound_tx: mpsc::Sender<InboundMessage>,
        connected_tx: oneshot::Sender<()>,
    ) {
        let mut connected_tx = Some(connected_tx);
        let mut attempts: u32 = 0;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    attempts = 0;
                    *self.state.write().await = ConnectionState::Connected;
                    if let Some(tx) = connected_tx.take() {
                        let _ = tx.send(());
                    }
                    self.resubscribe_all().await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.enqueue_inbound(
                        &inbound_tx,
                        InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        },
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    attempts += 1;
                    if attempts > self.config.max_reconnect_attempts {
                        *self.state.write().await = ConnectionState::Failed;
                        *self.client.write().await = None;
                        error!(
                            attempts,
                            error = %e,
                            "Reconnect attempt bound exceeded, transport is down"
                        );
                        return;
                    }
                    *self.state.write().await = ConnectionState::Reconnecting;
                    let delay = Self::backoff_delay(self.config.reconnect_base_delay, attempts);
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection lost, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Queue one inbound message for dispatch. A full queue drops the
    /// message and counts it; the event loop is never blocked.
    fn enqueue_inbound(&self, inbound_tx: &mpsc::Sender<InboundMessage>, msg: InboundMessage) -> bool {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match inbound_tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %e.into_inner().topic, "Inbound queue full, message dropped");
                false
            }
        }
    }

    /// Exponential backoff capped at 60s, with up to 500ms of jitter
    fn backoff_delay(base: Duration, attempt: u32) -> Duration {
        let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(Duration::from_secs(60));
        let jitter = rand::thread_rng().gen_range(0..500);
        capped + Duration::from_millis(jitter)
    }

    async fn resubscribe_all(&self) {
        let patterns: Vec<String> = {
            let subs = self.subscriptions.read().await;
            subs.iter().map(|s| s.pattern.as_str().to_string()).collect()
        };
        let client = self.client.read().await;
        let Some(client) = client.as_ref() else {
            return;
        };
        for pattern in patterns {
            if let Err(e) = client.subscribe(pattern.as_str(), QoS::AtLeastOnce).await {
                warn!(pattern = %pattern, error = %e, "Resubscribe failed");
            } else {
                debug!(pattern = %pattern, "Resubscribed");
            }
        }
    }

    async fn run_dispatch_loop(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundMessage>) {
        while let Some(msg) = inbound_rx.recv().await {
            self.dispatch(msg).await;
        }
        debug!("Dispatch loop ended");
    }

    /// Route one message to the first matching handler, in registration
    /// order. No match is counted, not an error.
    async fn dispatch(&self, msg: InboundMessage) {
        let handler = {
            let subs = self.subscriptions.read().await;
            subs.iter()
                .find(|s| s.pattern.matches(&msg.topic))
                .map(|s| Arc::clone(&s.handler))
        };
        match handler {
            Some(handler) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                handler.handle(msg).await;
            }
            None => {
                self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %msg.topic, "No handler matched topic");
            }
        }
    }

    /// Register a handler and subscribe its pattern on the broker.
    ///
    /// Registration order is dispatch priority (first match wins).
    pub async fn subscribe(&self, pattern: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(Error::NotConnected(format!(
                "cannot subscribe to {pattern}: transport not connected"
            )));
        }

        {
            let client = self.client.read().await;
            let client = client.as_ref().ok_or_else(|| {
                Error::NotConnected("cannot subscribe: no broker client".to_string())
            })?;
            client
                .subscribe(pattern, QoS::AtLeastOnce)
                .await
                .map_err(|e| Error::Internal(format!("subscribe {pattern} failed: {e}")))?;
        }

        let mut subs = self.subscriptions.write().await;
        subs.push(Subscription {
            pattern: TopicPattern::new(pattern),
            handler,
        });
        info!(pattern = %pattern, order = subs.len(), "Subscribed");
        Ok(())
    }

    /// Publish a payload at QoS 1. The Ok result means the broker client
    /// accepted the message, nothing more.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(Error::NotConnected(format!(
                "cannot publish to {topic}: transport not connected"
            )));
        }
        let client = self.client.read().await;
        let client = client
            .as_ref()
            .ok_or_else(|| Error::NotConnected("cannot publish: no broker client".to_string()))?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("publish to {topic} failed: {e}")))
    }

    #[cfg(test)]
    pub(crate) async fn register_for_test(&self, pattern: &str, handler: Arc<dyn MessageHandler>) {
        self.subscriptions.write().await.push(Subscription {
            pattern: TopicPattern::new(pattern),
            handler,
        });
    }
}

#[async_trait]
impl CommandTransport for TransportRouter {
    async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    async fn publish_json(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        self.publish(topic, serde_json::to_vec(payload)?).await
    }
}
