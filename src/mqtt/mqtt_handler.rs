//! Broker client - owner of the single broker connection
//!
//! All traffic of a process multiplexes over one [`BrokerClient`]. Clones share the
//! same connection. The connection state machine:
//!
//! ```text
//!                connect()            transport Connected
//! Disconnected ───────────► Connecting ───────────────────► Connected
//!      ▲                     │     ▲                           │
//!      │ disconnect()        │     │ backoff elapsed           │ transport closed
//!      │                     ▼     │                           ▼
//!      └──────────────── Reconnecting ◄─────────────────────────┘
//!                            │
//!                            └──► Failed (retry budget spent, manual connect only)
//! ```
//!
//! Transport events are handled by one pump task per transport, so they are
//! processed strictly in arrival order. Events of a transport that has been replaced
//! or explicitly closed are ignored via a generation counter.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectOptions, ReconnectPolicy};
use super::error::{BrokerError, TransportError};
use super::message_manager::{InboundMessage, Message};
use super::topics;
use super::transport::{Ack, Transport, TransportEvent, TransportLink};
use crate::command::DeviceCommand;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// A reconnect is scheduled after the backoff delay
    Reconnecting,
    /// Automatic reconnection gave up
    Failed,
}

/// Events emitted to every listener of a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected { reconnect_attempts: u32 },
    Error(BrokerError),
    Message(InboundMessage),
}

/// Synchronous snapshot for rendering connectivity
#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_error: Option<BrokerError>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub subscriptions: Vec<String>,
}

type AttemptOutcome = Option<Result<(), BrokerError>>;

#[derive(Default)]
struct Connection {
    state: ConnectionState,
    link: Option<Arc<dyn TransportLink>>,
    attempt: Option<watch::Sender<AttemptOutcome>>,
    generation: u64,
    reconnect_attempts: u32,
    reconnect_timer: Option<CancellationToken>,
    options: ConnectOptions,
    subscriptions: BTreeSet<String>,
    last_error: Option<BrokerError>,
    messages_received: usize,
    messages_sent: usize,
    last_activity: Option<DateTime<Local>>,
}

impl Connection {
    fn live_link(&self) -> Result<Arc<dyn TransportLink>, BrokerError> {
        match (&self.state, &self.link) {
            (ConnectionState::Connected, Some(link)) => Ok(link.clone()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    fn settle_attempt(&mut self, outcome: Result<(), BrokerError>) {
        if let Some(attempt) = self.attempt.take() {
            attempt.send_replace(Some(outcome));
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    connection: Mutex<Connection>,
    events: broadcast::Sender<BrokerEvent>,
    consumers: AtomicUsize,
}

/// Shared handle to the broker connection
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("state", &self.connection_state())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl BrokerClient {
    pub fn new(transport: impl Transport, policy: ReconnectPolicy) -> Self {
        Self::with_transport(Arc::new(transport), policy)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                transport,
                policy,
                connection: Mutex::new(Connection::default()),
                events,
                consumers: AtomicUsize::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: BrokerEvent) {
        // No listeners is fine; events are best effort.
        let _ = self.inner.events.send(event);
    }

    /// New listener for lifecycle and message events
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn last_error(&self) -> Option<BrokerError> {
        self.lock().last_error.clone()
    }

    pub fn status(&self) -> MQTTStatus {
        let conn = self.lock();
        MQTTStatus {
            connection_state: conn.state,
            reconnect_attempts: conn.reconnect_attempts,
            last_error: conn.last_error.clone(),
            messages_received: conn.messages_received,
            messages_sent: conn.messages_sent,
            last_activity: conn.last_activity,
            subscriptions: conn.subscriptions.iter().cloned().collect(),
        }
    }

    /// Connects, or joins the attempt already in flight
    ///
    /// Resolves immediately when already connected. A manual connect cancels a
    /// scheduled reconnect and, after the retry budget was spent, starts a fresh one.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), BrokerError> {
        let mut outcome = {
            let mut conn = self.lock();
            if conn.state == ConnectionState::Connected {
                return Ok(());
            }
            let joined = conn.attempt.as_ref().map(watch::Sender::subscribe);
            match joined {
                Some(outcome) => {
                    debug!("Joining in-flight connection attempt");
                    outcome
                }
                None => {
                    conn.cancel_reconnect_timer();
                    if conn.state == ConnectionState::Failed {
                        conn.reconnect_attempts = 0;
                    }
                    self.begin_attempt(&mut conn, options)?
                }
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or(Err(BrokerError::Aborted)),
            Err(_) => Err(BrokerError::Aborted),
        };
        result
    }

    /// Opens a transport and registers the attempt; the caller holds the lock
    fn begin_attempt(
        &self,
        conn: &mut Connection,
        options: ConnectOptions,
    ) -> Result<watch::Receiver<AttemptOutcome>, BrokerError> {
        info!("Connecting to MQTT broker at {}", options.broker_url());
        conn.options = options;
        conn.state = ConnectionState::Connecting;

        let session = match self.inner.transport.open(&conn.options) {
            Ok(session) => session,
            Err(e) => {
                let error = BrokerError::Connection(e.to_string());
                error!("Failed to open MQTT transport: {}", e);
                conn.last_error = Some(error.clone());
                self.emit(BrokerEvent::Error(error.clone()));
                self.close_locked(conn);
                return Err(error);
            }
        };

        conn.generation += 1;
        conn.link = Some(session.link);
        let (attempt, outcome) = watch::channel(None);
        conn.attempt = Some(attempt);
        self.spawn_event_pump(conn.generation, session.events);
        Ok(outcome)
    }

    fn spawn_event_pump(&self, generation: u64, mut events: mpsc::Receiver<TransportEvent>) {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !client.handle_transport_event(generation, event) {
                    return;
                }
            }
            client.handle_close(generation);
        });
    }

    /// Returns `false` once this transport's events no longer matter
    fn handle_transport_event(&self, generation: u64, event: TransportEvent) -> bool {
        let mut conn = self.lock();
        if conn.generation != generation || conn.link.is_none() {
            debug!(generation, "Ignoring event from retired transport");
            return false;
        }

        match event {
            TransportEvent::Connected => {
                info!("Connected to MQTT broker");
                conn.state = ConnectionState::Connected;
                conn.reconnect_attempts = 0;
                conn.last_error = None;
                conn.last_activity = Some(Local::now());
                conn.settle_attempt(Ok(()));
                self.emit(BrokerEvent::Connected);
                true
            }
            TransportEvent::Error(reason) if conn.state == ConnectionState::Connecting => {
                error!("MQTT connection attempt failed: {}", reason);
                let error = BrokerError::Connection(reason);
                conn.last_error = Some(error.clone());
                conn.settle_attempt(Err(error.clone()));
                self.emit(BrokerEvent::Error(error));
                self.close_locked(&mut conn);
                false
            }
            TransportEvent::Error(reason) => {
                warn!("MQTT transport error: {}", reason);
                let error = BrokerError::Transport(reason);
                conn.last_error = Some(error.clone());
                self.emit(BrokerEvent::Error(error));
                true
            }
            TransportEvent::Message { topic, payload } => {
                conn.messages_received += 1;
                conn.last_activity = Some(Local::now());
                self.emit(BrokerEvent::Message(InboundMessage::from_bytes(topic, &payload)));
                true
            }
            TransportEvent::Closed => {
                self.close_locked(&mut conn);
                false
            }
        }
    }

    fn handle_close(&self, generation: u64) {
        let mut conn = self.lock();
        if conn.generation == generation && conn.link.is_some() {
            self.close_locked(&mut conn);
        }
    }

    /// Unexpected loss of the transport: tear down and schedule a retry
    fn close_locked(&self, conn: &mut Connection) {
        warn!("MQTT connection closed");
        if let Some(link) = conn.link.take() {
            link.close();
        }
        conn.settle_attempt(Err(BrokerError::Connection(
            "transport closed before connecting".to_string(),
        )));
        conn.state = ConnectionState::Disconnected;
        self.emit(BrokerEvent::Disconnected {
            reconnect_attempts: conn.reconnect_attempts,
        });
        self.schedule_reconnect(conn);
    }

    fn schedule_reconnect(&self, conn: &mut Connection) {
        let Some(delay) = self.inner.policy.delay_for(conn.reconnect_attempts) else {
            let error = BrokerError::ReconnectExhausted {
                attempts: conn.reconnect_attempts,
            };
            error!("{}", error);
            conn.state = ConnectionState::Failed;
            conn.last_error = Some(error.clone());
            self.emit(BrokerEvent::Error(error));
            return;
        };

        conn.reconnect_attempts += 1;
        conn.state = ConnectionState::Reconnecting;
        conn.cancel_reconnect_timer();
        let timer = CancellationToken::new();
        conn.reconnect_timer = Some(timer.clone());

        info!(
            attempt = conn.reconnect_attempts,
            max_attempts = self.inner.policy.max_attempts,
            "Reconnecting in {:?}",
            delay
        );

        let client = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => debug!("Scheduled reconnect cancelled"),
                _ = tokio::time::sleep(delay) => client.fire_reconnect(timer.clone()).await,
            }
        });
    }

    async fn fire_reconnect(&self, timer: CancellationToken) {
        let outcome = {
            let mut conn = self.lock();
            // disconnect() or a manual connect may have raced the timer
            if timer.is_cancelled() || conn.attempt.is_some() {
                return;
            }
            conn.reconnect_timer = None;
            let options = conn.options.clone();
            self.begin_attempt(&mut conn, options)
        };

        let result = match outcome {
            Ok(mut outcome) => match outcome.wait_for(Option::is_some).await {
                Ok(settled) => settled.clone().unwrap_or(Err(BrokerError::Aborted)),
                Err(_) => Err(BrokerError::Aborted),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Reconnect attempt failed: {}", e);
        }
    }

    /// Closes the connection and stops automatic reconnection
    ///
    /// Safe to call in any state; a pending connection attempt is rejected with
    /// [`BrokerError::Aborted`].
    pub fn disconnect(&self) {
        let mut conn = self.lock();
        conn.cancel_reconnect_timer();
        conn.generation += 1;
        if let Some(link) = conn.link.take() {
            info!("Disconnecting from MQTT broker");
            link.close();
        }
        conn.settle_attempt(Err(BrokerError::Aborted));
        conn.state = ConnectionState::Disconnected;
        conn.reconnect_attempts = 0;
        conn.subscriptions.clear();
        self.emit(BrokerEvent::Disconnected {
            reconnect_attempts: 0,
        });
    }

    async fn await_ack(ack: Ack) -> Result<(), TransportError> {
        ack.await.unwrap_or(Err(TransportError::Closed))
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let (generation, ack) = {
            let conn = self.lock();
            (conn.generation, conn.live_link()?.subscribe(topic))
        };
        let reason = match ack {
            Ok(ack) => match Self::await_ack(ack).await {
                Ok(()) => {
                    debug!("Subscribed to {}", topic);
                    let mut conn = self.lock();
                    // the set belongs to the transport that acknowledged
                    if conn.generation == generation {
                        conn.subscriptions.insert(topic.to_string());
                    }
                    return Ok(());
                }
                Err(reason) => reason,
            },
            Err(reason) => reason,
        };
        Err(BrokerError::Subscribe {
            topic: topic.to_string(),
            reason,
        })
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let (generation, ack) = {
            let conn = self.lock();
            (conn.generation, conn.live_link()?.unsubscribe(topic))
        };
        let result = match ack {
            Ok(ack) => Self::await_ack(ack).await,
            Err(reason) => Err(reason),
        };
        match result {
            Ok(()) => {
                let mut conn = self.lock();
                if conn.generation == generation {
                    conn.subscriptions.remove(topic);
                }
                Ok(())
            }
            Err(reason) => Err(BrokerError::Unsubscribe {
                topic: topic.to_string(),
                reason,
            }),
        }
    }

    /// Publishes with QoS 1 and resolves on the broker's acknowledgment
    pub async fn publish(
        &self,
        topic: &str,
        message: impl Into<Message>,
    ) -> Result<(), BrokerError> {
        let link = self.lock().live_link()?;
        let payload = message.into().into_bytes()?;

        let result = match link.publish(topic, payload) {
            Ok(ack) => Self::await_ack(ack).await,
            Err(reason) => Err(reason),
        };
        match result {
            Ok(()) => {
                let mut conn = self.lock();
                conn.messages_sent += 1;
                conn.last_activity = Some(Local::now());
                Ok(())
            }
            Err(reason) => Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason,
            }),
        }
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
    ) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.publish(topic, Message::structured(value)?).await
    }

    /// Publishes `command` to `comando/{device_id}`
    pub async fn publish_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), BrokerError> {
        let topic = topics::command_topic(device_id);
        info!(device_id, ?command, "Publishing device command");
        self.publish_json(&topic, command).await
    }

    /// Registers a consumer of this client; see [`ConsumerLease`]
    pub fn acquire(&self) -> ConsumerLease {
        let consumers = self.inner.consumers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(consumers, "Consumer attached to MQTT client");
        ConsumerLease {
            client: self.clone(),
            released: false,
        }
    }

    pub fn consumers(&self) -> usize {
        self.inner.consumers.load(Ordering::SeqCst)
    }
}

/// Keeps the shared connection open for one consumer
///
/// Releasing the last lease disconnects the client; releasing any other lease
/// leaves the connection to the remaining consumers.
pub struct ConsumerLease {
    client: BrokerClient,
    released: bool,
}

impl ConsumerLease {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let remaining = self.client.inner.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(remaining, "Consumer detached from MQTT client");
        if remaining == 0 {
            self.client.disconnect();
        }
    }
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
