//! # Command/Status Bridge
//!
//! Per-consumer adapter on top of the shared [`BrokerClient`]. A bridge owns:
//!
//! - a registry of topic patterns with callbacks, replayed as subscriptions on every
//!   `Connected` event
//! - a dispatch task that routes inbound messages to every matching callback in
//!   registration order
//! - a [`DeviceStatusStore`] fed from `ac-control/+/+/status` and a sweep task that
//!   expires records nobody refreshed within the staleness window
//!
//! ```text
//! BrokerClient events ──► dispatch task ──► HandlerRegistry ──► status_handler ──► DeviceStatusStore
//!                                                                                       ▲
//!                                                              sweep task (interval) ───┘
//! ```
//!
//! Errors never escape the dispatch task. They become the bridge's last error and are
//! handed to the `on_error` callback.

pub mod registry;
pub mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::DeviceCommand;
use crate::mqtt::topics::{TopicError, STATUS_PATTERN};
use crate::mqtt::{BrokerClient, BrokerError, BrokerEvent, ConnectOptions, ConnectionState, ConsumerLease};
pub use registry::{DispatchError, Handler, HandlerRegistry};
pub use status::{status_handler, DeviceStatus, DeviceStatusStore, StatusUpdate};

/// Tunables of the `[bridge]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub status_pattern: String,
    pub sweep_interval_secs: u64,
    pub staleness_window_secs: u64,
    /// Buffer of the status update feed
    pub event_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            status_pattern: STATUS_PATTERN.to_string(),
            sweep_interval_secs: 60,
            staleness_window_secs: 300,
            event_capacity: 256,
        }
    }
}

impl BridgeSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }
}

type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(u32) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&BrokerError) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_error: Option<ErrorCallback>,
}

/// State shared between a bridge handle and its tasks
struct BridgeShared {
    registry: HandlerRegistry,
    callbacks: Callbacks,
    connected: AtomicBool,
    last_error: Mutex<Option<BrokerError>>,
}

impl BridgeShared {
    fn set_last_error(&self, error: Option<BrokerError>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = error;
    }

    fn last_error(&self) -> Option<BrokerError> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn report(&self, error: BrokerError) {
        if let Some(on_error) = &self.callbacks.on_error {
            on_error(&error);
        }
        self.set_last_error(Some(error));
    }

    fn handle_event(&self, client: &BrokerClient, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                self.set_last_error(None);
                if let Some(on_connect) = &self.callbacks.on_connect {
                    on_connect();
                }
                self.replay_subscriptions(client);
            }
            BrokerEvent::Disconnected { reconnect_attempts } => {
                self.connected.store(false, Ordering::SeqCst);
                if let Some(on_disconnect) = &self.callbacks.on_disconnect {
                    on_disconnect(reconnect_attempts);
                }
            }
            BrokerEvent::Error(error) => self.report(error),
            BrokerEvent::Message(message) => {
                let matched = self.registry.dispatch(&message.topic, &message.payload);
                if matched == 0 {
                    debug!(topic = message.topic.as_str(), "No handler for message");
                }
            }
        }
    }

    /// Realigns the connected flag after lifecycle events may have been skipped
    fn resync(&self, client: &BrokerClient) {
        let connected = client.is_connected();
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was_connected {
            self.replay_subscriptions(client);
        }
    }

    fn replay_subscriptions(&self, client: &BrokerClient) {
        let patterns = self.registry.patterns();
        if patterns.is_empty() {
            return;
        }
        let client = client.clone();
        tokio::spawn(async move {
            for pattern in patterns {
                match client.subscribe(&pattern).await {
                    Ok(()) => info!("Subscribed to {}", pattern),
                    Err(e) => warn!("Subscription replay failed: {}", e),
                }
            }
        });
    }
}

/// Collects registrations before the bridge starts listening
pub struct BridgeBuilder {
    client: BrokerClient,
    registry: HandlerRegistry,
    callbacks: Callbacks,
    settings: BridgeSettings,
    options: ConnectOptions,
    track_status: bool,
}

impl BridgeBuilder {
    pub fn new(client: BrokerClient) -> Self {
        Self {
            client,
            registry: HandlerRegistry::default(),
            callbacks: Callbacks::default(),
            settings: BridgeSettings::default(),
            options: ConnectOptions::default(),
            track_status: false,
        }
    }

    pub fn settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Options used when the bridge has to establish the connection itself
    pub fn connect_with(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers `handler` for topics matching `pattern`, called with `(payload, topic)`
    pub fn subscribe<F>(mut self, pattern: &str, handler: F) -> Result<Self, TopicError>
    where
        F: Fn(&str, &str) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        self.registry.register(pattern, Arc::new(handler))?;
        Ok(self)
    }

    /// Feeds the status store from the configured status pattern
    pub fn track_device_status(mut self) -> Self {
        self.track_status = true;
        self
    }

    pub fn on_connect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&BrokerError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(callback));
        self
    }

    /// Starts the dispatch and sweep tasks and brings the connection up
    ///
    /// Must be called within a tokio runtime. When the client is already connected
    /// the registered patterns are subscribed right away, otherwise the bridge
    /// connects with the configured options.
    pub fn attach(self) -> Result<StatusBridge, TopicError> {
        let BridgeBuilder {
            client,
            mut registry,
            callbacks,
            settings,
            options,
            track_status,
        } = self;

        let store = DeviceStatusStore::new(settings.event_capacity);
        if track_status {
            registry.register(&settings.status_pattern, status_handler(store.clone()))?;
        }

        let lease = client.acquire();
        let events = client.events();
        let shared = Arc::new(BridgeShared {
            registry,
            callbacks,
            connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(run_dispatch(
            client.clone(),
            shared.clone(),
            events,
            shutdown.clone(),
        ));
        tokio::spawn(run_sweep(store.clone(), settings.clone(), shutdown.clone()));

        if client.is_connected() {
            shared.connected.store(true, Ordering::SeqCst);
            shared.replay_subscriptions(&client);
        } else {
            let client = client.clone();
            let options = options.clone();
            tokio::spawn(async move {
                if let Err(e) = client.connect(options).await {
                    // already reported through the error event
                    debug!("Initial connect failed: {}", e);
                }
            });
        }

        info!(handlers = shared.registry.len(), "Status bridge attached");

        Ok(StatusBridge {
            client,
            shared,
            store,
            options,
            shutdown,
            lease: Some(lease),
        })
    }
}

async fn run_dispatch(
    client: BrokerClient,
    shared: Arc<BridgeShared>,
    mut events: broadcast::Receiver<BrokerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => shared.handle_event(&client, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bridge fell behind the broker event stream");
                    shared.resync(&client);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("Bridge dispatch stopped");
}

async fn run_sweep(store: DeviceStatusStore, settings: BridgeSettings, shutdown: CancellationToken) {
    let period = settings.sweep_interval();
    let window = settings.staleness_window();
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                store.sweep(window);
            }
        }
    }
}

/// A running bridge; dropping it stops its tasks and releases its hold on the client
pub struct StatusBridge {
    client: BrokerClient,
    shared: Arc<BridgeShared>,
    store: DeviceStatusStore,
    options: ConnectOptions,
    shutdown: CancellationToken,
    lease: Option<ConsumerLease>,
}

impl StatusBridge {
    pub fn builder(client: BrokerClient) -> BridgeBuilder {
        BridgeBuilder::new(client)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<BrokerError> {
        self.shared.last_error()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.connection_state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.client.reconnect_attempts()
    }

    pub fn store(&self) -> &DeviceStatusStore {
        &self.store
    }

    pub fn device_status(&self, key: &str) -> Option<DeviceStatus> {
        self.store.get(key)
    }

    pub fn device_statuses(&self) -> HashMap<String, DeviceStatus> {
        self.store.snapshot()
    }

    pub async fn publish_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), BrokerError> {
        self.client
            .publish_command(device_id, command)
            .await
            .inspect_err(|e| self.shared.report(e.clone()))
    }

    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.client
            .connect(self.options.clone())
            .await
            .inspect_err(|e| self.shared.set_last_error(Some(e.clone())))
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    /// Stops the bridge; the client disconnects if this was its last consumer
    pub fn detach(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(lease) = self.lease.take() {
            info!("Status bridge detached");
            lease.release();
        }
    }
}

impl Drop for StatusBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
