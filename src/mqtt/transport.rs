//! Transport seam between the broker client and the wire
//!
//! A [`Transport`] opens one session per connection attempt. The session is a
//! [`TransportLink`] for outgoing requests plus a channel of [`TransportEvent`]s that
//! ends with `Closed`. Requests return an [`Ack`] receiver that resolves when the
//! broker acknowledges the packet.
//!
//! [`MqttTransport`] is the rumqttc implementation. rumqttc hands out packet ids only
//! when a request leaves its queue, so acknowledgments are correlated in two steps:
//!
//! ```text
//! publish() ──► queued (FIFO) ──Outgoing::Publish(pkid)──► inflight[pkid] ──PubAck──► Ack
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::ConnectOptions;
use super::error::TransportError;

/// Resolves once the broker acknowledged (or refused) a request
pub type Ack = oneshot::Receiver<Result<(), TransportError>>;
type AckSender = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the connection
    Connected,
    /// Transport failure; before `Connected` it means the attempt failed
    Error(String),
    Message { topic: String, payload: Vec<u8> },
    /// Terminal; no events follow
    Closed,
}

pub struct TransportSession {
    pub link: Arc<dyn TransportLink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub trait Transport: Send + Sync + 'static {
    fn open(&self, options: &ConnectOptions) -> Result<TransportSession, TransportError>;
}

/// Outgoing side of an open session; every request is QoS 1
pub trait TransportLink: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<Ack, TransportError>;
    fn unsubscribe(&self, topic: &str) -> Result<Ack, TransportError>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, TransportError>;
    /// Drops the connection without waiting for the broker
    fn close(&self);
}

/// Waiters for one packet kind
#[derive(Default)]
struct AckQueue {
    queued: VecDeque<AckSender>,
    inflight: HashMap<u16, AckSender>,
}

impl AckQueue {
    fn enqueue(&mut self, waiter: AckSender) {
        self.queued.push_back(waiter);
    }

    /// Undo the last `enqueue` when the request could not be handed to the client
    fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    /// The oldest queued request left the client with `pkid`
    fn assign(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(waiter) => {
                if let Some(stale) = self.inflight.insert(pkid, waiter) {
                    let _ = stale.send(Err(TransportError::Closed));
                }
            }
            None => warn!(pkid, "Outgoing packet without a queued waiter"),
        }
    }

    fn resolve(&mut self, pkid: u16, result: Result<(), TransportError>) {
        match self.inflight.remove(&pkid) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(pkid, "Acknowledgment for unknown packet id"),
        }
    }

    fn fail_all(&mut self, error: &TransportError) {
        for waiter in self.queued.drain(..).chain(self.inflight.drain().map(|(_, w)| w)) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

#[derive(Default)]
struct AckTracker {
    publishes: AckQueue,
    subscribes: AckQueue,
    unsubscribes: AckQueue,
}

impl AckTracker {
    fn fail_all(&mut self, error: TransportError) {
        self.publishes.fail_all(&error);
        self.subscribes.fail_all(&error);
        self.unsubscribes.fail_all(&error);
    }
}

type SharedAcks = Arc<Mutex<AckTracker>>;

fn lock_acks(acks: &SharedAcks) -> MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// rumqttc-backed transport
#[derive(Debug, Clone)]
pub struct MqttTransport {
    capacity: usize,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl MqttTransport {
    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(options.client_id(), options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive())
            .set_clean_session(true);

        if let Some(username) = &options.username {
            mqtt_options.set_credentials(
                username.clone(),
                options.password.clone().unwrap_or_default(),
            );
        }
        if options.ssl {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        mqtt_options
    }
}

impl Transport for MqttTransport {
    fn open(&self, options: &ConnectOptions) -> Result<TransportSession, TransportError> {
        if options.host.is_empty() {
            return Err(TransportError::Open("broker host is empty".to_string()));
        }

        info!("Opening MQTT transport to {}", options.broker_url());
        let (client, event_loop) = AsyncClient::new(Self::mqtt_options(options), self.capacity);
        let (event_tx, event_rx) = mpsc::channel(self.capacity);
        let acks = SharedAcks::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(drive_event_loop(
            event_loop,
            acks.clone(),
            event_tx,
            shutdown.clone(),
        ));

        Ok(TransportSession {
            link: Arc::new(MqttLink {
                client,
                acks,
                shutdown,
            }),
            events: event_rx,
        })
    }
}

struct MqttLink {
    client: AsyncClient,
    acks: SharedAcks,
    shutdown: CancellationToken,
}

impl MqttLink {
    fn request<F>(
        &self,
        select: fn(&mut AckTracker) -> &mut AckQueue,
        send: F,
    ) -> Result<Ack, TransportError>
    where
        F: FnOnce(&AsyncClient) -> Result<(), rumqttc::ClientError>,
    {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        // The waiter must be queued before the request can reach the event loop.
        let mut acks = lock_acks(&self.acks);
        select(&mut *acks).enqueue(tx);
        if let Err(e) = send(&self.client) {
            select(&mut *acks).cancel_last();
            return Err(TransportError::Request(e.to_string()));
        }
        Ok(rx)
    }
}

impl TransportLink for MqttLink {
    fn subscribe(&self, topic: &str) -> Result<Ack, TransportError> {
        self.request(
            |acks| &mut acks.subscribes,
            |client| client.try_subscribe(topic, QoS::AtLeastOnce),
        )
    }

    fn unsubscribe(&self, topic: &str) -> Result<Ack, TransportError> {
        self.request(
            |acks| &mut acks.unsubscribes,
            |client| client.try_unsubscribe(topic),
        )
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, TransportError> {
        self.request(
            |acks| &mut acks.publishes,
            |client| client.try_publish(topic, QoS::AtLeastOnce, false, payload),
        )
    }

    fn close(&self) {
        let _ = self.client.try_disconnect();
        self.shutdown.cancel();
    }
}

/// Polls the rumqttc event loop until the connection ends
///
/// rumqttc reconnects on the next `poll` after an error; the loop stops at the
/// first error instead so the broker client stays in charge of reconnection.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    acks: SharedAcks,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("MQTT transport closed locally");
                break;
            }
            polled = event_loop.poll() => polled,
        };

        let forward = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!(session_present = ack.session_present, "Broker accepted connection");
                    Some(TransportEvent::Connected)
                } else {
                    let _ = events
                        .send(TransportEvent::Error(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )))
                        .await;
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "Incoming publish");
                Some(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                })
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                lock_acks(&acks).publishes.resolve(ack.pkid, Ok(()));
                None
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if refused {
                    Err(TransportError::Rejected("subscription refused".to_string()))
                } else {
                    Ok(())
                };
                lock_acks(&acks).subscribes.resolve(ack.pkid, result);
                None
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                lock_acks(&acks).unsubscribes.resolve(ack.pkid, Ok(()));
                None
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Broker sent DISCONNECT");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                lock_acks(&acks).publishes.assign(pkid);
                None
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                lock_acks(&acks).subscribes.assign(pkid);
                None
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                lock_acks(&acks).unsubscribes.assign(pkid);
                None
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(other) => {
                trace!(event = ?other, "MQTT notification");
                None
            }
            Err(e) => {
                error!("MQTT connection error: {}", e);
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        };

        if let Some(event) = forward {
            if events.send(event).await.is_err() {
                debug!("Transport event receiver dropped");
                break;
            }
        }
    }

    {
        let mut tracker = lock_acks(&acks);
        let pending = tracker.publishes.pending()
            + tracker.subscribes.pending()
            + tracker.unsubscribes.pending();
        if pending > 0 {
            warn!(pending, "Failing unacknowledged requests on closed transport");
        }
        tracker.fail_all(TransportError::Closed);
    }

    let _ = events.send(TransportEvent::Closed).await;
}
