//! In-memory transport for driving the client and bridge in tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::mqtt::topics::TopicPattern;
use crate::mqtt::transport::{Ack, Transport, TransportEvent, TransportLink, TransportSession};
use crate::mqtt::{BrokerEvent, ConnectOptions, TransportError};

/// Lets spawned tasks run until the current burst of work is done
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Receives until `predicate` matches, skipping other events
pub(crate) async fn expect_event(
    events: &mut broadcast::Receiver<BrokerEvent>,
    predicate: impl Fn(&BrokerEvent) -> bool,
) -> BrokerEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("expected event was not emitted")
}

#[derive(Default)]
struct Behaviour {
    refuse_publish: Option<String>,
    refuse_subscribe: Option<String>,
    refuse_open: Option<String>,
    echo: bool,
    hold_acks: bool,
}

#[derive(Default)]
struct Shared {
    behaviour: Mutex<Behaviour>,
    sessions: Mutex<Vec<MockSession>>,
    held: Mutex<Vec<oneshot::Sender<Result<(), TransportError>>>>,
    opened: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publishes come back as messages when they match a subscription
    pub(crate) fn with_echo(self) -> Self {
        self.shared.behaviour.lock().unwrap().echo = true;
        self
    }

    pub(crate) fn refuse_publishes(&self, reason: &str) {
        self.shared.behaviour.lock().unwrap().refuse_publish = Some(reason.to_string());
    }

    pub(crate) fn refuse_subscriptions(&self, reason: &str) {
        self.shared.behaviour.lock().unwrap().refuse_subscribe = Some(reason.to_string());
    }

    pub(crate) fn refuse_open(&self, reason: &str) {
        self.shared.behaviour.lock().unwrap().refuse_open = Some(reason.to_string());
    }

    /// Subscribe and unsubscribe acks stay pending until `release_acks`
    pub(crate) fn hold_acks(&self) {
        self.shared.behaviour.lock().unwrap().hold_acks = true;
    }

    pub(crate) fn release_acks(&self) {
        self.shared.behaviour.lock().unwrap().hold_acks = false;
        for ack in self.shared.held.lock().unwrap().drain(..) {
            let _ = ack.send(Ok(()));
        }
    }

    pub(crate) fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// The `index`-th opened session, waiting for it to be opened
    pub(crate) async fn session(&self, index: usize) -> MockSession {
        for _ in 0..1_000 {
            if let Some(session) = self.shared.sessions.lock().unwrap().get(index) {
                return session.clone();
            }
            tokio::task::yield_now().await;
        }
        panic!("session {index} was never opened");
    }
}

impl Transport for MockTransport {
    fn open(&self, options: &ConnectOptions) -> Result<TransportSession, TransportError> {
        if let Some(reason) = &self.shared.behaviour.lock().unwrap().refuse_open {
            return Err(TransportError::Open(reason.clone()));
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let link = Arc::new(MockLink {
            shared: self.shared.clone(),
            events: events_tx.clone(),
            record: Mutex::default(),
            closed: AtomicBool::new(false),
        });
        self.shared.sessions.lock().unwrap().push(MockSession {
            options: options.clone(),
            events: events_tx,
            link: link.clone(),
        });
        self.shared.opened.fetch_add(1, Ordering::SeqCst);

        Ok(TransportSession {
            link,
            events: events_rx,
        })
    }
}

#[derive(Default)]
struct Record {
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
}

struct MockLink {
    shared: Arc<Shared>,
    events: mpsc::Sender<TransportEvent>,
    record: Mutex<Record>,
    closed: AtomicBool,
}

fn resolved(result: Result<(), TransportError>) -> Ack {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

impl MockLink {
    fn acked(&self) -> Ack {
        if !self.shared.behaviour.lock().unwrap().hold_acks {
            return resolved(Ok(()));
        }
        let (tx, rx) = oneshot::channel();
        self.shared.held.lock().unwrap().push(tx);
        rx
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl TransportLink for MockLink {
    fn subscribe(&self, topic: &str) -> Result<Ack, TransportError> {
        self.check_open()?;
        if let Some(reason) = &self.shared.behaviour.lock().unwrap().refuse_subscribe {
            return Ok(resolved(Err(TransportError::Rejected(reason.clone()))));
        }
        self.record.lock().unwrap().subscribed.push(topic.to_string());
        Ok(self.acked())
    }

    fn unsubscribe(&self, topic: &str) -> Result<Ack, TransportError> {
        self.check_open()?;
        let mut record = self.record.lock().unwrap();
        record.subscribed.retain(|t| t != topic);
        record.unsubscribed.push(topic.to_string());
        drop(record);
        Ok(self.acked())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, TransportError> {
        self.check_open()?;
        let echo = {
            let behaviour = self.shared.behaviour.lock().unwrap();
            if let Some(reason) = &behaviour.refuse_publish {
                return Ok(resolved(Err(TransportError::Rejected(reason.clone()))));
            }
            behaviour.echo
        };

        let mut record = self.record.lock().unwrap();
        record.published.push((topic.to_string(), payload.clone()));
        let subscribed = record.subscribed.iter().any(|pattern| {
            TopicPattern::parse(pattern)
                .map(|p| p.matches(topic))
                .unwrap_or(false)
        });
        if echo && subscribed {
            let _ = self.events.try_send(TransportEvent::Message {
                topic: topic.to_string(),
                payload,
            });
        }
        Ok(resolved(Ok(())))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side view of one opened transport
#[derive(Clone)]
pub(crate) struct MockSession {
    options: ConnectOptions,
    events: mpsc::Sender<TransportEvent>,
    link: Arc<MockLink>,
}

impl MockSession {
    async fn emit(&self, event: TransportEvent) {
        // the client may already have dropped a retired session
        let _ = self.events.send(event).await;
        settle().await;
    }

    pub(crate) async fn connected(&self) {
        self.emit(TransportEvent::Connected).await;
    }

    pub(crate) async fn fail(&self, reason: &str) {
        self.emit(TransportEvent::Error(reason.to_string())).await;
    }

    pub(crate) async fn close(&self) {
        self.emit(TransportEvent::Closed).await;
    }

    pub(crate) async fn message(&self, topic: &str, payload: &str) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        })
        .await;
    }

    pub(crate) fn options(&self) -> ConnectOptions {
        self.options.clone()
    }

    pub(crate) fn subscribed(&self) -> Vec<String> {
        self.link.record.lock().unwrap().subscribed.clone()
    }

    pub(crate) fn unsubscribed(&self) -> Vec<String> {
        self.link.record.lock().unwrap().unsubscribed.clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.link.record.lock().unwrap().published.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}
