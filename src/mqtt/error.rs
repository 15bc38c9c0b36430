//! Error definitions for the MQTT layer

use thiserror::Error;

/// Failures reported by a transport for a single request or for the link itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport could not be created (bad options, TLS setup)
    #[error("failed to open transport: {0}")]
    Open(String),

    /// The request never left the client, e.g. the request queue is full
    #[error("request could not be queued: {0}")]
    Request(String),

    /// The broker answered with a failure code
    #[error("broker rejected the request: {0}")]
    Rejected(String),

    /// The link went away before the broker acknowledged the request
    #[error("transport closed before acknowledgment")]
    Closed,
}

/// Errors surfaced by [`BrokerClient`](super::mqtt_handler::BrokerClient)
///
/// Cloneable so a single connection outcome can be handed to every caller that
/// joined the same attempt, and so it can travel through the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Transport-level failure while establishing the connection
    #[error("connection failed: {0}")]
    Connection(String),

    /// Publish or subscribe attempted without a live connection
    #[error("MQTT client is not connected")]
    NotConnected,

    /// The broker refused or never acknowledged a subscription
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe {
        topic: String,
        reason: TransportError,
    },

    /// The broker refused or never acknowledged an unsubscribe
    #[error("unsubscribe from '{topic}' failed: {reason}")]
    Unsubscribe {
        topic: String,
        reason: TransportError,
    },

    /// The broker refused or never acknowledged a publish
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        topic: String,
        reason: TransportError,
    },

    /// Transport error on an established connection
    #[error("transport error: {0}")]
    Transport(String),

    /// The pending connection attempt was cancelled by `disconnect()`
    #[error("connection attempt aborted")]
    Aborted,

    /// Automatic reconnection gave up
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// A structured payload could not be encoded
    #[error("failed to encode payload: {0}")]
    Encode(String),
}
