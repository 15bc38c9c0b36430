//! # MQTT Broker Client
//!
//! One shared broker connection for the whole process. Device commands go out
//! through it, and device status telemetry comes back through it.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection options and reconnect backoff policy
//! ├── error.rs            - Transport and client error types
//! ├── message_manager.rs  - Inbound messages and outbound payload encoding
//! ├── mqtt_handler.rs     - BrokerClient: connection state machine, operations, events
//! ├── topics.rs           - Topic naming conventions and wildcard patterns
//! └── transport.rs        - Transport seam and the rumqttc implementation
//! ```
//!
//! ## Connection Lifecycle
//!
//! [`BrokerClient::connect`] opens a transport and resolves once the broker accepts
//! the session. Concurrent callers share the attempt in flight. When an established
//! connection drops, the client retries on its own with exponential backoff
//! (5 s, 10 s, 20 s, 40 s, 80 s by default) until [`ReconnectPolicy::max_attempts`]
//! is reached. [`BrokerClient::disconnect`] always wins over a pending retry.
//!
//! Consumers learn about lifecycle changes and inbound messages by listening on
//! [`BrokerClient::events`]. Subscriptions are not restored by the client; listeners
//! replay their own on every `Connected` event.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topics;
pub mod transport;

pub use config::{ConnectOptions, ReconnectPolicy};
pub use error::{BrokerError, TransportError};
pub use message_manager::{InboundMessage, Message};
pub use mqtt_handler::{BrokerClient, BrokerEvent, ConnectionState, ConsumerLease, MQTTStatus};
pub use topics::{TopicError, TopicPattern};
pub use transport::{MqttTransport, Transport, TransportEvent, TransportLink, TransportSession};
