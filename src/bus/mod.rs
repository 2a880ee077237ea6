//! Broker connectivity for async event delivery.
//!
//! This module contains:
//! - `Connector` / `BrokerChannel` traits: the seam between the reliability
//!   layer and a concrete broker client
//! - `ConnectionManager`: owns the single connection+channel, reconnects
//! - `ReliablePublisher`: confirmed publish with a bounded replay buffer
//! - `BoundedConsumer`: topology setup, prefetch, isolated handler dispatch
//! - Implementations: AMQP (RabbitMQ via lapin), in-memory broker

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod buffer;
pub mod connection;
pub mod consumer;
#[cfg(feature = "channel")]
pub mod memory;
pub mod publisher;
pub mod stats;
pub mod topic;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use buffer::{BufferedEntry, PublishBuffer};
pub use connection::{ConnectionManager, ConnectionSettings, StateWatcher};
pub use consumer::{BoundedConsumer, ConsumerHandle};
#[cfg(feature = "channel")]
pub use memory::{MemoryBroker, MemoryConnector};
pub use publisher::{FlushReport, PublishOutcome, PublisherSettings, ReliablePublisher};
pub use stats::{BusStats, StatusReport};
pub use topic::topic_matches;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("No channel available")]
    NotConnected,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Broker rejected message for routing key '{routing_key}'")]
    Nacked { routing_key: String },

    #[error("Publish confirmation not received within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Delivery already settled")]
    AlreadySettled,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors a message handler reports back to the consume loop.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unknown event '{0}'")]
    UnknownEvent(String),

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

// ============================================================================
// Connection State
// ============================================================================

/// Connection lifecycle, owned by the `ConnectionManager`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Topology
// ============================================================================

/// Queue declaration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Exchange that receives messages rejected without requeue.
    pub dead_letter_exchange: Option<String>,
    /// Routing key override for dead-lettered messages.
    pub dead_letter_routing_key: Option<String>,
    /// Per-message TTL in milliseconds.
    pub message_ttl: Option<u32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }
}

impl QueueOptions {
    /// Non-durable, auto-deleted queue (tests, ad-hoc listeners).
    pub fn transient() -> Self {
        Self {
            durable: false,
            auto_delete: true,
            ..Self::default()
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl_ms: u32) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }
}

/// Broker reply to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

// ============================================================================
// Deliveries
// ============================================================================

/// Broker-side settlement of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// Tracks whether a delivery has been settled. Shared between the handler's
/// `Delivery` and the consume loop so the loop can apply the failure policy.
pub(crate) struct Settlement {
    acker: Arc<dyn Acknowledger>,
    settled: AtomicBool,
}

impl Settlement {
    pub(crate) fn new(acker: Arc<dyn Acknowledger>) -> Arc<Self> {
        Arc::new(Self {
            acker,
            settled: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadySettled);
        }
        Ok(())
    }

    pub(crate) async fn ack(&self) -> Result<()> {
        self.claim()?;
        self.acker.ack().await
    }

    pub(crate) async fn nack(&self, requeue: bool) -> Result<()> {
        self.claim()?;
        self.acker.nack(requeue).await
    }

    pub(crate) async fn reject(&self, requeue: bool) -> Result<()> {
        self.claim()?;
        self.acker.reject(requeue).await
    }
}

/// A message delivered from a queue.
///
/// Settlement is explicit: exactly one of `ack`, `nack` or `reject` may
/// succeed. A second call returns `BusError::AlreadySettled`.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
    settlement: Arc<Settlement>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            headers: BTreeMap::new(),
            data,
            settlement: Settlement::new(acker),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Decode the body as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.is_settled()
    }

    pub async fn ack(&self) -> Result<()> {
        self.settlement.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.settlement.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.settlement.reject(requeue).await
    }

    pub(crate) fn settlement(&self) -> Arc<Settlement> {
        Arc::clone(&self.settlement)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Stream of deliveries for one consumer registration. Ends when the
/// channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Broker Traits
// ============================================================================

/// One broker connection plus its channel, in publisher-confirms mode.
///
/// Implementations:
/// - `AmqpChannel`: RabbitMQ via lapin
/// - `MemoryChannel`: in-process broker for tests and local runs
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare (assert) a queue. Re-declaring with the same options is a no-op.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo>;

    /// Bind a queue to an exchange with a topic pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Cap unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish and wait for the broker's confirmation.
    ///
    /// Fails with `BusError::Nacked` if the broker negatively acknowledges.
    async fn publish_confirmed(&self, exchange: &str, routing_key: &str, payload: &[u8])
        -> Result<()>;

    /// Publish without waiting for confirmation. Returns whether the channel
    /// accepted the message.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<bool>;

    /// Register a consumer on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Resolves with a reason once the underlying connection or channel dies.
    async fn closed(&self) -> String;

    /// Close channel, then connection.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerChannel>>;
}

/// Handler for messages delivered by a `BoundedConsumer`.
///
/// Settling the delivery is the handler's job. See `BoundedConsumer` for
/// what happens when a handler fails without settling.
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        delivery: Delivery,
        channel: Arc<dyn BrokerChannel>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_options_default_durable() {
        let options = QueueOptions::default();
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(options.dead_letter_exchange.is_none());
    }

    #[test]
    fn test_queue_options_builder() {
        let options = QueueOptions::transient()
            .with_dead_letter_exchange("notifications.dlx")
            .with_dead_letter_routing_key("dead")
            .with_message_ttl(60_000);
        assert!(!options.durable);
        assert_eq!(options.dead_letter_exchange.as_deref(), Some("notifications.dlx"));
        assert_eq!(options.dead_letter_routing_key.as_deref(), Some("dead"));
        assert_eq!(options.message_ttl, Some(60_000));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
