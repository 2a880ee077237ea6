//! Broker, publisher and consumer configuration types.

use serde::Deserialize;

/// Default broker URL.
pub const DEFAULT_BROKER_URL: &str = "amqp://localhost:5672";
/// Default topic exchange.
pub const DEFAULT_EXCHANGE: &str = "notifications.topic";
/// Default queue consumed by the worker.
pub const DEFAULT_QUEUE: &str = "notifications.email";

/// Broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Durable topic exchange events are published to.
    pub exchange: String,
    /// Attempts per connect call.
    pub max_retries: u32,
    /// Fixed delay between connect attempts.
    pub retry_delay_ms: u64,
    /// Upper bound on a publisher-confirm wait.
    pub confirm_timeout_ms: u64,
    /// Backoff floor between reconnect cycles.
    pub reconnect_min_delay_ms: u64,
    /// Backoff cap between reconnect cycles.
    pub reconnect_max_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            max_retries: 5,
            retry_delay_ms: 3000,
            confirm_timeout_ms: 5000,
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

/// Reliable publisher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Entries held while the broker is unavailable.
    pub buffer_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: crate::bus::buffer::DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Worker-side consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Queue to declare and consume.
    pub queue: String,
    /// Topic patterns bound to the exchange.
    pub patterns: Vec<String>,
    /// Unacknowledged deliveries in flight.
    pub prefetch: u16,
    /// Exchange for deliveries rejected without requeue.
    pub dead_letter_exchange: Option<String>,
    pub consumer_tag: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            patterns: vec![
                "user.signup.*".to_string(),
                "order.completed.*".to_string(),
                "notify.*".to_string(),
            ],
            prefetch: 10,
            dead_letter_exchange: None,
            consumer_tag: crate::bus::consumer::DEFAULT_CONSUMER_TAG.to_string(),
        }
    }
}
