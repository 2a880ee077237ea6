//! AMQP (RabbitMQ) broker implementation.
//!
//! One lapin connection with one channel in publisher-confirms mode per
//! `connect` call. Connection and channel errors are funnelled into a watch
//! channel so the `ConnectionManager` learns about a dead link immediately.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    Acknowledger, BrokerChannel, BusError, Connector, Delivery, DeliveryStream, QueueInfo,
    QueueOptions, Result,
};

/// How often `closed()` double-checks the link status.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Opens lapin connections.
#[derive(Debug, Default, Clone)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let (closed_tx, _) = watch::channel(None::<String>);
        let closed_tx = Arc::new(closed_tx);

        {
            let closed_tx = Arc::clone(&closed_tx);
            connection.on_error(move |e| {
                closed_tx.send_replace(Some(format!("connection error: {}", e)));
            });
        }

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        {
            let closed_tx = Arc::clone(&closed_tx);
            channel.on_error(move |e| {
                closed_tx.send_replace(Some(format!("channel error: {}", e)));
            });
        }

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;

        debug!("AMQP channel open in confirm mode");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            closed: closed_tx,
        }))
    }
}

/// A lapin connection and its single channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed: Arc<watch::Sender<Option<String>>>,
}

impl AmqpChannel {
    fn properties() -> BasicProperties {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        #[cfg(feature = "otel")]
        let properties = {
            let headers = amqp_inject_trace_context();
            if headers.inner().is_empty() {
                properties
            } else {
                properties.with_headers(headers)
            }
        };

        properties
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(reason) = self.closed.borrow().as_ref() {
            return Err(BusError::ChannelClosed(reason.clone()));
        }
        if !self.is_open() {
            return Err(BusError::ChannelClosed("channel not connected".to_string()));
        }
        Ok(())
    }
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = &options.dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    if let Some(key) = &options.dead_letter_routing_key {
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(key.clone().into()),
        );
    }
    if let Some(ttl) = options.message_ttl {
        args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
    }
    args
}

fn string_headers(properties: &BasicProperties) -> BTreeMap<String, String> {
    let Some(headers) = properties.headers() else {
        return BTreeMap::new();
    };
    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
                .ok()
                .map(|v| (key.to_string(), v.to_string())),
            AMQPValue::ShortString(s) => Some((key.to_string(), s.to_string())),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare queue: {}", e)))?;

        Ok(QueueInfo {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %queue,
            routing_key = %pattern,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                Self::properties(),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(BusError::Nacked {
                routing_key: routing_key.to_string(),
            });
        }

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            "Published message"
        );
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<bool> {
        self.ensure_open()?;

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                Self::properties(),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, routing_key = %routing_key, "Channel refused publish");
                Ok(false)
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(|delivery| {
            let delivery = delivery
                .map_err(|e| BusError::Subscribe(format!("Consumer delivery error: {}", e)))?;
            let headers = string_headers(&delivery.properties);
            let acker = Arc::new(AmqpAcker {
                acker: delivery.acker,
            });
            Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                delivery.redelivered,
                delivery.data,
                acker,
            )
            .with_headers(headers))
        });

        Ok(stream.boxed())
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed.subscribe();
        let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
        loop {
            tokio::select! {
                changed = rx.wait_for(Option::is_some) => {
                    let reason = match changed {
                        Ok(reason) => reason.clone().unwrap_or_default(),
                        Err(_) => "connection dropped".to_string(),
                    };
                    return reason;
                }
                _ = poll.tick() => {
                    if !self.is_open() {
                        return "connection no longer connected".to_string();
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed
            .send_replace(Some("closed by client".to_string()));

        if self.channel.status().connected() {
            self.channel
                .close(200, "Bye")
                .await
                .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "Bye")
                .await
                .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Settles lapin deliveries.
struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Ack(format!("Failed to nack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::Ack(format!("Failed to reject: {}", e)))
    }
}

// ============================================================================
// OTel Trace Context Propagation
// ============================================================================

/// Inject W3C trace context from the current span into AMQP message headers.
#[cfg(feature = "otel")]
fn amqp_inject_trace_context() -> FieldTable {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = tracing::Span::current().context();
    let mut headers = BTreeMap::new();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        struct MapInjector<'a>(&'a mut BTreeMap<lapin::types::ShortString, AMQPValue>);
        impl opentelemetry::propagation::Injector for MapInjector<'_> {
            fn set(&mut self, key: &str, value: String) {
                self.0
                    .insert(key.into(), AMQPValue::LongString(value.into()));
            }
        }
        propagator.inject_context(&cx, &mut MapInjector(&mut headers));
    });

    FieldTable::from(headers)
}
