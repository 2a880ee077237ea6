//! Bounded consumer: topology setup, prefetch and isolated handler dispatch.
//!
//! Topology (queues, bindings, prefetch) is recorded as it is asserted and
//! replayed on every new connection, because broker-side consumer
//! registration does not survive a channel recreation.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use backon::BackoffBuilder;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::ConnectionManager;
use super::stats::BusStats;
use super::{
    BrokerChannel, BusError, Delivery, DeliveryStream, MessageHandler, QueueInfo, QueueOptions,
    Result,
};
use crate::utils::retry::reconnect_backoff;

/// Consumer tag used when none is configured.
pub const DEFAULT_CONSUMER_TAG: &str = "notifier-consumer";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug, Clone, Default)]
struct Topology {
    queues: Vec<(String, QueueOptions)>,
    bindings: Vec<Binding>,
    prefetch: Option<u16>,
}

/// Consumes queues through a `ConnectionManager`'s channel.
pub struct BoundedConsumer {
    connection: Arc<ConnectionManager>,
    topology: Mutex<Topology>,
    consumer_tag: String,
    stats: Arc<BusStats>,
}

impl BoundedConsumer {
    pub fn new(connection: Arc<ConnectionManager>, stats: Arc<BusStats>) -> Arc<Self> {
        Self::with_consumer_tag(connection, stats, DEFAULT_CONSUMER_TAG)
    }

    pub fn with_consumer_tag(
        connection: Arc<ConnectionManager>,
        stats: Arc<BusStats>,
        consumer_tag: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            topology: Mutex::new(Topology::default()),
            consumer_tag: consumer_tag.into(),
            stats,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn stats(&self) -> &Arc<BusStats> {
        &self.stats
    }

    /// Declare a queue now if connected, and on every reconnect.
    ///
    /// Returns `None` when there is no channel yet; the declaration runs as
    /// soon as one appears.
    pub async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<Option<QueueInfo>> {
        {
            let mut topology = self.lock_topology();
            match topology.queues.iter_mut().find(|(queue, _)| queue == name) {
                Some(existing) => existing.1 = options.clone(),
                None => topology.queues.push((name.to_string(), options.clone())),
            }
        }

        match self.connection.channel() {
            Some(channel) => channel.declare_queue(name, &options).await.map(Some),
            None => Ok(None),
        }
    }

    /// Bind `queue` to the connection's exchange with a topic pattern.
    pub async fn bind_queue(&self, queue: &str, pattern: &str) -> Result<()> {
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        {
            let mut topology = self.lock_topology();
            if !topology.bindings.contains(&binding) {
                topology.bindings.push(binding);
            }
        }

        match self.connection.channel() {
            Some(channel) => {
                channel
                    .bind_queue(queue, self.connection.exchange(), pattern)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Cap unacknowledged deliveries (prefetch) and concurrent handlers.
    ///
    /// Applies to consumers started after this call.
    pub async fn set_concurrency_limit(&self, limit: u16) -> Result<()> {
        if limit == 0 {
            return Err(BusError::Subscribe(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        self.lock_topology().prefetch = Some(limit);

        match self.connection.channel() {
            Some(channel) => channel.set_prefetch(limit).await,
            None => Ok(()),
        }
    }

    pub fn concurrency_limit(&self) -> Option<u16> {
        self.lock_topology().prefetch
    }

    /// Publish a JSON payload on the current channel without confirmation.
    ///
    /// Returns the broker's immediate accept signal.
    pub async fn publish_to_queue<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<bool> {
        let channel = self.connection.channel().ok_or(BusError::NotConnected)?;
        let data = serde_json::to_vec(payload)?;
        channel.publish(exchange, routing_key, &data).await
    }

    /// Start consuming `queue`, dispatching each delivery to `handler`.
    ///
    /// The consume loop survives handler errors and panics and re-registers
    /// after every reconnect.
    pub fn consume(self: &Arc<Self>, queue: &str, handler: Arc<dyn MessageHandler>) -> ConsumerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let consumer = Arc::clone(self);
        let queue = queue.to_string();
        let task = tokio::spawn(async move { consumer.run(queue, handler, shutdown_rx).await });
        ConsumerHandle { shutdown, task }
    }

    async fn run(
        self: Arc<Self>,
        queue: String,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut watcher = self.connection.subscribe();
        let mut generation = 0;

        loop {
            let next = tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                next = watcher.next_connection(generation) => next,
            };
            let Some((current, channel)) = next else {
                break;
            };
            generation = current;

            let stream = match self
                .register_until_ready(channel.as_ref(), &queue, &mut shutdown)
                .await
            {
                Registration::Ready(stream) => stream,
                Registration::ChannelLost => continue,
                Registration::Stopped => break,
            };
            info!(queue = %queue, "Consumer started");

            if self.drain(stream, &channel, &handler, &mut shutdown).await {
                break;
            }
            info!(queue = %queue, "Consumer stream ended, waiting for reconnect");
        }

        debug!(queue = %queue, "Consumer stopped");
    }

    /// Register on `channel`, retrying with backoff while it stays open.
    /// A closed channel hands the loop back to wait for the next connection.
    async fn register_until_ready(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Registration {
        let settings = self.connection.settings();
        let mut backoff =
            reconnect_backoff(settings.reconnect_min_delay, settings.reconnect_max_delay).build();

        loop {
            let error = match self.register(channel, queue).await {
                Ok(stream) => return Registration::Ready(stream),
                Err(e) => e,
            };
            if !channel.is_open() {
                error!(queue = %queue, error = %error, "Failed to start consumer, waiting for reconnect");
                return Registration::ChannelLost;
            }

            let delay = backoff.next().unwrap_or(settings.reconnect_max_delay);
            warn!(
                queue = %queue,
                error = %error,
                retry_ms = %delay.as_millis(),
                "Failed to start consumer, retrying"
            );
            tokio::select! {
                _ = stop_requested(shutdown) => return Registration::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Replay topology on `channel` and register the consumer.
    async fn register(&self, channel: &dyn BrokerChannel, queue: &str) -> Result<DeliveryStream> {
        let topology = self.lock_topology().clone();

        for (name, options) in &topology.queues {
            channel.declare_queue(name, options).await?;
        }
        for binding in &topology.bindings {
            channel
                .bind_queue(&binding.queue, self.connection.exchange(), &binding.pattern)
                .await?;
        }
        if let Some(prefetch) = topology.prefetch {
            channel.set_prefetch(prefetch).await?;
        }

        channel.consume(queue, &self.consumer_tag).await
    }

    /// Dispatch deliveries until the stream ends. Returns `true` on shutdown.
    async fn drain(
        &self,
        mut stream: DeliveryStream,
        channel: &Arc<dyn BrokerChannel>,
        handler: &Arc<dyn MessageHandler>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let permits = self
            .concurrency_limit()
            .map(usize::from)
            .unwrap_or(Semaphore::MAX_PERMITS);
        let limiter = Arc::new(Semaphore::new(permits));

        loop {
            let permit = tokio::select! {
                _ = stop_requested(shutdown) => return true,
                permit = Arc::clone(&limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return false,
                },
            };

            let delivery = tokio::select! {
                _ = stop_requested(shutdown) => return true,
                delivery = stream.next() => delivery,
            };

            match delivery {
                Some(Ok(delivery)) => {
                    self.dispatch(delivery, Arc::clone(channel), Arc::clone(handler), permit);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Consumer delivery error, will reconnect");
                    return false;
                }
                None => return false,
            }
        }
    }

    /// Run the handler on its own task, holding `permit` until it finishes.
    fn dispatch(
        &self,
        delivery: Delivery,
        channel: Arc<dyn BrokerChannel>,
        handler: Arc<dyn MessageHandler>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        self.stats.record_delivered();

        let span = tracing::info_span!(
            "bus.consume",
            routing_key = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag
        );

        #[cfg(feature = "otel")]
        extract_trace_context(&delivery.headers, &span);

        let settlement = delivery.settlement();
        let routing_key = delivery.routing_key.clone();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                let handling = async move { handler.handle(delivery, channel).await };
                let outcome = AssertUnwindSafe(handling).catch_unwind().await;

                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(panic) => Some(panic_message(panic.as_ref())),
                };

                match failure {
                    None if !settlement.is_settled() => {
                        warn!(routing_key = %routing_key, "Handler returned without settling delivery");
                    }
                    None => {}
                    Some(reason) => {
                        stats.record_failed();
                        error!(routing_key = %routing_key, error = %reason, "Handler failed");
                        if !settlement.is_settled() {
                            if let Err(e) = settlement.nack(false).await {
                                warn!(error = %e, "Failed to nack delivery after handler failure");
                            }
                        }
                    }
                }

                drop(permit);
            }
            .instrument(span),
        );
    }

    fn lock_topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Registration {
    Ready(DeliveryStream),
    ChannelLost,
    Stopped,
}

/// Resolves once a stop is requested. A dropped handle detaches the loop.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Set the span's parent from W3C trace-context headers.
#[cfg(feature = "otel")]
fn extract_trace_context(headers: &std::collections::BTreeMap<String, String>, span: &tracing::Span) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    if headers.is_empty() {
        return;
    }
    let parent_cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        struct HeaderExtractor<'a>(&'a std::collections::BTreeMap<String, String>);
        impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
            fn get(&self, key: &str) -> Option<&str> {
                self.0.get(key).map(String::as_str)
            }
            fn keys(&self) -> Vec<&str> {
                self.0.keys().map(String::as_str).collect()
            }
        }
        propagator.extract(&HeaderExtractor(headers))
    });
    span.set_parent(parent_cx);
}

/// Handle to a running consume loop.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Stop pulling deliveries and wait for the loop to exit. Handlers
    /// already running are left to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Consumer task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
