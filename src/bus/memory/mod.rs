//! In-memory broker for standalone mode and tests.
//!
//! Implements `Connector` / `BrokerChannel` with the broker semantics the
//! reliability layer depends on:
//! - topic exchanges with `*` / `#` bindings
//! - per-channel prefetch and unacknowledged delivery tracking
//! - ack, nack/reject with or without requeue, dead-letter exchanges
//! - unacknowledged deliveries requeued (redelivered) when a channel dies
//!
//! Fault injection: connections can be dropped, the broker can refuse
//! connections, confirms can be nacked or stalled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    topic_matches, Acknowledger, BrokerChannel, BusError, Connector, Delivery, DeliveryStream,
    QueueInfo, QueueOptions, Result,
};

/// A message accepted by an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    messages: VecDeque<StoredMessage>,
    consumers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

struct ChannelLink {
    id: u64,
    open: AtomicBool,
    closed_reason: watch::Sender<Option<String>>,
}

impl ChannelLink {
    fn shut(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_reason.send_replace(Some(reason.to_string()));
    }
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    connect_attempts: u32,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: Vec<Arc<ChannelLink>>,
    prefetch: HashMap<u64, u16>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    dead_lettered: Vec<PublishedMessage>,
    nack_budget: usize,
    stall_confirms: bool,
    next_channel_id: u64,
    next_delivery_tag: u64,
}

impl BrokerState {
    /// Route a message through an exchange. Returns the number of queues it landed in.
    fn route(&mut self, exchange: &str, routing_key: &str, data: &[u8]) -> usize {
        self.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            data: data.to_vec(),
        });

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && topic_matches(&binding.pattern, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        for queue in &targets {
            if let Some(q) = self.queues.get_mut(queue) {
                q.messages.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    data: data.to_vec(),
                    redelivered: false,
                });
            }
        }
        targets.len()
    }

    fn in_flight(&self, channel_id: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.channel_id == channel_id)
            .count()
    }

    /// Put a channel's unacknowledged deliveries back at the head of their queues.
    fn requeue_channel(&mut self, channel_id: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
        self.prefetch.remove(&channel_id);
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(q) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            q.messages.push_front(message);
        }
    }

    fn dead_letter(&mut self, unacked: Unacked) {
        let target = self.queues.get(&unacked.queue).and_then(|q| {
            q.options.dead_letter_exchange.clone().map(|exchange| {
                let key = q
                    .options
                    .dead_letter_routing_key
                    .clone()
                    .unwrap_or_else(|| unacked.message.routing_key.clone());
                (exchange, key)
            })
        });

        match target {
            Some((exchange, key)) => {
                self.dead_lettered.push(PublishedMessage {
                    exchange: exchange.clone(),
                    routing_key: key.clone(),
                    data: unacked.message.data.clone(),
                });
                self.route(&exchange, &key, &unacked.message.data);
            }
            None => debug!(queue = %unacked.queue, "Discarding rejected message"),
        }
    }

    fn take_delivery(&mut self, channel_id: u64, queue: &str) -> Option<(u64, StoredMessage)> {
        let prefetch = self.prefetch.get(&channel_id).copied().unwrap_or(0);
        if prefetch > 0 && self.in_flight(channel_id) >= usize::from(prefetch) {
            return None;
        }
        let message = self.queues.get_mut(queue)?.messages.pop_front()?;
        self.next_delivery_tag += 1;
        let tag = self.next_delivery_tag;
        self.unacked.insert(
            tag,
            Unacked {
                channel_id,
                queue: queue.to_string(),
                message: message.clone(),
            },
        );
        Some((tag, message))
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    /// Bumped on every state change that could unblock a consumer.
    version: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wake(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                version,
            }),
        }
    }

    /// Connector handing out channels on this broker.
    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Simulate an outage: drop every connection and refuse new ones.
    pub fn go_down(&self) {
        self.shared.lock().refuse_connections = true;
        self.drop_connections();
        info!("Memory broker down");
    }

    /// End an outage.
    pub fn go_up(&self) {
        self.shared.lock().refuse_connections = false;
        info!("Memory broker up");
    }

    /// Kill every live connection; the broker keeps accepting new ones.
    pub fn drop_connections(&self) {
        {
            let mut state = self.shared.lock();
            let channels = std::mem::take(&mut state.channels);
            for link in channels {
                link.shut("connection reset by broker");
                state.requeue_channel(link.id);
            }
        }
        self.shared.wake();
    }

    /// Negatively acknowledge the next `count` confirmed publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.lock().nack_budget = count;
    }

    /// Never answer confirmed publishes while set.
    pub fn stall_confirms(&self, stall: bool) {
        self.shared.lock().stall_confirms = stall;
    }

    /// Publish directly into an exchange, bypassing any channel.
    pub fn inject(&self, exchange: &str, routing_key: &str, data: &[u8]) -> usize {
        let routed = self.shared.lock().route(exchange, routing_key, data);
        self.shared.wake();
        routed
    }

    /// Every message accepted by any exchange, in arrival order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().published.clone()
    }

    /// Messages accepted by `exchange`, in arrival order.
    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.shared
            .lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Messages rejected without requeue and re-routed to a dead-letter exchange.
    pub fn dead_lettered(&self) -> Vec<PublishedMessage> {
        self.shared.lock().dead_lettered.clone()
    }

    /// Ready (undelivered) messages in a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Delivered but not yet settled messages for a queue.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.lock().exchanges.contains(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.lock().queues.contains_key(name)
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .count()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().connect_attempts
    }

    pub fn open_channels(&self) -> usize {
        self.shared.lock().channels.len()
    }
}

/// `Connector` for a `MemoryBroker`. The URL is ignored.
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerChannel>> {
        let shared = Arc::clone(&self.broker.shared);
        let link = {
            let mut state = shared.lock();
            state.connect_attempts += 1;
            if state.refuse_connections {
                return Err(BusError::Connection("connection refused".to_string()));
            }
            state.next_channel_id += 1;
            let (closed_reason, _) = watch::channel(None);
            let link = Arc::new(ChannelLink {
                id: state.next_channel_id,
                open: AtomicBool::new(true),
                closed_reason,
            });
            state.channels.push(Arc::clone(&link));
            link
        };
        debug!(channel_id = link.id, "Memory channel opened");
        Ok(Arc::new(MemoryChannel { shared, link }))
    }
}

/// Channel on a `MemoryBroker`.
pub struct MemoryChannel {
    shared: Arc<Shared>,
    link: Arc<ChannelLink>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.link.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::ChannelClosed("channel closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                options: options.clone(),
                messages: VecDeque::new(),
                consumers: 0,
            });
        if queue.options != *options {
            return Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                name
            )));
        }
        Ok(QueueInfo {
            name: name.to_string(),
            message_count: u32::try_from(queue.messages.len()).unwrap_or(u32::MAX),
            consumer_count: queue.consumers,
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.shared.lock().prefetch.insert(self.link.id, count);
        self.shared.wake();
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let stalled = {
            let mut state = self.shared.lock();
            if !state.exchanges.contains(exchange) {
                return Err(BusError::Publish(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }
            if state.stall_confirms {
                true
            } else if state.nack_budget > 0 {
                state.nack_budget -= 1;
                return Err(BusError::Nacked {
                    routing_key: routing_key.to_string(),
                });
            } else {
                state.route(exchange, routing_key, payload);
                false
            }
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        self.shared.wake();
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            if !state.exchanges.contains(exchange) {
                return Ok(false);
            }
            state.route(exchange, routing_key, payload);
        }
        self.shared.wake();
        Ok(true)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Subscribe(format!("NOT_FOUND - no queue '{}'", queue)))?;
            q.consumers += 1;
        }
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Memory consumer registered");

        let cursor = ConsumeCursor {
            shared: Arc::clone(&self.shared),
            link: Arc::clone(&self.link),
            queue: queue.to_string(),
            version: self.shared.version.subscribe(),
        };

        let stream = stream::unfold(cursor, |mut cursor| async move {
            loop {
                let _ = cursor.version.borrow_and_update();
                if !cursor.link.open.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(delivery) = cursor.next_delivery() {
                    return Some((Ok(delivery), cursor));
                }
                if cursor.version.changed().await.is_err() {
                    return None;
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn closed(&self) -> String {
        let mut rx = self.link.closed_reason.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "channel dropped".to_string(),
        };
        reason
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.channels.retain(|l| l.id != self.link.id);
            state.requeue_channel(self.link.id);
        }
        self.link.shut("closed by application");
        self.shared.wake();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}

struct ConsumeCursor {
    shared: Arc<Shared>,
    link: Arc<ChannelLink>,
    queue: String,
    version: watch::Receiver<u64>,
}

impl ConsumeCursor {
    fn next_delivery(&self) -> Option<Delivery> {
        let (tag, message) = self.shared.lock().take_delivery(self.link.id, &self.queue)?;
        let acker = Arc::new(MemoryAcker {
            shared: Arc::clone(&self.shared),
            link: Arc::clone(&self.link),
            tag,
        });
        Some(Delivery::new(
            tag,
            message.exchange,
            message.routing_key,
            message.redelivered,
            message.data,
            acker,
        ))
    }
}

impl Drop for ConsumeCursor {
    fn drop(&mut self) {
        if let Some(q) = self.shared.lock().queues.get_mut(&self.queue) {
            q.consumers = q.consumers.saturating_sub(1);
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    link: Arc<ChannelLink>,
    tag: u64,
}

impl MemoryAcker {
    fn take(&self) -> Result<Unacked> {
        if !self.link.open.load(Ordering::SeqCst) {
            return Err(BusError::ChannelClosed(
                "cannot settle delivery on a closed channel".to_string(),
            ));
        }
        self.shared
            .lock()
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BusError::Ack(format!("unknown delivery tag {}", self.tag)))
    }

    fn settle(&self, requeue: bool) -> Result<()> {
        let unacked = self.take()?;
        {
            let mut state = self.shared.lock();
            if requeue {
                state.requeue(unacked);
            } else {
                state.dead_letter(unacked);
            }
        }
        self.shared.wake();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.take()?;
        self.shared.wake();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(requeue)
    }
}

#[cfg(test)]
mod tests;
