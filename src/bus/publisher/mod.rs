//! Reliable publisher: confirmed publish with a bounded replay buffer.
//!
//! Live publishes are serialized through one lock so the broker sees them in
//! call order. When no channel is available, or a confirmed publish fails,
//! the entry goes to a bounded in-memory FIFO buffer that is replayed on
//! every transition to `Connected`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::buffer::{BufferedEntry, PublishBuffer, DEFAULT_BUFFER_CAPACITY};
use super::connection::ConnectionManager;
use super::stats::{BusStats, StatusReport};
use super::{BrokerChannel, BusError, Result};
use crate::config::Config;
use crate::envelope::EventEnvelope;

/// Default wait for a publisher confirm.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishOutcome {
    /// Confirmed by the broker.
    Published,
    /// Held in the buffer for replay.
    Buffered,
    /// Buffer full (or unserializable); the message is gone.
    Dropped,
}

impl PublishOutcome {
    /// Published or buffered: the caller may report the event as accepted.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

/// Result of one `flush_buffer` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub remaining: usize,
}

/// Settings for a `ReliablePublisher`.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub buffer_capacity: usize,
    pub confirm_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}

impl From<&Config> for PublisherSettings {
    fn from(config: &Config) -> Self {
        Self {
            buffer_capacity: config.publisher.buffer_capacity,
            confirm_timeout: Duration::from_millis(config.broker.confirm_timeout_ms),
        }
    }
}

/// Publishes envelopes to the connection's exchange with confirmation.
///
/// `publish` never returns an error: broker trouble turns into `Buffered`,
/// and a full buffer into `Dropped` (counted in `BusStats::dropped`).
pub struct ReliablePublisher {
    connection: Arc<ConnectionManager>,
    settings: PublisherSettings,
    buffer: Mutex<PublishBuffer>,
    /// Serializes publish-and-wait on the shared channel.
    publish_lock: tokio::sync::Mutex<()>,
    /// One flush at a time; only a flush removes entries from the buffer.
    flush_lock: tokio::sync::Mutex<()>,
    flush_wanted: Notify,
    stats: Arc<BusStats>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl ReliablePublisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        settings: PublisherSettings,
        stats: Arc<BusStats>,
    ) -> Arc<Self> {
        let buffer = PublishBuffer::new(settings.buffer_capacity);
        Arc::new(Self {
            connection,
            settings,
            buffer: Mutex::new(buffer),
            publish_lock: tokio::sync::Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_wanted: Notify::new(),
            stats,
            flusher: Mutex::new(None),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn stats(&self) -> &Arc<BusStats> {
        &self.stats
    }

    pub fn buffer_depth(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Routing keys currently waiting in the buffer, oldest first.
    pub fn buffered_keys(&self) -> Vec<String> {
        self.lock_buffer().routing_keys()
    }

    pub fn status(&self) -> StatusReport {
        let (depth, capacity) = {
            let buffer = self.lock_buffer();
            (buffer.len(), buffer.capacity())
        };
        StatusReport::new(self.connection.state(), depth, capacity, &self.stats)
    }

    /// Spawn the task that flushes the buffer on every new connection.
    /// Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut flusher = self.flusher.lock().unwrap_or_else(|e| e.into_inner());
        if flusher.is_some() {
            return;
        }
        let publisher = Arc::clone(self);
        *flusher = Some(tokio::spawn(async move { publisher.flush_on_connect().await }));
    }

    /// Stop the flush task. Buffered entries stay in memory.
    pub fn stop(&self) {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = flusher {
            handle.abort();
        }
    }

    async fn flush_on_connect(self: Arc<Self>) {
        let mut watcher = self.connection.subscribe();
        let mut generation = 0;

        loop {
            tokio::select! {
                next = watcher.next_connection(generation) => match next {
                    Some((current, _)) => generation = current,
                    None => break,
                },
                _ = self.flush_wanted.notified() => {}
            }

            if self.buffer_depth() == 0 {
                continue;
            }
            let report = self.flush_buffer().await;
            info!(
                flushed = report.flushed,
                remaining = report.remaining,
                "Flushed publish buffer"
            );
        }
    }

    /// Publish an envelope under `routing_key`.
    pub async fn publish(&self, routing_key: &str, envelope: EventEnvelope) -> PublishOutcome {
        let span = tracing::info_span!(
            "bus.publish",
            routing_key = %routing_key,
            event_id = %envelope.event_id()
        );
        self.publish_inner(routing_key, Arc::new(envelope))
            .instrument(span)
            .await
    }

    async fn publish_inner(&self, routing_key: &str, envelope: Arc<EventEnvelope>) -> PublishOutcome {
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize envelope, dropping");
                self.stats.record_dropped();
                return PublishOutcome::Dropped;
            }
        };

        let entry = BufferedEntry::new(routing_key, envelope);

        if self.connection.channel().is_none() {
            debug!("No channel available, buffering");
            return self.enqueue(entry);
        }

        let result = {
            let _guard = self.publish_lock.lock().await;
            // Re-read after waiting: the channel may have died meanwhile.
            match self.connection.channel() {
                Some(channel) => self.send(channel.as_ref(), routing_key, &payload).await,
                None => Err(BusError::NotConnected),
            }
        };

        match result {
            Ok(()) => {
                self.stats.record_published();
                debug!("Published");
                if self.buffer_depth() > 0 {
                    self.flush_wanted.notify_one();
                }
                PublishOutcome::Published
            }
            Err(e) => {
                warn!(error = %e, "Publish failed, buffering for replay");
                self.enqueue(entry)
            }
        }
    }

    /// Confirmed publish bounded by the confirm timeout.
    async fn send(&self, channel: &dyn BrokerChannel, routing_key: &str, payload: &[u8]) -> Result<()> {
        let timeout = self.settings.confirm_timeout;
        tokio::time::timeout(
            timeout,
            channel.publish_confirmed(self.connection.exchange(), routing_key, payload),
        )
        .await
        .map_err(|_| BusError::ConfirmTimeout(timeout))?
    }

    fn enqueue(&self, entry: BufferedEntry) -> PublishOutcome {
        let pushed = self.lock_buffer().push(entry);
        match pushed {
            Ok(()) => {
                self.stats.record_buffered();
                PublishOutcome::Buffered
            }
            Err(entry) => {
                warn!(
                    routing_key = %entry.routing_key,
                    event_id = %entry.envelope.event_id(),
                    capacity = self.settings.buffer_capacity,
                    "Publish buffer full, dropping message"
                );
                self.stats.record_dropped();
                PublishOutcome::Dropped
            }
        }
    }

    /// Replay buffered entries in FIFO order.
    ///
    /// Stops at the first failure; the failed entry and everything behind it
    /// stay buffered for the next flush.
    pub async fn flush_buffer(&self) -> FlushReport {
        let _flushing = self.flush_lock.lock().await;
        let mut flushed = 0;

        loop {
            let Some(entry) = self.lock_buffer().front().cloned() else {
                break;
            };

            let payload = match entry.envelope.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize buffered envelope, dropping");
                    self.lock_buffer().pop_front();
                    self.stats.record_dropped();
                    continue;
                }
            };

            let result = {
                let _guard = self.publish_lock.lock().await;
                match self.connection.channel() {
                    Some(channel) => {
                        self.send(channel.as_ref(), &entry.routing_key, &payload)
                            .await
                    }
                    None => Err(BusError::NotConnected),
                }
            };

            match result {
                Ok(()) => {
                    self.lock_buffer().pop_front();
                    self.stats.record_published();
                    self.stats.record_flushed();
                    flushed += 1;
                }
                Err(e) => {
                    warn!(
                        routing_key = %entry.routing_key,
                        error = %e,
                        "Replay failed, keeping remaining entries buffered"
                    );
                    break;
                }
            }
        }

        FlushReport {
            flushed,
            remaining: self.buffer_depth(),
        }
    }

    fn lock_buffer(&self) -> MutexGuard<'_, PublishBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(all(test, feature = "channel"))]
mod tests;
