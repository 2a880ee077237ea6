//! Connection manager: one broker connection+channel, supervised.
//!
//! A single supervising task owns the connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (close signal) -> Disconnected -> Connecting ...
//!                     |
//!                     +-- retries exhausted -> Disconnected (parked until reconnect())
//! ```
//!
//! Each connect attempt retries with a fixed delay up to `max_retries`.
//! After a connection loss the next attempt waits on a jittered exponential
//! backoff so a flapping broker does not cause a reconnect storm.
//!
//! Dependents never hold the channel across a suspension point without
//! re-reading it: the `(state, channel, generation)` snapshot is published
//! through a `tokio::sync::watch` channel and read with `channel()` or a
//! `StateWatcher`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use backon::BackoffBuilder;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BrokerChannel, BusError, ConnectionState, Connector, Result};
use crate::config::BrokerConfig;
use crate::utils::bootstrap::connect_with_retry;
use crate::utils::retry::reconnect_backoff;

/// Settings for a `ConnectionManager`.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Broker URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange declared on every successful connect.
    pub exchange: String,
    /// Attempts per connect call.
    pub max_retries: u32,
    /// Fixed delay between attempts inside one connect call.
    pub retry_delay: Duration,
    /// Backoff floor between reconnect cycles.
    pub reconnect_min_delay: Duration,
    /// Backoff cap between reconnect cycles. A connection that stayed up at
    /// least this long resets the backoff.
    pub reconnect_max_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for ConnectionSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            url: config.url.clone(),
            exchange: config.exchange.clone(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            reconnect_min_delay: Duration::from_millis(config.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
    }
}

/// Published view of the connection.
///
/// `channel` is `Some` exactly when `state` is `Connected`.
#[derive(Clone, Default)]
struct Snapshot {
    state: ConnectionState,
    channel: Option<Arc<dyn BrokerChannel>>,
    /// Incremented on every transition to `Connected`.
    generation: u64,
}

impl Snapshot {
    fn open_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        match &self.channel {
            Some(channel) if self.state == ConnectionState::Connected && channel.is_open() => {
                Some(Arc::clone(channel))
            }
            _ => None,
        }
    }
}

/// Owns the broker connection and channel for one process.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    snapshot: watch::Sender<Snapshot>,
    /// Serializes connect calls (supervisor and explicit callers).
    connect_lock: tokio::sync::Mutex<()>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectionSettings) -> Arc<Self> {
        let (snapshot, _) = watch::channel(Snapshot::default());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            connector,
            settings,
            snapshot,
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect: Notify::new(),
            shutdown,
            supervisor: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn exchange(&self) -> &str {
        &self.settings.exchange
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Current channel if connected. Never waits.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.snapshot.borrow().open_channel()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> StateWatcher {
        StateWatcher {
            rx: self.snapshot.subscribe(),
        }
    }

    /// Wait until a channel is available.
    pub async fn wait_connected(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut watcher = self.subscribe();
        watcher
            .next_connection(0)
            .await
            .map(|(_, channel)| channel)
            .ok_or(BusError::NotConnected)
    }

    /// Establish the connection, retrying with a fixed delay.
    ///
    /// Declares the durable topic exchange and transitions to `Connected` on
    /// success. After `max_retries` failed attempts the state is left
    /// `Disconnected` and `BusError::RetriesExhausted` is returned; callers
    /// are expected to log it, not to propagate it further.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let _guard = self.connect_lock.lock().await;

        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        self.set_state(ConnectionState::Connecting);

        let result = connect_with_retry(
            "broker",
            self.settings.max_retries,
            self.settings.retry_delay,
            || self.open_channel(),
        )
        .await;

        match result {
            Ok(channel) => {
                self.snapshot.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.channel = Some(Arc::clone(&channel));
                    s.generation += 1;
                });
                info!(
                    url = %redact_url(&self.settings.url),
                    exchange = %self.settings.exchange,
                    "Connected to broker"
                );
                Ok(channel)
            }
            Err((attempts, e)) => {
                self.set_state(ConnectionState::Disconnected);
                Err(BusError::RetriesExhausted {
                    attempts,
                    last_error: e.to_string(),
                })
            }
        }
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connector.connect(&self.settings.url).await?;
        if let Err(e) = channel.declare_exchange(&self.settings.exchange).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Spawn the supervising loop. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if supervisor.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move { manager.supervise().await }));
    }

    /// Ask a parked supervisor (retries exhausted) to try again.
    pub fn reconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            self.reconnect.notify_one();
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let builder = reconnect_backoff(
            self.settings.reconnect_min_delay,
            self.settings.reconnect_max_delay,
        );
        let mut backoff = builder.build();

        loop {
            let attempt = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                result = self.connect() => result,
            };

            match attempt {
                Ok(channel) => {
                    let connected_at = Instant::now();
                    let reason = tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        reason = channel.closed() => reason,
                    };
                    self.mark_lost(&channel);
                    if connected_at.elapsed() >= self.settings.reconnect_max_delay {
                        backoff = builder.build();
                    }
                    let delay = backoff
                        .next()
                        .unwrap_or(self.settings.reconnect_max_delay);
                    warn!(
                        reason = %reason,
                        backoff_ms = %delay.as_millis(),
                        "Broker connection closed, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.reconnect.notified() => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Broker unavailable, waiting for reconnect request");
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = self.reconnect.notified() => {}
                    }
                }
            }
        }

        debug!("Connection supervisor stopped");
    }

    /// Invalidate `channel` if it is still the published one.
    fn mark_lost(&self, channel: &Arc<dyn BrokerChannel>) {
        self.snapshot.send_if_modified(|s| match &s.channel {
            Some(current) if Arc::ptr_eq(current, channel) => {
                s.state = ConnectionState::Disconnected;
                s.channel = None;
                true
            }
            _ => false,
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.snapshot.send_modify(|s| {
            s.state = state;
            if state != ConnectionState::Connected {
                s.channel = None;
            }
        });
    }

    /// Stop the supervisor and close channel then connection.
    ///
    /// Terminal: a closed manager does not reconnect.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.send_replace(true);

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let generation = self.snapshot.borrow().generation;
        let previous = self.snapshot.send_replace(Snapshot {
            generation,
            ..Snapshot::default()
        });
        if let Some(channel) = previous.channel {
            channel.close().await?;
            info!("Broker connection closed");
        }
        Ok(())
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Strip credentials from a broker URL for logging.
pub(crate) fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

/// Observer of connection state transitions.
pub struct StateWatcher {
    rx: watch::Receiver<Snapshot>,
}

impl StateWatcher {
    pub fn state(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.rx.borrow().open_channel()
    }

    /// Wait for the next state change. `None` once the manager is gone.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().state)
    }

    /// Wait for a connection newer than `seen_generation`.
    ///
    /// Returns the connection's generation and channel; pass the generation
    /// back in to wait for the following reconnect.
    pub async fn next_connection(
        &mut self,
        seen_generation: u64,
    ) -> Option<(u64, Arc<dyn BrokerChannel>)> {
        let snapshot = self
            .rx
            .wait_for(|s| s.generation > seen_generation && s.open_channel().is_some())
            .await
            .ok()?;
        let channel = snapshot.open_channel()?;
        Some((snapshot.generation, channel))
    }
}
