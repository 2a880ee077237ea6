//! notifier-worker: Email notification consumer
//!
//! Binds the notification queue to the topic exchange and hands each
//! delivery to the email handler.
//!
//! ## Architecture
//! ```text
//! [notifications.topic] --(user.signup.* / order.completed.* / notify.*)-->
//!     [notifications.email] --> [notifier-worker] --> mailer
//! ```
//!
//! ## Configuration
//! - NOTIFIER_CONFIG: Path to a YAML config file (optional)
//! - NOTIFIER__BROKER__URL or AMQP_URL: Broker URL
//! - NOTIFIER__CONSUMER__PREFETCH: Concurrent handlers (default: 10)
//! - NOTIFIER__CONSUMER__DEAD_LETTER_EXCHANGE: Where failed deliveries go (optional)
//! - NOTIFIER_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::{info, warn};

use notifier::bus::{
    AmqpConnector, BoundedConsumer, BusStats, ConnectionManager, ConnectionSettings, QueueOptions,
};
use notifier::config::Config;
use notifier::handlers::{EmailHandler, LogMailer};
use notifier::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let connection = ConnectionManager::new(
        Arc::new(AmqpConnector),
        ConnectionSettings::from(&config.broker),
    );
    if let Err(e) = connection.connect().await {
        warn!(error = %e, "Broker unavailable at startup, consumer starts on reconnect");
    }
    connection.start();
    let nudger = tokio::spawn(keep_reconnecting(Arc::clone(&connection)));

    let stats = Arc::new(BusStats::new());
    let consumer = BoundedConsumer::with_consumer_tag(
        Arc::clone(&connection),
        stats,
        config.consumer.consumer_tag.clone(),
    );

    let mut options = QueueOptions::default();
    if let Some(dlx) = &config.consumer.dead_letter_exchange {
        options = options.with_dead_letter_exchange(dlx.clone());
    }
    // Topology is recorded even when these fail and replayed on every connection.
    if let Err(e) = consumer.assert_queue(&config.consumer.queue, options).await {
        warn!(queue = %config.consumer.queue, error = %e, "Failed to declare queue");
    }
    for pattern in &config.consumer.patterns {
        if let Err(e) = consumer.bind_queue(&config.consumer.queue, pattern).await {
            warn!(queue = %config.consumer.queue, pattern = %pattern, error = %e, "Failed to bind queue");
        }
    }
    if let Err(e) = consumer.set_concurrency_limit(config.consumer.prefetch).await {
        warn!(prefetch = config.consumer.prefetch, error = %e, "Failed to set concurrency limit");
    }

    let mailer = Arc::new(LogMailer::new(config.mail.from.clone()));
    let handle = consumer.consume(&config.consumer.queue, Arc::new(EmailHandler::new(mailer)));

    info!(
        queue = %config.consumer.queue,
        exchange = %config.broker.exchange,
        prefetch = config.consumer.prefetch,
        "notifier-worker started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    handle.stop().await;
    nudger.abort();
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Error closing broker connection");
    }

    Ok(())
}

/// Restart a parked supervisor every `reconnect_max_delay` while disconnected.
async fn keep_reconnecting(connection: Arc<ConnectionManager>) {
    let delay = connection.settings().reconnect_max_delay;
    loop {
        tokio::time::sleep(delay).await;
        connection.reconnect();
    }
}
