//! notifier-publish: One-shot event producer
//!
//! Publishes a single notification event and prints the receipt.
//!
//! ## Usage
//! ```text
//! notifier-publish signup '{"userId":"u1","email":"a@b.com","name":"Ada","pass":"x"}'
//! notifier-publish order  '{"orderId":"o1","userId":"u1","email":"a@b.com","amount":12}'
//! notifier-publish notify '{"type":"sms","to":"a@b.com","payload":{}}'
//! ```
//!
//! If the broker is unreachable the event is buffered and the process waits
//! up to the confirm timeout for a reconnect before reporting it as queued.
//!
//! ## Configuration
//! - NOTIFIER_CONFIG: Path to a YAML config file (optional)
//! - NOTIFIER__BROKER__URL or AMQP_URL: Broker URL
//! - NOTIFIER_LOG: Log filter (default: info)

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use notifier::bus::{
    AmqpConnector, BusStats, ConnectionManager, ConnectionSettings, PublisherSettings,
    ReliablePublisher,
};
use notifier::config::Config;
use notifier::producer::EventProducer;
use notifier::utils::bootstrap::init_tracing;

const USAGE: &str = "usage: notifier-publish <signup|order|notify> '<json body>'";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(kind), Some(body)) = (args.next(), args.next()) else {
        return Err(USAGE.into());
    };

    let config = Config::load(None)?;
    let settings = PublisherSettings::from(&config);
    let connection = ConnectionManager::new(
        Arc::new(AmqpConnector),
        ConnectionSettings::from(&config.broker),
    );
    if let Err(e) = connection.connect().await {
        warn!(error = %e, "Broker unavailable, event will be buffered");
    }
    connection.start();

    let publisher = ReliablePublisher::new(
        Arc::clone(&connection),
        settings.clone(),
        Arc::new(BusStats::new()),
    );
    publisher.start();
    let producer = EventProducer::new(Arc::clone(&publisher));

    let receipt = producer.submit_json(&kind, &body).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    if publisher.buffer_depth() > 0 {
        connection.reconnect();
        wait_for_drain(&publisher, settings.confirm_timeout).await;
    }
    println!("{}", serde_json::to_string_pretty(&publisher.status())?);

    publisher.stop();
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Error closing broker connection");
    }

    Ok(())
}

async fn wait_for_drain(publisher: &ReliablePublisher, limit: Duration) {
    let started = Instant::now();
    while publisher.buffer_depth() > 0 && started.elapsed() < limit {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if publisher.buffer_depth() > 0 {
        warn!(
            remaining = publisher.buffer_depth(),
            "Buffered events not delivered before exit"
        );
    }
}
