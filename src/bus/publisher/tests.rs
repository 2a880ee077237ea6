use super::*;
use crate::bus::connection::ConnectionSettings;
use crate::bus::{ConnectionState, MemoryBroker};
use serde_json::json;

const EXCHANGE: &str = "notifications.topic";

fn connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        url: "memory://".to_string(),
        exchange: EXCHANGE.to_string(),
        max_retries: 2,
        retry_delay: Duration::from_millis(5),
        reconnect_min_delay: Duration::from_millis(5),
        reconnect_max_delay: Duration::from_millis(20),
    }
}

fn publisher_for(broker: &MemoryBroker, capacity: usize) -> Arc<ReliablePublisher> {
    let connection = ConnectionManager::new(broker.connector(), connection_settings());
    ReliablePublisher::new(
        connection,
        PublisherSettings {
            buffer_capacity: capacity,
            confirm_timeout: Duration::from_millis(50),
        },
        Arc::new(BusStats::new()),
    )
}

fn envelope(n: u32) -> EventEnvelope {
    EventEnvelope::new("order.completed", json!({ "orderId": format!("o{}", n) }))
}

fn order_ids(broker: &MemoryBroker) -> Vec<String> {
    broker
        .published_to(EXCHANGE)
        .iter()
        .map(|m| {
            let envelope = EventEnvelope::from_json(&m.data).unwrap();
            envelope.payload_str("orderId").unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_publish_while_connected_is_confirmed_in_order() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    publisher.connection().connect().await.unwrap();

    for n in 1..=5 {
        let outcome = publisher.publish("order.completed.email", envelope(n)).await;
        assert_eq!(outcome, PublishOutcome::Published);
    }

    assert_eq!(order_ids(&broker), vec!["o1", "o2", "o3", "o4", "o5"]);
    assert_eq!(publisher.stats().published(), 5);
    assert_eq!(publisher.buffer_depth(), 0);
}

#[tokio::test]
async fn test_concurrent_publishes_all_confirmed() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    publisher.connection().connect().await.unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|n| {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move { publisher.publish("notify.sms", envelope(n)).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), PublishOutcome::Published);
    }

    assert_eq!(broker.published_to(EXCHANGE).len(), 20);
}

#[tokio::test]
async fn test_publish_while_disconnected_buffers() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);

    let outcome = publisher.publish("order.completed.email", envelope(1)).await;

    assert_eq!(outcome, PublishOutcome::Buffered);
    assert!(outcome.is_accepted());
    assert_eq!(publisher.buffer_depth(), 1);
    assert_eq!(publisher.stats().buffered(), 1);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_overflow_drops_newest_and_counts() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 2);

    let outcomes = [
        publisher.publish("k.1", envelope(1)).await,
        publisher.publish("k.2", envelope(2)).await,
        publisher.publish("k.3", envelope(3)).await,
    ];

    assert_eq!(
        outcomes,
        [
            PublishOutcome::Buffered,
            PublishOutcome::Buffered,
            PublishOutcome::Dropped
        ]
    );
    assert_eq!(publisher.buffer_depth(), 2);
    assert_eq!(publisher.buffered_keys(), vec!["k.1", "k.2"]);
    assert_eq!(publisher.stats().dropped(), 1);
}

#[tokio::test]
async fn test_nacked_publish_goes_to_buffer() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    publisher.connection().connect().await.unwrap();
    broker.fail_next_publishes(1);

    let outcome = publisher.publish("order.completed.email", envelope(1)).await;

    assert_eq!(outcome, PublishOutcome::Buffered);
    assert_eq!(publisher.buffer_depth(), 1);
}

#[tokio::test]
async fn test_confirm_timeout_goes_to_buffer() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    publisher.connection().connect().await.unwrap();
    broker.stall_confirms(true);

    let outcome = publisher.publish("order.completed.email", envelope(1)).await;

    assert_eq!(outcome, PublishOutcome::Buffered);
    assert_eq!(publisher.buffer_depth(), 1);
}

#[tokio::test]
async fn test_flush_replays_in_enqueue_order() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    for n in 1..=3 {
        publisher.publish("order.completed.email", envelope(n)).await;
    }

    publisher.connection().connect().await.unwrap();
    let report = publisher.flush_buffer().await;

    assert_eq!(
        report,
        FlushReport {
            flushed: 3,
            remaining: 0
        }
    );
    assert_eq!(order_ids(&broker), vec!["o1", "o2", "o3"]);
    assert_eq!(publisher.stats().flushed(), 3);
}

#[tokio::test]
async fn test_replayed_messages_count_as_published() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    publisher.publish("order.completed.email", envelope(1)).await;
    publisher.publish("order.completed.email", envelope(2)).await;
    assert_eq!(publisher.stats().published(), 0);

    publisher.connection().connect().await.unwrap();
    publisher.flush_buffer().await;
    publisher.publish("order.completed.email", envelope(3)).await;

    let stats = publisher.stats();
    assert_eq!(stats.buffered(), 2);
    assert_eq!(stats.flushed(), 2);
    assert_eq!(stats.published(), 3);
}

#[tokio::test]
async fn test_flush_stops_at_first_failure() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    for n in 1..=3 {
        publisher.publish("order.completed.email", envelope(n)).await;
    }
    publisher.connection().connect().await.unwrap();

    broker.fail_next_publishes(1);
    let first = publisher.flush_buffer().await;
    assert_eq!(first, FlushReport { flushed: 0, remaining: 3 });
    assert!(broker.published().is_empty());
    assert_eq!(
        publisher.buffered_keys(),
        vec!["order.completed.email"; 3]
    );

    let second = publisher.flush_buffer().await;
    assert_eq!(second, FlushReport { flushed: 3, remaining: 0 });
    assert_eq!(order_ids(&broker), vec!["o1", "o2", "o3"]);
}

#[tokio::test]
async fn test_live_publish_during_outage_tail_is_kept_behind_buffer() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    publisher.publish("k", envelope(1)).await;
    publisher.connection().connect().await.unwrap();
    broker.fail_next_publishes(1);

    // Live publish fails and lands behind the existing entry.
    assert_eq!(publisher.publish("k", envelope(2)).await, PublishOutcome::Buffered);
    publisher.flush_buffer().await;

    assert_eq!(order_ids(&broker), vec!["o1", "o2"]);
}

#[tokio::test]
async fn test_flush_without_channel_keeps_everything() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 10);
    publisher.publish("k", envelope(1)).await;

    let report = publisher.flush_buffer().await;
    assert_eq!(report, FlushReport { flushed: 0, remaining: 1 });
}

#[tokio::test]
async fn test_started_publisher_flushes_on_reconnect() {
    let broker = MemoryBroker::new();
    broker.go_down();
    let publisher = publisher_for(&broker, 10);
    publisher.connection().start();
    publisher.start();

    for n in 1..=3 {
        assert_eq!(
            publisher.publish("order.completed.email", envelope(n)).await,
            PublishOutcome::Buffered
        );
    }

    // Let the connect budget run out so the supervisor parks.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(publisher.connection().state(), ConnectionState::Disconnected);

    broker.go_up();
    publisher.connection().reconnect();

    tokio::time::timeout(Duration::from_secs(2), async {
        while publisher.buffer_depth() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("buffer never drained");

    assert_eq!(order_ids(&broker), vec!["o1", "o2", "o3"]);
    publisher.stop();
    publisher.connection().close().await.unwrap();
}

#[tokio::test]
async fn test_status_reports_state_and_depth() {
    let broker = MemoryBroker::new();
    let publisher = publisher_for(&broker, 5);
    publisher.publish("k", envelope(1)).await;

    let status = publisher.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.buffer_depth, 1);
    assert_eq!(status.buffer_capacity, 5);
    assert_eq!(status.buffered, 1);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "disconnected");
}

#[test]
fn test_settings_from_config() {
    let mut config = Config::default();
    config.publisher.buffer_capacity = 7;
    config.broker.confirm_timeout_ms = 250;

    let settings = PublisherSettings::from(&config);
    assert_eq!(settings.buffer_capacity, 7);
    assert_eq!(settings.confirm_timeout, Duration::from_millis(250));
}
