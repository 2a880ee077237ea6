use super::*;
use futures::StreamExt;
use std::time::Duration;

const EXCHANGE: &str = "notifications.topic";

async fn open(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
    let channel = broker.connector().connect("memory://").await.unwrap();
    channel.declare_exchange(EXCHANGE).await.unwrap();
    channel
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery error")
}

async fn nothing_within(stream: &mut DeliveryStream, ms: u64) -> bool {
    tokio::time::timeout(Duration::from_millis(ms), stream.next())
        .await
        .is_err()
}

#[tokio::test]
async fn test_topic_routing_to_bound_queue() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_queue("emails", &QueueOptions::default())
        .await
        .unwrap();
    channel
        .bind_queue("emails", EXCHANGE, "order.completed.*")
        .await
        .unwrap();

    channel
        .publish_confirmed(EXCHANGE, "order.completed.email", b"one")
        .await
        .unwrap();
    channel
        .publish_confirmed(EXCHANGE, "user.signup.email", b"two")
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("emails"), 1);
    assert_eq!(broker.published_to(EXCHANGE).len(), 2);
}

#[tokio::test]
async fn test_overlapping_bindings_deliver_once() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_queue("all", &QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue("all", EXCHANGE, "#").await.unwrap();
    channel.bind_queue("all", EXCHANGE, "order.#").await.unwrap();

    broker.inject(EXCHANGE, "order.completed.email", b"x");
    assert_eq!(broker.queue_depth("all"), 1);
}

#[tokio::test]
async fn test_declare_queue_is_idempotent() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    let options = QueueOptions::default();

    channel.declare_queue("q", &options).await.unwrap();
    broker.inject(EXCHANGE, "k", b"x");
    channel.bind_queue("q", EXCHANGE, "k").await.unwrap();
    channel.bind_queue("q", EXCHANGE, "k").await.unwrap();
    broker.inject(EXCHANGE, "k", b"x");

    let info = channel.declare_queue("q", &options).await.unwrap();
    assert_eq!(info.message_count, 1);
    assert_eq!(broker.binding_count("q"), 1);
}

#[tokio::test]
async fn test_redeclare_with_different_options_fails() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_queue("q", &QueueOptions::default())
        .await
        .unwrap();

    let result = channel.declare_queue("q", &QueueOptions::transient()).await;
    assert!(matches!(result, Err(BusError::Topology(_))));
}

#[tokio::test]
async fn test_bind_unknown_queue_fails() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    let result = channel.bind_queue("missing", EXCHANGE, "#").await;
    assert!(matches!(result, Err(BusError::Topology(_))));
}

#[tokio::test]
async fn test_prefetch_limits_unacked_deliveries() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_queue("q", &QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue("q", EXCHANGE, "#").await.unwrap();
    channel.set_prefetch(2).await.unwrap();
    for _ in 0..3 {
        broker.inject(EXCHANGE, "k", b"x");
    }

    let mut stream = channel.consume("q", "test").await.unwrap();
    let first = next(&mut stream).await;
    let _second = next(&mut stream).await;
    assert!(nothing_within(&mut stream, 50).await);
    assert_eq!(broker.unacked_count("q"), 2);

    first.ack().await.unwrap();
    let _third = next(&mut stream).await;
    assert_eq!(broker.queue_depth("q"), 0);
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_queue("q", &QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue("q", EXCHANGE, "#").await.unwrap();
    broker.inject(EXCHANGE, "k", b"payload");

    let mut stream = channel.consume("q", "test").await.unwrap();
    let delivery = next(&mut stream).await;
    assert!(!delivery.redelivered);
    delivery.nack(true).await.unwrap();

    let again = next(&mut stream).await;
    assert!(again.redelivered);
    assert_eq!(again.data, b"payload");
}

#[tokio::test]
async fn test_reject_without_requeue_dead_letters() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.declare_exchange("notifications.dlx").await.unwrap();
    channel
        .declare_queue(
            "q",
            &QueueOptions::default().with_dead_letter_exchange("notifications.dlx"),
        )
        .await
        .unwrap();
    channel
        .declare_queue("q.dead", &QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue("q", EXCHANGE, "#").await.unwrap();
    channel
        .bind_queue("q.dead", "notifications.dlx", "#")
        .await
        .unwrap();
    broker.inject(EXCHANGE, "order.completed.email", b"poison");

    let mut stream = channel.consume("q", "test").await.unwrap();
    next(&mut stream).await.reject(false).await.unwrap();

    assert_eq!(broker.queue_depth("q"), 0);
    assert_eq!(broker.queue_depth("q.dead"), 1);
    let dead = broker.dead_lettered();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].routing_key, "order.completed.email");
}

#[tokio::test]
async fn test_settle_twice_is_an_error() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_queue("q", &QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue("q", EXCHANGE, "#").await.unwrap();
    broker.inject(EXCHANGE, "k", b"x");

    let mut stream = channel.consume("q", "test").await.unwrap();
    let delivery = next(&mut stream).await;
    delivery.ack().await.unwrap();
    assert!(delivery.is_settled());
    assert!(matches!(
        delivery.nack(false).await,
        Err(BusError::AlreadySettled)
    ));
}

#[tokio::test]
async fn test_dropped_connection_requeues_unacked_and_ends_stream() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel
        .declare_queue("q", &QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue("q", EXCHANGE, "#").await.unwrap();
    broker.inject(EXCHANGE, "k", b"x");

    let mut stream = channel.consume("q", "test").await.unwrap();
    let delivery = next(&mut stream).await;
    assert_eq!(broker.queue_depth("q"), 0);

    broker.drop_connections();

    assert!(!channel.is_open());
    assert_eq!(channel.closed().await, "connection reset by broker");
    assert_eq!(broker.queue_depth("q"), 1);
    assert!(delivery.ack().await.is_err());
    let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_refused_connections_while_down() {
    let broker = MemoryBroker::new();
    broker.go_down();
    assert!(matches!(
        broker.connector().connect("memory://").await,
        Err(BusError::Connection(_))
    ));

    broker.go_up();
    assert!(broker.connector().connect("memory://").await.is_ok());
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn test_injected_nacks() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    broker.fail_next_publishes(1);

    let first = channel.publish_confirmed(EXCHANGE, "k", b"1").await;
    assert!(matches!(first, Err(BusError::Nacked { .. })));
    channel.publish_confirmed(EXCHANGE, "k", b"2").await.unwrap();

    let published = broker.published_to(EXCHANGE);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].data, b"2");
}

#[tokio::test]
async fn test_stalled_confirms_never_resolve() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    broker.stall_confirms(true);

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        channel.publish_confirmed(EXCHANGE, "k", b"1"),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_unconfirmed_publish_to_missing_exchange_is_refused() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    assert!(!channel.publish("nope", "k", b"x").await.unwrap());
    assert!(channel.publish(EXCHANGE, "k", b"x").await.unwrap());
}

#[tokio::test]
async fn test_closed_channel_rejects_operations() {
    let broker = MemoryBroker::new();
    let channel = open(&broker).await;
    channel.close().await.unwrap();

    assert!(!channel.is_open());
    assert_eq!(broker.open_channels(), 0);
    assert!(matches!(
        channel.publish_confirmed(EXCHANGE, "k", b"x").await,
        Err(BusError::ChannelClosed(_))
    ));
}
