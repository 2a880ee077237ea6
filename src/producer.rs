//! Event producer: turns inbound requests into envelopes and publishes them.
//!
//! Request shapes match the gateway's JSON bodies (camelCase). Validation is
//! limited to required fields; payload contents are otherwise opaque.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::bus::{PublishOutcome, ReliablePublisher};
use crate::envelope::{EventEnvelope, Meta};
use crate::handlers::email::{NOTIFY_CUSTOM_EVENT, ORDER_COMPLETED_EVENT, USER_SIGNUP_EVENT};

/// Errors raised before anything is published.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("{0} required")]
    MissingFields(&'static str),

    #[error("Invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("Unknown request kind '{0}': expected signup, order or notify")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub pass: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_id: Option<String>,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub amount: Option<Value>,
    pub items: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub template: Option<String>,
    pub to: Option<String>,
    pub payload: Option<Value>,
    pub meta: Option<Meta>,
}

/// What the producer tells its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// `published`, `queued` or `dropped`.
    pub status: &'static str,
    pub routing_key: String,
    pub event_id: String,
    pub outcome: PublishOutcome,
}

/// Builds envelopes for inbound requests and hands them to the publisher.
pub struct EventProducer {
    publisher: Arc<ReliablePublisher>,
}

impl EventProducer {
    pub fn new(publisher: Arc<ReliablePublisher>) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &Arc<ReliablePublisher> {
        &self.publisher
    }

    /// `user.signup` on `user.signup.email`. The password is checked for
    /// presence only and never published.
    pub async fn user_signup(&self, request: SignupRequest) -> Result<Receipt, ProducerError> {
        let (Some(user_id), Some(email), Some(name), Some(_)) = (
            present(request.user_id),
            present(request.email),
            present(request.name),
            present(request.pass),
        ) else {
            return Err(ProducerError::MissingFields("userId, email, name and pass"));
        };

        let envelope = EventEnvelope::new(
            USER_SIGNUP_EVENT,
            json!({ "userId": user_id, "email": email, "name": name }),
        )
        .with_meta(Meta::new());

        Ok(self
            .send(format!("{}.email", USER_SIGNUP_EVENT), envelope)
            .await)
    }

    /// `order.completed` on `order.completed.email`.
    pub async fn order(&self, request: OrderRequest) -> Result<Receipt, ProducerError> {
        let (Some(order_id), Some(user_id), Some(email)) = (
            present(request.order_id),
            present(request.user_id),
            present(request.email),
        ) else {
            return Err(ProducerError::MissingFields("orderId, userId and email"));
        };

        let envelope = EventEnvelope::new(
            ORDER_COMPLETED_EVENT,
            json!({
                "orderId": order_id,
                "userId": user_id,
                "email": email,
                "amount": request.amount,
                "items": request.items,
            }),
        );

        Ok(self
            .send(format!("{}.email", ORDER_COMPLETED_EVENT), envelope)
            .await)
    }

    /// `notify.custom` on `notify.{type}`.
    pub async fn notify(&self, request: NotifyRequest) -> Result<Receipt, ProducerError> {
        let (Some(kind), Some(to)) = (present(request.kind), present(request.to)) else {
            return Err(ProducerError::MissingFields("type and to"));
        };

        let envelope = EventEnvelope::new(
            NOTIFY_CUSTOM_EVENT,
            json!({ "template": request.template, "to": to, "data": request.payload }),
        )
        .with_meta(request.meta.unwrap_or_default());

        Ok(self.send(format!("notify.{}", kind), envelope).await)
    }

    /// Decode a raw JSON body for `kind` (`signup`, `order` or `notify`)
    /// and publish it.
    pub async fn submit_json(&self, kind: &str, body: &str) -> Result<Receipt, ProducerError> {
        match kind {
            "signup" => self.user_signup(serde_json::from_str(body)?).await,
            "order" => self.order(serde_json::from_str(body)?).await,
            "notify" => self.notify(serde_json::from_str(body)?).await,
            other => Err(ProducerError::UnknownKind(other.to_string())),
        }
    }

    async fn send(&self, routing_key: String, envelope: EventEnvelope) -> Receipt {
        let event_id = envelope.event_id().to_string();
        let outcome = self.publisher.publish(&routing_key, envelope).await;
        let status = match outcome {
            PublishOutcome::Published => "published",
            PublishOutcome::Buffered => "queued",
            PublishOutcome::Dropped => "dropped",
        };
        info!(routing_key = %routing_key, event_id = %event_id, status, "Event accepted");
        Receipt {
            status,
            routing_key,
            event_id,
            outcome,
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(all(test, feature = "channel"))]
mod tests {
    use super::*;
    use crate::bus::connection::ConnectionSettings;
    use crate::bus::publisher::PublisherSettings;
    use crate::bus::{BusStats, ConnectionManager, MemoryBroker};

    async fn producer(connected: bool) -> (MemoryBroker, EventProducer) {
        let broker = MemoryBroker::new();
        let connection = ConnectionManager::new(
            broker.connector(),
            ConnectionSettings {
                url: "memory://".to_string(),
                ..ConnectionSettings::default()
            },
        );
        if connected {
            connection.connect().await.unwrap();
        }
        let publisher = ReliablePublisher::new(
            connection,
            PublisherSettings::default(),
            Arc::new(BusStats::new()),
        );
        (broker, EventProducer::new(publisher))
    }

    fn published(broker: &MemoryBroker) -> Vec<(String, EventEnvelope)> {
        broker
            .published()
            .into_iter()
            .map(|m| (m.routing_key, EventEnvelope::from_json(&m.data).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_signup_drops_password() {
        let (broker, producer) = producer(true).await;
        let receipt = producer
            .user_signup(SignupRequest {
                user_id: Some("u1".to_string()),
                email: Some("a@b.com".to_string()),
                name: Some("Ada".to_string()),
                pass: Some("secret".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(receipt.status, "published");
        assert_eq!(receipt.routing_key, "user.signup.email");
        assert!(receipt.event_id.starts_with("evt_"));

        let sent = published(&broker);
        assert_eq!(sent.len(), 1);
        let (key, envelope) = &sent[0];
        assert_eq!(key, "user.signup.email");
        assert_eq!(envelope.event(), "user.signup");
        assert_eq!(envelope.event_id(), receipt.event_id);
        assert!(envelope.payload().get("pass").is_none());
        assert_eq!(envelope.payload_str("name"), Some("Ada"));
    }

    #[tokio::test]
    async fn test_signup_requires_fields() {
        let (broker, producer) = producer(true).await;
        let result = producer
            .user_signup(SignupRequest {
                user_id: Some("u1".to_string()),
                email: Some(" ".to_string()),
                ..SignupRequest::default()
            })
            .await;

        assert!(matches!(result, Err(ProducerError::MissingFields(_))));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_order_is_queued_while_disconnected() {
        let (_broker, producer) = producer(false).await;
        let body = r#"{"orderId":"o1","userId":"u1","email":"a@b.com","amount":12.5}"#;
        let request: OrderRequest = serde_json::from_str(body).unwrap();

        let receipt = producer.order(request).await.unwrap();

        assert_eq!(receipt.status, "queued");
        assert_eq!(receipt.outcome, PublishOutcome::Buffered);
        assert_eq!(receipt.routing_key, "order.completed.email");
        assert_eq!(producer.publisher().buffer_depth(), 1);
    }

    #[tokio::test]
    async fn test_notify_routes_by_type() {
        let (broker, producer) = producer(true).await;
        let request: NotifyRequest = serde_json::from_value(json!({
            "type": "sms",
            "template": "alert",
            "to": "ops@b.com",
            "payload": {"level": 2},
            "meta": {"subject": "Heads up"}
        }))
        .unwrap();

        let receipt = producer.notify(request).await.unwrap();
        assert_eq!(receipt.routing_key, "notify.sms");

        let (_, envelope) = &published(&broker)[0];
        assert_eq!(envelope.event(), "notify.custom");
        assert_eq!(envelope.payload()["data"], json!({"level": 2}));
        assert_eq!(envelope.meta_str("subject"), Some("Heads up"));
    }

    #[tokio::test]
    async fn test_notify_requires_type_and_to() {
        let (_broker, producer) = producer(true).await;
        let result = producer
            .notify(NotifyRequest {
                kind: Some("sms".to_string()),
                ..NotifyRequest::default()
            })
            .await;
        assert!(
            matches!(result, Err(ProducerError::MissingFields(fields)) if fields == "type and to")
        );
    }

    #[tokio::test]
    async fn test_submit_json_dispatches_by_kind() {
        let (broker, producer) = producer(true).await;
        let receipt = producer
            .submit_json("notify", r#"{"type":"push","to":"a@b.com"}"#)
            .await
            .unwrap();
        assert_eq!(receipt.routing_key, "notify.push");
        assert_eq!(broker.published().len(), 1);

        let result = producer.submit_json("order", "{not json").await;
        assert!(matches!(result, Err(ProducerError::InvalidBody(_))));

        let result = producer.submit_json("refund", "{}").await;
        assert!(matches!(result, Err(ProducerError::UnknownKind(kind)) if kind == "refund"));
    }

    #[test]
    fn test_receipt_serializes_camel_case() {
        let receipt = Receipt {
            status: "queued",
            routing_key: "notify.sms".to_string(),
            event_id: "evt_1".to_string(),
            outcome: PublishOutcome::Buffered,
        };
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["routingKey"], "notify.sms");
        assert_eq!(value["outcome"], "buffered");
    }
}
