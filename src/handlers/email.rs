//! Email handler.
//!
//! Decodes an event envelope, maps it to an outgoing email and hands it to a
//! `Mailer`. Template rendering and SMTP delivery live behind the `Mailer`
//! trait; `LogMailer` logs the message instead of sending it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{BrokerChannel, Delivery, HandlerError, MessageHandler};
use crate::envelope::EventEnvelope;

/// Event names this handler understands.
pub const USER_SIGNUP_EVENT: &str = "user.signup";
pub const ORDER_COMPLETED_EVENT: &str = "order.completed";
pub const NOTIFY_CUSTOM_EVENT: &str = "notify.custom";

/// Errors from a mail transport.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Invalid recipient '{0}'")]
    InvalidRecipient(String),

    #[error("Send failed: {0}")]
    Send(String),
}

impl From<MailError> for HandlerError {
    fn from(e: MailError) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

/// An email ready for a `Mailer`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    /// Template name; `None` sends the data as-is.
    pub template: Option<String>,
    pub data: Value,
}

impl OutgoingEmail {
    /// Map an envelope to the email it should produce.
    pub fn for_envelope(envelope: &EventEnvelope) -> Result<Self, HandlerError> {
        match envelope.event() {
            USER_SIGNUP_EVENT => {
                let to = required(envelope, "email")?;
                let subject = match envelope.payload_str("name") {
                    Some(name) => format!("Welcome, {}!", name),
                    None => "Welcome!".to_string(),
                };
                Ok(Self {
                    to,
                    subject,
                    template: Some("welcome".to_string()),
                    data: envelope.payload().clone(),
                })
            }
            ORDER_COMPLETED_EVENT => {
                let to = required(envelope, "email")?;
                let order_id = required(envelope, "orderId")?;
                Ok(Self {
                    to,
                    subject: format!("Order {} confirmed", order_id),
                    template: Some("order-completed".to_string()),
                    data: envelope.payload().clone(),
                })
            }
            NOTIFY_CUSTOM_EVENT => {
                let to = required(envelope, "to")?;
                Ok(Self {
                    to,
                    subject: envelope
                        .meta_str("subject")
                        .unwrap_or("Notification")
                        .to_string(),
                    template: envelope.payload_str("template").map(str::to_string),
                    data: envelope.payload().get("data").cloned().unwrap_or(Value::Null),
                })
            }
            other => Err(HandlerError::UnknownEvent(other.to_string())),
        }
    }
}

fn required(envelope: &EventEnvelope, field: &str) -> Result<String, HandlerError> {
    envelope
        .payload_str(field)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            HandlerError::Failed(format!(
                "{} event is missing payload.{}",
                envelope.event(),
                field
            ))
        })
}

/// Sends emails.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send `email`, returning the transport's message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailError>;
}

/// Mailer that logs instead of sending.
#[derive(Debug, Clone)]
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }

    pub fn from_address(&self) -> &str {
        &self.from
    }

    /// Body used when no template engine is available.
    pub fn render_body(email: &OutgoingEmail) -> String {
        format!("<pre>{}</pre>", email.data)
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailError> {
        if !email.to.contains('@') {
            return Err(MailError::InvalidRecipient(email.to.clone()));
        }
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(
            message_id = %message_id,
            from = %self.from,
            to = %email.to,
            subject = %email.subject,
            template = email.template.as_deref().unwrap_or("-"),
            body = %Self::render_body(email),
            "Sent email"
        );
        Ok(message_id)
    }
}

/// Consumer handler turning notification events into emails.
///
/// Acks after a successful send. Undecodable or unknown events are rejected
/// without requeue; a mail failure is returned unsettled so the consumer
/// dead-letters it.
pub struct EmailHandler<M> {
    mailer: Arc<M>,
}

impl<M: Mailer + 'static> EmailHandler<M> {
    pub fn new(mailer: Arc<M>) -> Self {
        Self { mailer }
    }

    async fn process(mailer: Arc<M>, delivery: Delivery) -> Result<(), HandlerError> {
        let email = match delivery
            .decode::<EventEnvelope>()
            .map_err(HandlerError::from)
            .and_then(|envelope| OutgoingEmail::for_envelope(&envelope))
        {
            Ok(email) => email,
            Err(e) => {
                warn!(routing_key = %delivery.routing_key, error = %e, "Rejecting message");
                delivery.reject(false).await?;
                return Err(e);
            }
        };

        let message_id = mailer.send(&email).await?;
        delivery.ack().await?;

        info!(
            routing_key = %delivery.routing_key,
            message_id = %message_id,
            "Notification delivered"
        );
        Ok(())
    }
}

impl<M: Mailer + 'static> MessageHandler for EmailHandler<M> {
    fn handle(
        &self,
        delivery: Delivery,
        _channel: Arc<dyn BrokerChannel>,
    ) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(Self::process(Arc::clone(&self.mailer), delivery))
    }
}
