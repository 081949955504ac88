//! Delivery collaborator for rendered notification events.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::db::{NotificationEvent, NotificationMethod};

/// Delivery error types. Recorded on the event, never fatal to the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("delivery method {0} is not supported")]
    Unsupported(NotificationMethod),
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Sends one notification event over its method's transport.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent, webhook_url: Option<&str>) -> Result<(), DeliveryError>;
}

/// Body posted to webhook endpoints.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub event: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    pub target_id: i64,
    pub metadata: &'a serde_json::Value,
    pub timestamp: String,
}

impl<'a> WebhookPayload<'a> {
    pub fn from_event(event: &'a NotificationEvent) -> Self {
        Self {
            event: event.notification_type.as_str(),
            title: &event.title,
            message: &event.message,
            target_id: event.target_id,
            metadata: &event.metadata,
            timestamp: event.created_at.to_rfc3339(),
        }
    }
}

/// Delivery that writes every event to the log.
///
/// In-app events need nothing more than being stored, so they count as sent.
pub struct LogDelivery;

#[async_trait]
impl Deliver for LogDelivery {
    async fn deliver(&self, event: &NotificationEvent, webhook_url: Option<&str>) -> Result<(), DeliveryError> {
        match event.method {
            NotificationMethod::InApp => {
                tracing::info!("Notify in-app user={}: {}", event.user_id, event.title);
            }
            NotificationMethod::Email => {
                tracing::info!(
                    "Notify email user={}: {} | {}",
                    event.user_id,
                    event.title,
                    event.message
                );
            }
            NotificationMethod::Webhook => {
                let url = webhook_url.ok_or_else(|| DeliveryError::Rejected("no webhook url".to_string()))?;
                let body = serde_json::to_string(&WebhookPayload::from_event(event))
                    .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
                tracing::info!("Notify webhook {}: {}", url, body);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DeliveryStatus, NotificationType};
    use chrono::Utc;

    fn event(method: NotificationMethod) -> NotificationEvent {
        NotificationEvent {
            id: 1,
            user_id: 2,
            target_id: 3,
            notification_type: NotificationType::UpAlert,
            method,
            title: "api is back UP".to_string(),
            message: "recovered".to_string(),
            delivery_status: DeliveryStatus::Pending,
            error_message: None,
            metadata: serde_json::json!({"status": "up"}),
            sent_at: None,
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_log_delivery() {
        tokio_test::assert_ok!(LogDelivery.deliver(&event(NotificationMethod::InApp), None).await);
        tokio_test::assert_ok!(LogDelivery.deliver(&event(NotificationMethod::Email), None).await);
        tokio_test::assert_ok!(
            LogDelivery
                .deliver(&event(NotificationMethod::Webhook), Some("https://hooks.example.com/x"))
                .await
        );
    }

    #[tokio::test]
    async fn test_webhook_without_url_is_rejected() {
        let err = LogDelivery
            .deliver(&event(NotificationMethod::Webhook), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(_)));
    }

    #[test]
    fn test_webhook_payload_shape() {
        let ev = event(NotificationMethod::Webhook);
        let value = serde_json::to_value(WebhookPayload::from_event(&ev)).unwrap();
        assert_eq!(value["event"], "up_alert");
        assert_eq!(value["target_id"], 3);
        assert_eq!(value["metadata"]["status"], "up");
    }
}
