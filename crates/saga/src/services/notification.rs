//! Buyer notifications. Fire-and-forget: nothing waits for a reply.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{BuyerId, SagaId};
use messaging::{EventEnvelope, event_types};

use super::CapabilityError;
use super::adapter::{CapabilityAdapter, call_with_retry, default_capability_retry};
use crate::error::{AdapterError, ProtocolError};
use crate::messages::{self, NotifyBuyer, OrderOutcome};
use crate::retry::RetryConfig;

/// A notification delivered to a buyer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub order_id: SagaId,
    pub buyer_id: BuyerId,
    pub outcome: OrderOutcome,
    pub reason_code: Option<String>,
}

#[async_trait]
pub trait NotificationCapability: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), CapabilityError>;
}

/// Records notifications instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far, oldest first.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_to(&self, order_id: SagaId) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.order_id == order_id)
            .collect()
    }
}

#[async_trait]
impl NotificationCapability for InMemoryNotificationService {
    async fn notify(&self, notification: Notification) -> Result<(), CapabilityError> {
        self.sent
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
        Ok(())
    }
}

/// Executes `notification.requested`.
pub struct NotificationAdapter<C: NotificationCapability> {
    capability: C,
    retry: RetryConfig,
}

impl<C: NotificationCapability> NotificationAdapter<C> {
    pub fn new(capability: C) -> Self {
        Self {
            capability,
            retry: default_capability_retry(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl<C: NotificationCapability> CapabilityAdapter for NotificationAdapter<C> {
    fn command_types(&self) -> &'static [&'static str] {
        &[event_types::NOTIFICATION_REQUESTED]
    }

    async fn perform(
        &self,
        command: &EventEnvelope,
    ) -> Result<Option<EventEnvelope>, AdapterError> {
        if command.event_type != event_types::NOTIFICATION_REQUESTED {
            return Err(ProtocolError::UnknownEventType(command.event_type.clone()).into());
        }
        let cmd: NotifyBuyer = messages::data(command)?;
        let notification = Notification {
            order_id: cmd.order_id,
            buyer_id: cmd.buyer_id,
            outcome: cmd.outcome,
            reason_code: cmd.reason_code,
        };

        let sent = call_with_retry(&self.retry, "notification.send", || {
            self.capability.notify(notification.clone())
        })
        .await;
        if let Err(error) = sent {
            // The order outcome stands either way.
            tracing::warn!(
                order_id = %notification.order_id,
                error = %error,
                "buyer notification not delivered"
            );
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_purchase::EVENT_VERSION;

    #[tokio::test]
    async fn delivers_notification_without_reply() {
        let service = InMemoryNotificationService::new();
        let adapter = NotificationAdapter::new(service.clone());
        let order_id = SagaId::new();

        let command = EventEnvelope::builder(event_types::NOTIFICATION_REQUESTED, EVENT_VERSION)
            .data(&NotifyBuyer {
                order_id,
                buyer_id: BuyerId::new("buyer-1"),
                outcome: OrderOutcome::Failed,
                reason_code: Some("payment_declined".to_string()),
                idempotency_key: format!("{order_id}:Notify:failed"),
            })
            .unwrap()
            .build();

        assert!(adapter.perform(&command).await.unwrap().is_none());
        let sent = service.sent_to(order_id);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, OrderOutcome::Failed);
    }
}
