//! Payment capability, its in-memory implementation and its adapter.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::{BuyerId, Currency, Money, SagaId};
use messaging::{EventEnvelope, event_types};

use super::CapabilityError;
use super::adapter::{
    CapabilityAdapter, call_with_retry, default_capability_retry, failure_reply, reply,
};
use crate::error::{AdapterError, ProtocolError};
use crate::messages::{self, Acknowledged, ChargePayment, PaymentSucceeded, RefundPayment};
use crate::order_purchase::REASON_PAYMENT_DECLINED;
use crate::retry::RetryConfig;

const SOURCE: &str = "payment-adapter";

/// What a charge request resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The provider captured the funds.
    Succeeded { payment_id: String },
    /// The provider accepted the request and will confirm through its webhook.
    Pending,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentCapability: Send + Sync {
    /// Charges a buyer for an order.
    ///
    /// An order is charged at most once: a retry under a new idempotency key
    /// gets the existing payment back.
    async fn charge(
        &self,
        order_id: SagaId,
        buyer_id: &BuyerId,
        amount: Money,
        currency: &Currency,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome, CapabilityError>;

    /// Refunds everything charged for the order: `payment_id` and any charge
    /// made under one of `charge_keys`. Refunding nothing is not an error, and
    /// the order cannot be charged again afterwards.
    async fn refund(
        &self,
        order_id: SagaId,
        payment_id: Option<&str>,
        charge_keys: &[String],
    ) -> Result<(), CapabilityError>;
}

#[derive(Debug, Clone)]
struct Charge {
    order_id: SagaId,
    buyer_id: BuyerId,
    amount: Money,
    idempotency_key: String,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, Charge>,
    awaiting_confirmation: HashMap<String, (SagaId, BuyerId, Money)>,
    refunded: Vec<String>,
    refunded_orders: HashSet<SagaId>,
    next_id: u32,
    fail_on_charge: bool,
    async_confirmation: bool,
    unavailable_charges: usize,
    unavailable_refunds: usize,
}

impl InMemoryPaymentState {
    fn capture(
        &mut self,
        order_id: SagaId,
        buyer_id: BuyerId,
        amount: Money,
        idempotency_key: &str,
    ) -> String {
        self.next_id += 1;
        let payment_id = format!("PAY-{:04}", self.next_id);
        self.payments.insert(
            payment_id.clone(),
            Charge {
                order_id,
                buyer_id,
                amount,
                idempotency_key: idempotency_key.to_string(),
            },
        );
        payment_id
    }
}

/// In-memory payment provider.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryPaymentState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Configures the service to decline charges.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.write().fail_on_charge = fail;
    }

    /// Makes charges return [`ChargeOutcome::Pending`] until settled.
    pub fn set_async_confirmation(&self, enabled: bool) {
        self.write().async_confirmation = enabled;
    }

    /// Captures a charge left pending, as the provider would before calling
    /// its webhook. Returns the payment ID.
    pub fn settle_pending(&self, idempotency_key: &str) -> Option<String> {
        let mut state = self.write();
        let (order_id, buyer_id, amount) = state.awaiting_confirmation.remove(idempotency_key)?;
        if let Some((id, _)) = state.payments.iter().find(|(_, c)| c.order_id == order_id) {
            return Some(id.clone());
        }
        Some(state.capture(order_id, buyer_id, amount, idempotency_key))
    }

    /// Makes the next `count` charge calls fail as unreachable.
    pub fn fail_next_charges(&self, count: usize) {
        self.write().unavailable_charges = count;
    }

    /// Makes the next `count` refund calls fail as unreachable.
    pub fn fail_next_refunds(&self, count: usize) {
        self.write().unavailable_refunds = count;
    }

    /// Returns the number of captured, unrefunded payments.
    pub fn payment_count(&self) -> usize {
        self.read().payments.len()
    }

    /// Returns true if a captured payment exists with the given ID.
    pub fn has_payment(&self, payment_id: &str) -> bool {
        self.read().payments.contains_key(payment_id)
    }

    /// Returns the number of refunded payments.
    pub fn refund_count(&self) -> usize {
        self.read().refunded.len()
    }

    /// Total captured for a buyer across unrefunded payments.
    pub fn charged_to(&self, buyer_id: &BuyerId) -> Money {
        let cents = self
            .read()
            .payments
            .values()
            .filter(|c| &c.buyer_id == buyer_id)
            .map(|c| c.amount.cents())
            .sum();
        Money::from_cents(cents)
    }
}

#[async_trait]
impl PaymentCapability for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: SagaId,
        buyer_id: &BuyerId,
        amount: Money,
        _currency: &Currency,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome, CapabilityError> {
        let mut state = self.write();

        if state.unavailable_charges > 0 {
            state.unavailable_charges -= 1;
            return Err(CapabilityError::Unavailable(
                "payment provider unreachable".to_string(),
            ));
        }
        if state.fail_on_charge {
            return Err(CapabilityError::rejected(
                REASON_PAYMENT_DECLINED,
                "Payment declined",
            ));
        }
        if let Some((id, _)) = state
            .payments
            .iter()
            .find(|(_, c)| c.idempotency_key == idempotency_key || c.order_id == order_id)
        {
            return Ok(ChargeOutcome::Succeeded {
                payment_id: id.clone(),
            });
        }
        if state.refunded_orders.contains(&order_id) {
            return Err(CapabilityError::rejected(
                REASON_PAYMENT_DECLINED,
                format!("order {order_id} was already refunded"),
            ));
        }
        if state.async_confirmation {
            state.awaiting_confirmation.insert(
                idempotency_key.to_string(),
                (order_id, buyer_id.clone(), amount),
            );
            return Ok(ChargeOutcome::Pending);
        }

        let payment_id = state.capture(order_id, buyer_id.clone(), amount, idempotency_key);
        Ok(ChargeOutcome::Succeeded { payment_id })
    }

    async fn refund(
        &self,
        order_id: SagaId,
        payment_id: Option<&str>,
        charge_keys: &[String],
    ) -> Result<(), CapabilityError> {
        let mut state = self.write();

        if state.unavailable_refunds > 0 {
            state.unavailable_refunds -= 1;
            return Err(CapabilityError::Unavailable(
                "payment provider unreachable".to_string(),
            ));
        }

        let refunded: Vec<String> = state
            .payments
            .iter()
            .filter(|(id, c)| {
                c.order_id == order_id
                    || payment_id == Some(id.as_str())
                    || charge_keys.contains(&c.idempotency_key)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in refunded {
            state.payments.remove(&id);
            state.refunded.push(id);
        }
        // A charge still waiting on the provider must never settle.
        state
            .awaiting_confirmation
            .retain(|key, (order, _, _)| *order != order_id && !charge_keys.contains(key));
        state.refunded_orders.insert(order_id);
        Ok(())
    }
}

/// Executes `payment.charge.requested` and `payment.refund.requested`.
pub struct PaymentAdapter<C: PaymentCapability> {
    capability: C,
    retry: RetryConfig,
}

impl<C: PaymentCapability> PaymentAdapter<C> {
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
impl<C: PaymentCapability> CapabilityAdapter for PaymentAdapter<C> {
    fn command_types(&self) -> &'static [&'static str] {
        &[
            event_types::PAYMENT_CHARGE_REQUESTED,
            event_types::PAYMENT_REFUND_REQUESTED,
        ]
    }

    async fn perform(
        &self,
        command: &EventEnvelope,
    ) -> Result<Option<EventEnvelope>, AdapterError> {
        match command.event_type.as_str() {
            event_types::PAYMENT_CHARGE_REQUESTED => {
                let cmd: ChargePayment = messages::data(command)?;
                let outcome = call_with_retry(&self.retry, "payment.charge", || {
                    self.capability.charge(
                        cmd.saga_id,
                        &cmd.buyer_id,
                        cmd.amount,
                        &cmd.currency,
                        &cmd.idempotency_key,
                    )
                })
                .await;
                match outcome {
                    Ok(ChargeOutcome::Succeeded { payment_id }) => Ok(Some(reply(
                        command,
                        event_types::PAYMENT_SUCCEEDED,
                        SOURCE,
                        &PaymentSucceeded { payment_id },
                    )?)),
                    Ok(ChargeOutcome::Pending) => {
                        tracing::debug!(
                            idempotency_key = %cmd.idempotency_key,
                            "charge awaiting provider confirmation"
                        );
                        Ok(None)
                    }
                    Err(error) => Ok(Some(failure_reply(
                        command,
                        event_types::PAYMENT_FAILED,
                        SOURCE,
                        error,
                    )?)),
                }
            }
            event_types::PAYMENT_REFUND_REQUESTED => {
                let cmd: RefundPayment = messages::data(command)?;
                let outcome = call_with_retry(&self.retry, "payment.refund", || {
                    self.capability.refund(
                        cmd.saga_id,
                        cmd.payment_id.as_deref(),
                        &cmd.charge_keys,
                    )
                })
                .await;
                let reply = match outcome {
                    Ok(()) => reply(
                        command,
                        event_types::PAYMENT_REFUNDED,
                        SOURCE,
                        &Acknowledged {},
                    )?,
                    Err(error) => failure_reply(
                        command,
                        event_types::PAYMENT_REFUND_FAILED,
                        SOURCE,
                        error,
                    )?,
                };
                Ok(Some(reply))
            }
            other => Err(ProtocolError::UnknownEventType(other.to_string()).into()),
        }
    }
}
