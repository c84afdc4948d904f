//! Inventory capability, its in-memory implementation and its adapter.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::{ListingId, SagaId};
use messaging::{EventEnvelope, event_types};

use super::CapabilityError;
use super::adapter::{
    CapabilityAdapter, call_with_retry, default_capability_retry, failure_reply, reply,
};
use crate::error::{AdapterError, ProtocolError};
use crate::messages::{self, Acknowledged, InventoryReserved, ReleaseInventory, ReserveInventory};
use crate::order_purchase::REASON_INVENTORY_UNAVAILABLE;
use crate::retry::RetryConfig;

const SOURCE: &str = "inventory-adapter";

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryCapability: Send + Sync {
    /// Holds `quantity` units of a listing for an order.
    ///
    /// An order holds at most one reservation: a retry under a new
    /// idempotency key gets the existing one back.
    async fn reserve(
        &self,
        order_id: SagaId,
        listing_id: &ListingId,
        quantity: u32,
        idempotency_key: &str,
    ) -> Result<Reservation, CapabilityError>;

    /// Releases whatever the order holds: the reservation `reservation_id`
    /// and anything reserved under one of `reserve_keys`. Releasing nothing
    /// is not an error, and the order cannot reserve again afterwards.
    async fn release(
        &self,
        order_id: SagaId,
        reservation_id: Option<&str>,
        reserve_keys: &[String],
    ) -> Result<(), CapabilityError>;
}

#[derive(Debug, Clone)]
struct Held {
    order_id: SagaId,
    listing_id: ListingId,
    quantity: u32,
    idempotency_key: String,
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    stock: HashMap<ListingId, u32>,
    reservations: HashMap<String, Held>,
    released_orders: HashSet<SagaId>,
    next_id: u32,
    fail_on_reserve: bool,
    unavailable_reserves: usize,
    unavailable_releases: usize,
}

/// In-memory inventory service.
///
/// Listings without configured stock are unlimited.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryInventoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets the units available for a listing.
    pub fn set_stock(&self, listing_id: &ListingId, available: u32) {
        self.write().stock.insert(listing_id.clone(), available);
    }

    /// Units still available, if stock is tracked for the listing.
    pub fn available(&self, listing_id: &ListingId) -> Option<u32> {
        self.read().stock.get(listing_id).copied()
    }

    /// Configures the service to reject reservations.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.write().fail_on_reserve = fail;
    }

    /// Makes the next `count` reserve calls fail as unreachable.
    pub fn fail_next_reserves(&self, count: usize) {
        self.write().unavailable_reserves = count;
    }

    /// Makes the next `count` release calls fail as unreachable.
    pub fn fail_next_releases(&self, count: usize) {
        self.write().unavailable_releases = count;
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.read().reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.read().reservations.contains_key(reservation_id)
    }
}

#[async_trait]
impl InventoryCapability for InMemoryInventoryService {
    async fn reserve(
        &self,
        order_id: SagaId,
        listing_id: &ListingId,
        quantity: u32,
        idempotency_key: &str,
    ) -> Result<Reservation, CapabilityError> {
        let mut state = self.write();

        if state.unavailable_reserves > 0 {
            state.unavailable_reserves -= 1;
            return Err(CapabilityError::Unavailable(
                "inventory service unreachable".to_string(),
            ));
        }
        if state.fail_on_reserve {
            return Err(CapabilityError::rejected(
                REASON_INVENTORY_UNAVAILABLE,
                "Insufficient stock",
            ));
        }
        if let Some((id, _)) = state.reservations.iter().find(|(_, held)| {
            held.idempotency_key == idempotency_key || held.order_id == order_id
        }) {
            return Ok(Reservation {
                reservation_id: id.clone(),
            });
        }
        if state.released_orders.contains(&order_id) {
            // A late retry must not re-hold stock for an order already undone.
            return Err(CapabilityError::rejected(
                REASON_INVENTORY_UNAVAILABLE,
                format!("order {order_id} was already released"),
            ));
        }
        if let Some(available) = state.stock.get_mut(listing_id) {
            if *available < quantity {
                return Err(CapabilityError::rejected(
                    REASON_INVENTORY_UNAVAILABLE,
                    format!("only {available} unit(s) of {listing_id} left"),
                ));
            }
            *available -= quantity;
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state.reservations.insert(
            reservation_id.clone(),
            Held {
                order_id,
                listing_id: listing_id.clone(),
                quantity,
                idempotency_key: idempotency_key.to_string(),
            },
        );

        Ok(Reservation { reservation_id })
    }

    async fn release(
        &self,
        order_id: SagaId,
        reservation_id: Option<&str>,
        reserve_keys: &[String],
    ) -> Result<(), CapabilityError> {
        let mut state = self.write();

        if state.unavailable_releases > 0 {
            state.unavailable_releases -= 1;
            return Err(CapabilityError::Unavailable(
                "inventory service unreachable".to_string(),
            ));
        }

        let released: Vec<String> = state
            .reservations
            .iter()
            .filter(|(id, held)| {
                held.order_id == order_id
                    || reservation_id == Some(id.as_str())
                    || reserve_keys.contains(&held.idempotency_key)
            })
            .map(|(id, _)| id.clone())
            .collect();

        state.released_orders.insert(order_id);
        for id in released {
            let Some(held) = state.reservations.remove(&id) else {
                continue;
            };
            if let Some(available) = state.stock.get_mut(&held.listing_id) {
                *available += held.quantity;
            }
        }
        Ok(())
    }
}

/// Executes `inventory.reserve.requested` and `inventory.release.requested`.
pub struct InventoryAdapter<C: InventoryCapability> {
    capability: C,
    retry: RetryConfig,
}

impl<C: InventoryCapability> InventoryAdapter<C> {
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
impl<C: InventoryCapability> CapabilityAdapter for InventoryAdapter<C> {
    fn command_types(&self) -> &'static [&'static str] {
        &[
            event_types::INVENTORY_RESERVE_REQUESTED,
            event_types::INVENTORY_RELEASE_REQUESTED,
        ]
    }

    async fn perform(
        &self,
        command: &EventEnvelope,
    ) -> Result<Option<EventEnvelope>, AdapterError> {
        match command.event_type.as_str() {
            event_types::INVENTORY_RESERVE_REQUESTED => {
                let cmd: ReserveInventory = messages::data(command)?;
                let outcome = call_with_retry(&self.retry, "inventory.reserve", || {
                    self.capability.reserve(
                        cmd.saga_id,
                        &cmd.listing_id,
                        cmd.quantity,
                        &cmd.idempotency_key,
                    )
                })
                .await;
                let reply = match outcome {
                    Ok(reservation) => reply(
                        command,
                        event_types::INVENTORY_RESERVED,
                        SOURCE,
                        &InventoryReserved {
                            reservation_id: reservation.reservation_id,
                        },
                    )?,
                    Err(error) => failure_reply(
                        command,
                        event_types::INVENTORY_RESERVATION_FAILED,
                        SOURCE,
                        error,
                    )?,
                };
                Ok(Some(reply))
            }
            event_types::INVENTORY_RELEASE_REQUESTED => {
                let cmd: ReleaseInventory = messages::data(command)?;
                let outcome = call_with_retry(&self.retry, "inventory.release", || {
                    self.capability.release(
                        cmd.saga_id,
                        cmd.reservation_id.as_deref(),
                        &cmd.reserve_keys,
                    )
                })
                .await;
                let reply = match outcome {
                    Ok(()) => reply(
                        command,
                        event_types::INVENTORY_RELEASED,
                        SOURCE,
                        &Acknowledged {},
                    )?,
                    Err(error) => failure_reply(
                        command,
                        event_types::INVENTORY_RELEASE_FAILED,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();
        let listing = ListingId::new("listing-1");
        let order = SagaId::new();
        service.set_stock(&listing, 5);

        let result = service.reserve(order, &listing, 2, "k1").await.unwrap();
        assert!(result.reservation_id.starts_with("RES-"));
        assert_eq!(service.reservation_count(), 1);
        assert_eq!(service.available(&listing), Some(3));

        service
            .release(order, Some(&result.reservation_id), &[])
            .await
            .unwrap();
        assert_eq!(service.reservation_count(), 0);
        assert_eq!(service.available(&listing), Some(5));
    }

    #[tokio::test]
    async fn test_one_reservation_per_order() {
        let service = InMemoryInventoryService::new();
        let listing = ListingId::new("listing-1");
        let order = SagaId::new();

        let first = service.reserve(order, &listing, 1, "k1").await.unwrap();
        let retry = service.reserve(order, &listing, 1, "k2").await.unwrap();
        assert_eq!(first, retry);
        assert_eq!(service.reservation_count(), 1);
    }

    #[tokio::test]
    async fn test_released_order_cannot_reserve_again() {
        let service = InMemoryInventoryService::new();
        let listing = ListingId::new("listing-1");
        let order = SagaId::new();

        // Release overtook the reserve command.
        service.release(order, None, &["k1".to_string()]).await.unwrap();

        let late = service.reserve(order, &listing, 1, "k1").await;
        assert!(matches!(late, Err(CapabilityError::Rejected { .. })));
        assert_eq!(service.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_release_by_keys_without_reservation_id() {
        let service = InMemoryInventoryService::new();
        let listing = ListingId::new("listing-1");
        let order = SagaId::new();
        service.reserve(order, &listing, 1, "k1").await.unwrap();
        service.reserve(SagaId::new(), &listing, 1, "k2").await.unwrap();

        service
            .release(order, None, &["k1".to_string(), "k2".to_string()])
            .await
            .unwrap();
        assert_eq!(service.reservation_count(), 0);

        // Nothing left to release is still a success.
        service.release(order, Some("RES-9999"), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_rejected() {
        let service = InMemoryInventoryService::new();
        let listing = ListingId::new("listing-1");
        service.set_stock(&listing, 1);

        let result = service.reserve(SagaId::new(), &listing, 2, "k1").await;
        let Err(CapabilityError::Rejected { reason_code, .. }) = result else {
            panic!("expected a rejection");
        };
        assert_eq!(reason_code, REASON_INVENTORY_UNAVAILABLE);
        assert_eq!(service.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_sequential_reservation_ids() {
        let service = InMemoryInventoryService::new();
        let listing = ListingId::new("listing-1");

        let r1 = service.reserve(SagaId::new(), &listing, 1, "a").await.unwrap();
        let r2 = service.reserve(SagaId::new(), &listing, 1, "b").await.unwrap();

        assert_eq!(r1.reservation_id, "RES-0001");
        assert_eq!(r2.reservation_id, "RES-0002");
    }
}
