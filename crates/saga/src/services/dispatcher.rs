//! Routes capability commands to their adapters behind the idempotency store.

use std::collections::HashMap;
use std::sync::Arc;

use idempotency::IdempotencyStore;
use messaging::{EventEnvelope, MessageBus, Subscription};
use tokio::sync::watch;

use super::adapter::{CapabilityAdapter, idempotency_key_of};
use crate::error::{AdapterError, ProtocolError};
use crate::messages::ensure_supported;
use crate::retry::RetryConfig;

/// How a command delivery was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The command ran and its reply, if any, was published.
    Executed,
    /// The key was processed before; the stored reply was published again.
    Duplicate,
    /// Another executor holds the key and has not finished.
    InFlight,
}

/// Executes capability commands at most once per idempotency key.
pub struct CommandDispatcher<K, B>
where
    K: IdempotencyStore,
    B: MessageBus,
{
    adapters: HashMap<&'static str, Arc<dyn CapabilityAdapter>>,
    idempotency: K,
    bus: B,
}

impl<K, B> CommandDispatcher<K, B>
where
    K: IdempotencyStore,
    B: MessageBus,
{
    pub fn new(idempotency: K, bus: B) -> Self {
        Self {
            adapters: HashMap::new(),
            idempotency,
            bus,
        }
    }

    /// Registers an adapter for every command type it declares.
    pub fn register(mut self, adapter: impl CapabilityAdapter + 'static) -> Self {
        let adapter: Arc<dyn CapabilityAdapter> = Arc::new(adapter);
        for command_type in adapter.command_types() {
            self.adapters.insert(*command_type, Arc::clone(&adapter));
        }
        self
    }

    /// Command types with a registered adapter.
    pub fn command_types(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }

    /// Executes one command delivery.
    #[tracing::instrument(
        skip(self, command),
        fields(event_type = %command.event_type, event_id = %command.event_id)
    )]
    pub async fn execute(&self, command: &EventEnvelope) -> Result<Ack, AdapterError> {
        ensure_supported(command)?;
        let adapter = self
            .adapters
            .get(command.event_type.as_str())
            .ok_or_else(|| ProtocolError::UnknownEventType(command.event_type.clone()))?;
        let key = idempotency_key_of(command)?;

        let check = self.idempotency.check_and_reserve(&key).await?;
        if check.already_processed {
            let Some(stored) = check.stored_result else {
                tracing::debug!(%key, "command in flight elsewhere");
                return Ok(Ack::InFlight);
            };
            let reply: Option<EventEnvelope> = serde_json::from_value(stored)?;
            if let Some(reply) = reply {
                self.bus.publish(reply).await?;
            }
            tracing::debug!(%key, "duplicate command, replayed stored reply");
            return Ok(Ack::Duplicate);
        }

        let reply = match adapter.perform(command).await {
            Ok(reply) => reply,
            Err(e) => {
                if let Err(release_err) = self.idempotency.release(&key).await {
                    tracing::warn!(
                        %key,
                        error = %release_err,
                        "failed to release idempotency claim"
                    );
                }
                return Err(e);
            }
        };

        self.idempotency
            .record_result(&key, serde_json::to_value(&reply)?)
            .await?;
        if let Some(reply) = reply {
            // A lost publish is recovered by the replay on redelivery.
            self.bus.publish(reply).await?;
        }
        metrics::counter!(
            "capability_commands_executed_total",
            "command" => command.event_type.clone()
        )
        .increment(1);
        Ok(Ack::Executed)
    }

    /// Executes a delivery, retrying transient failures with `redelivery`.
    ///
    /// A command that still fails is dropped; the saga's deadline reissues it.
    pub async fn execute_with_redelivery(
        &self,
        command: &EventEnvelope,
        redelivery: &RetryConfig,
    ) -> Option<Ack> {
        let mut attempt = 1;
        loop {
            match self.execute(command).await {
                Ok(ack) => return Some(ack),
                Err(e) if e.is_transient() && !redelivery.is_exhausted(attempt) => {
                    let delay = redelivery.delay_for(attempt);
                    tracing::warn!(
                        event_id = %command.event_id,
                        attempt,
                        error = %e,
                        ?delay,
                        "command failed, redelivering"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %command.event_id,
                        event_type = %command.event_type,
                        error = %e,
                        "dropping command"
                    );
                    return None;
                }
            }
        }
    }

    /// Consumes `subscription` until `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        subscription: Subscription,
        redelivery: RetryConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("command dispatcher started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = subscription.recv() => {
                    let Some(command) = next else { break };
                    self.execute_with_redelivery(&command, &redelivery).await;
                }
            }
        }
        tracing::info!("command dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use common::{ListingId, SagaId};
    use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, SharedString, Unit};
    use idempotency::InMemoryIdempotencyStore;
    use messaging::{InMemoryBus, SemVer, event_types};

    use super::*;
    use crate::messages::ReserveInventory;
    use crate::order_purchase::EVENT_VERSION;
    use crate::services::{InMemoryInventoryService, InventoryAdapter};

    fn reserve_command(key: &str) -> EventEnvelope {
        EventEnvelope::builder(event_types::INVENTORY_RESERVE_REQUESTED, EVENT_VERSION)
            .data(&ReserveInventory {
                saga_id: SagaId::new(),
                listing_id: ListingId::new("listing-1"),
                quantity: 1,
                idempotency_key: key.to_string(),
            })
            .unwrap()
            .build()
    }

    fn dispatcher(
        inventory: &InMemoryInventoryService,
        bus: &InMemoryBus,
    ) -> CommandDispatcher<InMemoryIdempotencyStore, InMemoryBus> {
        CommandDispatcher::new(InMemoryIdempotencyStore::new(), bus.clone())
            .register(InventoryAdapter::new(inventory.clone()))
    }

    #[tokio::test]
    async fn duplicate_delivery_runs_once_and_replays_reply() {
        let inventory = InMemoryInventoryService::new();
        let bus = InMemoryBus::new();
        let dispatcher = dispatcher(&inventory, &bus);
        let command = reserve_command("saga:Reservation:1");

        assert_eq!(dispatcher.execute(&command).await.unwrap(), Ack::Executed);
        assert_eq!(dispatcher.execute(&command).await.unwrap(), Ack::Duplicate);

        assert_eq!(inventory.reservation_count(), 1);
        let replies = bus.published_of_type(event_types::INVENTORY_RESERVED).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].event_id, replies[1].event_id);
    }

    /// Counts increments of one counter on the current thread.
    struct CounterRecorder {
        name: &'static str,
        value: Arc<AtomicU64>,
    }

    impl metrics::Recorder for CounterRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            if key.name() == self.name {
                Counter::from_arc(Arc::clone(&self.value))
            } else {
                Counter::noop()
            }
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn duplicate_delivery_is_counted_once() {
        let duplicates = CounterRecorder {
            name: "idempotency_duplicates_total",
            value: Arc::new(AtomicU64::new(0)),
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&duplicates, || {
            rt.block_on(async {
                let inventory = InMemoryInventoryService::new();
                let bus = InMemoryBus::new();
                let dispatcher = dispatcher(&inventory, &bus);
                let command = reserve_command("saga:Reservation:1");

                dispatcher.execute(&command).await.unwrap();
                assert_eq!(dispatcher.execute(&command).await.unwrap(), Ack::Duplicate);
            })
        });

        assert_eq!(duplicates.value.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unsupported_version_is_refused() {
        let inventory = InMemoryInventoryService::new();
        let bus = InMemoryBus::new();
        let dispatcher = dispatcher(&inventory, &bus);
        let command = EventEnvelope::builder(
            event_types::INVENTORY_RESERVE_REQUESTED,
            SemVer::new(2, 0, 0),
        )
        .data_raw(serde_json::json!({"idempotency_key": "k"}))
        .build();

        let result = dispatcher.execute(&command).await;
        assert!(matches!(
            result,
            Err(AdapterError::Protocol(ProtocolError::UnsupportedVersion { .. }))
        ));
        assert_eq!(inventory.reservation_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_is_redelivered_with_stored_reply() {
        let inventory = InMemoryInventoryService::new();
        let bus = InMemoryBus::new();
        let dispatcher = dispatcher(&inventory, &bus);
        let command = reserve_command("saga:Reservation:1");
        bus.fail_next_publishes(1);

        let redelivery = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        };
        let ack = dispatcher
            .execute_with_redelivery(&command, &redelivery)
            .await;

        assert_eq!(ack, Some(Ack::Duplicate));
        assert_eq!(inventory.reservation_count(), 1);
        assert_eq!(
            bus.published_of_type(event_types::INVENTORY_RESERVED)
                .await
                .len(),
            1
        );
    }
}
