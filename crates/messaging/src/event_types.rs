//! Event and command type names exchanged on the bus.

pub const ORDER_SAGA_CREATED: &str = "order.saga.created";
pub const ORDER_CONFIRMED: &str = "order.confirmed";
pub const ORDER_FAILED: &str = "order.failed";

pub const INVENTORY_RESERVE_REQUESTED: &str = "inventory.reserve.requested";
pub const INVENTORY_RESERVED: &str = "inventory.reserved";
pub const INVENTORY_RESERVATION_FAILED: &str = "inventory.reservation_failed";
pub const INVENTORY_RELEASE_REQUESTED: &str = "inventory.release.requested";
pub const INVENTORY_RELEASED: &str = "inventory.released";
pub const INVENTORY_RELEASE_FAILED: &str = "inventory.release_failed";

pub const PAYMENT_CHARGE_REQUESTED: &str = "payment.charge.requested";
pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const PAYMENT_REFUND_REQUESTED: &str = "payment.refund.requested";
pub const PAYMENT_REFUNDED: &str = "payment.refunded";
pub const PAYMENT_REFUND_FAILED: &str = "payment.refund_failed";

pub const NOTIFICATION_REQUESTED: &str = "notification.requested";

/// Replies the orchestrator consumes.
pub const SAGA_REPLIES: &[&str] = &[
    INVENTORY_RESERVED,
    INVENTORY_RESERVATION_FAILED,
    INVENTORY_RELEASED,
    INVENTORY_RELEASE_FAILED,
    PAYMENT_SUCCEEDED,
    PAYMENT_FAILED,
    PAYMENT_REFUNDED,
    PAYMENT_REFUND_FAILED,
];

/// Commands the capability adapters consume.
pub const CAPABILITY_COMMANDS: &[&str] = &[
    INVENTORY_RESERVE_REQUESTED,
    INVENTORY_RELEASE_REQUESTED,
    PAYMENT_CHARGE_REQUESTED,
    PAYMENT_REFUND_REQUESTED,
    NOTIFICATION_REQUESTED,
];
