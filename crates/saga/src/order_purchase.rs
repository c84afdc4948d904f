//! Order purchase saga constants.

use messaging::{SemVer, VersionRange};

/// Source recorded on envelopes the orchestrator emits.
pub const SAGA_SOURCE: &str = "order-saga";

/// Source recorded on failure events synthesized by the timeout sweeper.
pub const SWEEPER_SOURCE: &str = "order-saga-sweeper";

/// Source recorded on envelopes built from payment provider webhooks.
pub const WEBHOOK_SOURCE: &str = "payment-webhook";

/// Schema version of every envelope this crate produces.
pub const EVENT_VERSION: SemVer = SemVer::new(1, 0, 0);

/// Schema versions this crate accepts.
pub const SUPPORTED_VERSIONS: VersionRange = VersionRange::major(1);

/// Reason code: the buyer cancelled the order.
pub const REASON_CANCELLED: &str = "cancelled";

/// Reason code: a step produced no reply before its deadline.
pub const REASON_TIMEOUT: &str = "timeout";

/// Reason code: a capability stayed unreachable after retries.
pub const REASON_UNAVAILABLE: &str = "unavailable";

/// Reason code: not enough stock for the listing.
pub const REASON_INVENTORY_UNAVAILABLE: &str = "inventory_unavailable";

/// Reason code: the payment provider declined the charge.
pub const REASON_PAYMENT_DECLINED: &str = "payment_declined";

/// Message shown to buyers for any failed order. Internal reasons stay internal.
pub const BUYER_FAILURE_MESSAGE: &str = "could not complete purchase";
