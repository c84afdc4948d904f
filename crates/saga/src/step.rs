//! Step records: one per forward or compensating step the saga has started.

use chrono::{DateTime, Utc};
use common::SagaId;
use messaging::EventId;
use messaging::event_types;
use serde::{Deserialize, Serialize};

/// A unit of work the saga asks a capability to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepName {
    Reservation,
    Payment,
    ReleaseInventory,
    RefundPayment,
}

impl StepName {
    /// Returns true for steps that undo a forward step.
    pub fn is_compensation(&self) -> bool {
        matches!(self, StepName::ReleaseInventory | StepName::RefundPayment)
    }

    /// The command type issued to perform this step.
    pub fn command_type(&self) -> &'static str {
        match self {
            StepName::Reservation => event_types::INVENTORY_RESERVE_REQUESTED,
            StepName::Payment => event_types::PAYMENT_CHARGE_REQUESTED,
            StepName::ReleaseInventory => event_types::INVENTORY_RELEASE_REQUESTED,
            StepName::RefundPayment => event_types::PAYMENT_REFUND_REQUESTED,
        }
    }

    /// The reply type reporting that this step failed.
    pub fn failure_type(&self) -> &'static str {
        match self {
            StepName::Reservation => event_types::INVENTORY_RESERVATION_FAILED,
            StepName::Payment => event_types::PAYMENT_FAILED,
            StepName::ReleaseInventory => event_types::INVENTORY_RELEASE_FAILED,
            StepName::RefundPayment => event_types::PAYMENT_REFUND_FAILED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Reservation => "Reservation",
            StepName::Payment => "Payment",
            StepName::ReleaseInventory => "ReleaseInventory",
            StepName::RefundPayment => "RefundPayment",
        }
    }

    /// Parses the name used inside idempotency keys.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Reservation" => Some(StepName::Reservation),
            "Payment" => Some(StepName::Payment),
            "ReleaseInventory" => Some(StepName::ReleaseInventory),
            "RefundPayment" => Some(StepName::RefundPayment),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of a step. Only ever moves forward: `Pending` first, then
/// `Succeeded` or `Failed`, and `Compensated` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
    Compensated,
}

impl StepStatus {
    fn rank(&self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Succeeded | StepStatus::Failed => 1,
            StepStatus::Compensated => 2,
        }
    }

    /// Returns true if a step may move from `self` to `next`.
    pub fn can_advance_to(&self, next: StepStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Builds the idempotency key for one attempt of one step.
///
/// The format is `{saga_id}:{step}:{attempt}`, so every retry of the same
/// step carries a fresh key while redeliveries of the same attempt share one.
pub fn idempotency_key(saga_id: SagaId, step: StepName, attempt: u32) -> String {
    format!("{saga_id}:{step}:{attempt}")
}

/// Splits an idempotency key built by [`idempotency_key`].
pub fn parse_idempotency_key(key: &str) -> Option<(SagaId, StepName, u32)> {
    let mut parts = key.splitn(3, ':');
    let saga_id = SagaId::parse(parts.next()?).ok()?;
    let step = StepName::parse(parts.next()?)?;
    let attempt = parts.next()?.parse().ok()?;
    Some((saga_id, step, attempt))
}

/// One command sent for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedCommand {
    pub command_id: EventId,
    pub attempt: u32,
    pub idempotency_key: String,
    pub issued_at: DateTime<Utc>,
    /// Set once a reply caused by this command has been applied.
    pub answered: bool,
}

/// The saga's record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: StepName,
    pub status: StepStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub commands: Vec<IssuedCommand>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the current attempt is considered lost and re-issued.
    pub retry_at: Option<DateTime<Utc>>,
    /// The step timed out, so the capability may have acted without replying.
    #[serde(default)]
    pub outcome_unknown: bool,
    /// A compensation ran past its ceiling and was reported for manual review.
    #[serde(default)]
    pub escalated: bool,
}

impl StepRecord {
    pub fn new(name: StepName, now: DateTime<Utc>) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            commands: Vec::new(),
            started_at: now,
            completed_at: None,
            retry_at: None,
            outcome_unknown: false,
            escalated: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    /// The command with this id, if it is still awaiting its reply.
    pub fn outstanding(&self, command_id: EventId) -> Option<&IssuedCommand> {
        if !self.is_pending() {
            return None;
        }
        self.commands
            .iter()
            .find(|c| c.command_id == command_id && !c.answered)
    }

    /// The most recent command that has not been answered.
    pub fn latest_unanswered(&self) -> Option<&IssuedCommand> {
        self.commands.iter().rev().find(|c| !c.answered)
    }

    pub fn command_for_key(&self, idempotency_key: &str) -> Option<&IssuedCommand> {
        self.commands
            .iter()
            .find(|c| c.idempotency_key == idempotency_key)
    }

    /// Every idempotency key issued for this step, oldest first.
    pub fn idempotency_keys(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| c.idempotency_key.clone())
            .collect()
    }

    pub(crate) fn record_issue(&mut self, command: IssuedCommand) {
        self.attempts = command.attempt;
        self.commands.push(command);
    }

    pub(crate) fn mark_answered(&mut self, command_id: EventId) {
        if let Some(command) = self.commands.iter_mut().find(|c| c.command_id == command_id) {
            command.answered = true;
        }
    }

    pub(crate) fn complete(&mut self, status: StepStatus, now: DateTime<Utc>) {
        debug_assert!(
            self.status.can_advance_to(status),
            "step {} cannot move from {:?} to {:?}",
            self.name,
            self.status,
            status
        );
        self.status = status;
        self.completed_at = Some(now);
        self.retry_at = None;
    }
}
