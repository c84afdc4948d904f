//! Shared plumbing for capability adapters.

use std::future::Future;

use async_trait::async_trait;
use messaging::EventEnvelope;
use serde::Serialize;

use super::CapabilityError;
use crate::error::{AdapterError, ProtocolError};
use crate::messages::StepRejected;
use crate::order_purchase::{EVENT_VERSION, REASON_UNAVAILABLE};
use crate::retry::RetryConfig;

/// Executes one family of capability commands.
///
/// Adapters hold no saga state. Idempotency and reply publication are handled
/// around them by the [`CommandDispatcher`](super::CommandDispatcher).
#[async_trait]
pub trait CapabilityAdapter: Send + Sync {
    /// Command types this adapter executes.
    fn command_types(&self) -> &'static [&'static str];

    /// Performs the command and builds its reply, if the command has one.
    ///
    /// Capability failures become `…failed` replies, so an `Err` here means
    /// the command itself could not be interpreted.
    async fn perform(&self, command: &EventEnvelope)
    -> Result<Option<EventEnvelope>, AdapterError>;
}

/// Default in-adapter retry for unreachable capabilities.
pub fn default_capability_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: std::time::Duration::from_millis(100),
        max_delay: std::time::Duration::from_secs(2),
        backoff_multiplier: 2.0,
    }
}

/// Calls a capability, retrying `Unavailable` errors with backoff.
pub(crate) async fn call_with_retry<T, F, Fut>(
    retry: &RetryConfig,
    operation: &str,
    mut call: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(CapabilityError::Unavailable(reason)) if !retry.is_exhausted(attempt) => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    %reason,
                    ?delay,
                    "capability unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Builds the reply to `command` carrying `data`.
pub(crate) fn reply<T: Serialize>(
    command: &EventEnvelope,
    event_type: &str,
    source: &str,
    data: &T,
) -> Result<EventEnvelope, AdapterError> {
    Ok(command
        .reply(event_type, EVENT_VERSION)
        .source(source)
        .data(data)?
        .build())
}

/// Builds the `…failed` reply for a capability error.
pub(crate) fn failure_reply(
    command: &EventEnvelope,
    event_type: &str,
    source: &str,
    error: CapabilityError,
) -> Result<EventEnvelope, AdapterError> {
    let rejection = match error {
        CapabilityError::Rejected {
            reason_code,
            reason,
        } => StepRejected::new(reason_code, reason),
        CapabilityError::Unavailable(reason) => StepRejected::new(REASON_UNAVAILABLE, reason),
    };
    reply(command, event_type, source, &rejection)
}

/// Reads the idempotency key every capability command carries.
pub fn idempotency_key_of(command: &EventEnvelope) -> Result<String, ProtocolError> {
    command
        .data
        .get("idempotency_key")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MalformedData {
            event_type: command.event_type.clone(),
            reason: "missing idempotency_key".to_string(),
        })
}
