use thiserror::Error;

use crate::models::{notification::Channel, status::NotificationStatus};

/// Synchronous failures returned to the caller of `submit`.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Forbidden: {0}")]
    Authorization(String),

    #[error("User {user_id} has disabled {channel} notifications")]
    ChannelDisabled { user_id: String, channel: Channel },

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),
}

impl IntakeError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Callers may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntakeError::DependencyUnavailable(_) | IntakeError::RateLimited(_)
        )
    }
}

impl From<StoreError> for IntakeError {
    fn from(err: StoreError) -> Self {
        IntakeError::DependencyUnavailable(err.to_string())
    }
}

impl From<BusError> for IntakeError {
    fn from(err: BusError) -> Self {
        IntakeError::DependencyUnavailable(err.to_string())
    }
}

/// Failures inside a channel worker. Never surfaced past the worker.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Circuit breaker is open for {0}")]
    BreakerOpen(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Provider send failed: {0}")]
    Provider(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl DeliveryError {
    /// Permanent failures skip the retry budget and go straight to dead-letter.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DeliveryError::Render(_) | DeliveryError::MalformedEnvelope(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Status store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt value under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Message bus connection failed: {0}")]
    Connection(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: cannot transition from {from} to {to}")]
    InvalidTransition {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("Status update for {0} lost too many concurrent races")]
    Contention(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker is open for {0}")]
    Open(String),

    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}
