//! Delivery error taxonomy.
//!
//! Errors split into three classes with different handling: invalid input
//! is surfaced immediately and never retried, transient failures go
//! through the retry schedule, and exhaustion marks the message failed
//! while keeping it eligible for a manual resend.

use thiserror::Error;

/// Errors from the delivery coordinator
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The message failed validation; surfaced immediately, never retried
    #[error("invalid message: {0}")]
    Invalid(String),

    /// A retryable failure (transport drop, backend outage, ack timeout)
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// All retry attempts consumed; the message is marked failed
    #[error("delivery attempts exhausted for {0}")]
    Exhausted(String),

    /// The referenced message is not tracked by this coordinator
    #[error("unknown message {0}")]
    UnknownMessage(String),

    /// Credentials expired; all sends halt until re-authentication
    #[error("authentication expired; sends halted")]
    AuthExpired,

    /// The coordinator has shut down
    #[error("coordinator closed")]
    Closed,

    /// Illegal delivery-state transition
    #[error("illegal transition from {from} to {to} for {id}")]
    IllegalTransition {
        /// Message id
        id: String,
        /// Current state
        from: chat_wire::DeliveryState,
        /// Rejected target state
        to: chat_wire::DeliveryState,
    },
}

impl From<chat_wire::WireError> for DeliveryError {
    fn from(e: chat_wire::WireError) -> Self {
        DeliveryError::Invalid(e.to_string())
    }
}

impl From<chat_store::StoreError> for DeliveryError {
    fn from(e: chat_store::StoreError) -> Self {
        match e {
            chat_store::StoreError::Unavailable(reason) => DeliveryError::Transient(reason),
            other => DeliveryError::Transient(other.to_string()),
        }
    }
}

impl From<chat_transport::TransportError> for DeliveryError {
    fn from(e: chat_transport::TransportError) -> Self {
        match e {
            chat_transport::TransportError::AuthExpired => DeliveryError::AuthExpired,
            other => DeliveryError::Transient(other.to_string()),
        }
    }
}
