//! State reconciliation for duolink chat.
//!
//! After a disconnect the local view and the canonical log can disagree:
//! peer messages may have landed while the link was down, and acks for our
//! own messages may have been lost. The reconciliation engine catches both
//! up from a forward-only cursor over the log, without ever producing a
//! duplicate in the merged view.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;

use thiserror::Error;

pub use engine::{ReconcileReport, ReconciliationEngine};

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// The canonical log could not be read
    #[error("store error: {0}")]
    Store(#[from] chat_store::StoreError),

    /// The delivery coordinator is gone
    #[error("delivery error: {0}")]
    Delivery(#[from] chat_delivery::DeliveryError),
}
