//! Wire envelope, message model, and stream codec for duolink chat.
//!
//! This crate defines the types shared by every other chat crate: the tagged
//! wire envelope that travels over any transport tier, the typed payloads it
//! carries, the per-message delivery state machine, and a length-prefixed
//! JSON codec for stream transports.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | envelope (JSON)      | variable (0..256 KiB)      |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod message;

// Re-export main types
pub use codec::{encode_envelope, EnvelopeDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use envelope::{
    AckPayload, Envelope, EnvelopeKind, MessagePayload, PresencePayload, ReceiptPayload,
    ReceiptStatus, TypingPayload, MAX_TEXT_LEN,
};
pub use error::WireError;
pub use message::{ChatMessage, DeliveryState};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
