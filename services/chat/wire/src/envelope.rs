//! The tagged wire envelope and its typed payloads.
//!
//! Every frame on every transport tier is one `Envelope`. The `kind` tag
//! selects which typed payload the opaque `payload` value deserializes into.

use crate::error::WireError;
use serde::{Deserialize, Serialize};

/// Maximum accepted message text length in bytes.
pub const MAX_TEXT_LEN: usize = 16 * 1024;

/// Envelope kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A chat message
    Message,
    /// Typing indicator
    Typing,
    /// Presence heartbeat or transition
    Presence,
    /// Peer-generated delivered/read signal
    Receipt,
    /// Persistence-confirmed acknowledgement
    Ack,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::Typing => "typing",
            EnvelopeKind::Presence => "presence",
            EnvelopeKind::Receipt => "receipt",
            EnvelopeKind::Ack => "ack",
        };
        write!(f, "{}", s)
    }
}

/// The wire envelope carried by every transport tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Client-generated id, globally unique per conversation
    pub id: String,
    /// Envelope kind tag
    pub kind: EnvelopeKind,
    /// Sending participant
    pub sender_id: String,
    /// Kind-specific payload
    pub payload: serde_json::Value,
    /// Client wall clock at creation (ms since epoch)
    pub client_timestamp: i64,
    /// Canonical timestamp, present once the persistence layer assigned it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
}

impl Envelope {
    /// Create an envelope with a typed payload
    pub fn new<P: Serialize>(
        id: impl Into<String>,
        kind: EnvelopeKind,
        sender_id: impl Into<String>,
        payload: &P,
        client_timestamp: i64,
    ) -> Result<Self, WireError> {
        Ok(Self {
            id: id.into(),
            kind,
            sender_id: sender_id.into(),
            payload: serde_json::to_value(payload)?,
            client_timestamp,
            server_timestamp: None,
        })
    }

    /// Deserialize the payload into its typed form
    pub fn payload_as<P: for<'de> Deserialize<'de>>(&self) -> Result<P, WireError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| WireError::InvalidPayload(format!("{} payload: {}", self.kind, e)))
    }

    /// Validate envelope structure before it enters the delivery path.
    ///
    /// Rejections are `InvalidPayload`: surfaced immediately, never retried.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.id.is_empty() {
            return Err(WireError::InvalidPayload("empty id".to_string()));
        }
        if self.sender_id.is_empty() {
            return Err(WireError::InvalidPayload("empty sender_id".to_string()));
        }
        if self.kind == EnvelopeKind::Message {
            let body: MessagePayload = self.payload_as()?;
            if body.text.len() > MAX_TEXT_LEN {
                return Err(WireError::InvalidPayload(format!(
                    "text exceeds {} bytes",
                    MAX_TEXT_LEN
                )));
            }
        }
        Ok(())
    }
}

/// Payload of a `Message` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Message text
    pub text: String,
    /// Id of the message this replies to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Whether the message has been edited
    #[serde(default)]
    pub edited: bool,
}

/// Receipt status reported by the receiving peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Message reached the peer's device
    Delivered,
    /// Message was rendered/read by the peer
    Read,
}

/// Payload of a `Receipt` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptPayload {
    /// Id of the message being receipted
    pub message_id: String,
    /// Delivered or read
    pub status: ReceiptStatus,
}

/// Payload of a `Presence` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePayload {
    /// Participant the presence signal describes
    pub user_id: String,
    /// Whether the participant reports itself online
    pub online: bool,
}

/// Payload of an `Ack` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the acknowledged message
    pub message_id: String,
    /// Canonical timestamp assigned by the persistence layer
    pub server_timestamp: i64,
}

/// Payload of a `Typing` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    /// Participant who is typing
    pub user_id: String,
}
