use thiserror::Error;

use crate::peer::PeerConnectionState;

/// Errors surfaced to the application layer.
///
/// None of these terminate a running meeting session; they are scoped to
/// one message or one participant connection.
#[derive(Debug, Error)]
pub enum HuddleError {
    #[error("signaling unavailable: {0}")]
    TransportUnavailable(String),
    #[error("negotiation with {participant_id} failed: {reason}")]
    Negotiation {
        participant_id: String,
        reason: String,
    },
    #[error("unknown participant: {0}")]
    UnknownRecipient(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolError),
    #[error("meeting session already started")]
    AlreadyStarted,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("settings: {0}")]
    Settings(String),
}

impl From<TransportError> for HuddleError {
    fn from(e: TransportError) -> Self {
        HuddleError::TransportUnavailable(e.to_string())
    }
}

/// Signaling channel failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("signaling channel is closed")]
    Closed,
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Inbound wire messages that cannot be dispatched.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("message has no type tag")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("directed message '{0}' has no recipient")]
    MissingRecipient(&'static str),
    #[error("directed message '{0}' has no sender")]
    MissingSender(&'static str),
}

/// Failures reported by the platform peer connection.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("track operation failed: {0}")]
    Track(String),
    #[error("connection {0:?}")]
    ConnectionLost(PeerConnectionState),
    #[error("peer connection closed")]
    Closed,
    #[error("platform error: {0}")]
    Platform(String),
}
