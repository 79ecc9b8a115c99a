//! Relay Protocol: inbound client events, outbound envelopes and the JSON codec

use super::registry::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason attached to a rejection produced by the relay itself
pub const NOT_ONLINE_REASON: &str = "User not online on this host";

/// An event sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind an identity to the sending connection
    Register {
        /// Identity to claim (field name kept for wire compatibility)
        mobile: Identity,
    },
    /// Ask `to` to pair with `from`
    ConnectionRequest { from: Identity, to: Identity },
    /// `from` (the acceptor) accepts the request previously sent by `to`
    AcceptRequest { from: Identity, to: Identity },
    /// `from` (the rejecter) declines the request previously sent by `to`
    RejectRequest { from: Identity, to: Identity },
    /// Free-form text for `to`
    Message {
        to: Identity,
        text: String,
        from: Identity,
    },
}

impl ClientEvent {
    /// Human-readable name of the event, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register { .. } => "register",
            ClientEvent::ConnectionRequest { .. } => "connection_request",
            ClientEvent::AcceptRequest { .. } => "accept_request",
            ClientEvent::RejectRequest { .. } => "reject_request",
            ClientEvent::Message { .. } => "message",
        }
    }
}

/// An event delivered by the relay to one recipient identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Someone wants to pair with the recipient
    IncomingRequest { from: Identity },
    /// The recipient's request was accepted by `from`
    #[serde(rename = "requested_accepted")]
    RequestAccepted { from: Identity },
    /// The recipient's request was declined, either by `from` or by the relay
    #[serde(rename = "requested_rejected")]
    RequestRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Identity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Text relayed from `from`
    Message { from: Identity, text: String },
    /// The recipient's request to `to` went unanswered
    RequestExpired { to: Identity },
    /// The recipient's paired session with `peer` is gone
    PairingEnded { peer: Identity },
}

/// Discriminant of a [`RelayEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IncomingRequest,
    RequestAccepted,
    RequestRejected,
    Message,
    RequestExpired,
    PairingEnded,
}

impl EventKind {
    /// Every kind the relay can emit
    pub const ALL: [EventKind; 6] = [
        EventKind::IncomingRequest,
        EventKind::RequestAccepted,
        EventKind::RequestRejected,
        EventKind::Message,
        EventKind::RequestExpired,
        EventKind::PairingEnded,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IncomingRequest => "incoming_request",
            EventKind::RequestAccepted => "requested_accepted",
            EventKind::RequestRejected => "requested_rejected",
            EventKind::Message => "message",
            EventKind::RequestExpired => "request_expired",
            EventKind::PairingEnded => "pairing_ended",
        }
    }
}

impl RelayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RelayEvent::IncomingRequest { .. } => EventKind::IncomingRequest,
            RelayEvent::RequestAccepted { .. } => EventKind::RequestAccepted,
            RelayEvent::RequestRejected { .. } => EventKind::RequestRejected,
            RelayEvent::Message { .. } => EventKind::Message,
            RelayEvent::RequestExpired { .. } => EventKind::RequestExpired,
            RelayEvent::PairingEnded { .. } => EventKind::PairingEnded,
        }
    }

    /// Rejection the relay emits when the requested peer is offline
    pub fn not_online() -> Self {
        RelayEvent::RequestRejected {
            from: None,
            reason: Some(NOT_ONLINE_REASON.to_string()),
        }
    }
}

/// An outbound event addressed to a single identity.
///
/// Several identities may share one transport session; clients keep only the
/// envelopes whose `recipient` is their own identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub recipient: Identity,
    pub event: RelayEvent,
}

impl Envelope {
    pub fn new(recipient: Identity, event: RelayEvent) -> Self {
        Self { recipient, event }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Per-identity channel name, e.g. `incoming_request_5551234567`
    pub fn channel(&self) -> String {
        format!("{}_{}", self.kind().as_str(), self.recipient)
    }
}

/// Protocol codec errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Encode a value as a single JSON text frame
pub fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// Decode a client event from a text frame
pub fn decode_client_event(text: &str) -> Result<ClientEvent, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

/// Decode an envelope from a text frame
pub fn decode_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}
