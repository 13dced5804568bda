use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client -> server payloads
// ---------------------------------------------------------------------------

/// First frame on every new socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub access_token: String,
    pub protocol_version: u32,
}

/// Opens a subscription. The request body is opaque to the client core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub request: serde_json::Value,
}

/// Cancels a subscription by its server-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub subscription_id: String,
}

// ---------------------------------------------------------------------------
// Server -> client payloads
// ---------------------------------------------------------------------------

/// Why the server refused an auth frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthRejectReason {
    /// The access token is past its expiry; a refreshed token may succeed.
    TokenExpired,
    /// The token is unknown or malformed.
    InvalidToken,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRejected {
    pub reason: AuthRejectReason,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Acknowledges a subscribe request, carrying the id the server will tag
/// events with on this connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub subscription_id: String,
}

/// A pushed event for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub subscription_id: String,
    pub data: serde_json::Value,
}
