use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current wire protocol version sent in the auth frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on waiting for an auth acknowledgement.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on establishing the transport socket.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between WebSocket keepalive pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// A connection with no inbound traffic for this long is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(30);

/// Largest accepted frame.
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Close code sent by the server when the session is permanently invalid.
pub const WS_CLOSE_SESSION_REVOKED: u16 = 4001;

/// Error code: the access token presented is expired.
pub const ERR_TOKEN_EXPIRED: i32 = 401;

/// Error code: the session has been revoked server-side.
pub const ERR_SESSION_REVOKED: i32 = 403;

/// Message types exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    // Client -> server
    Auth,
    Subscribe,
    Unsubscribe,
    Ping,

    // Server -> client
    AuthOk,
    AuthRejected,
    SubscribeAck,
    Event,
    Pong,
    Error,
}

impl MessageType {
    /// Returns `true` for types only a server may send.
    pub fn is_server_originated(&self) -> bool {
        matches!(
            self,
            MessageType::AuthOk
                | MessageType::AuthRejected
                | MessageType::SubscribeAck
                | MessageType::Event
                | MessageType::Pong
                | MessageType::Error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_wire_names() {
        let cases = [
            (MessageType::Auth, "\"auth\""),
            (MessageType::AuthOk, "\"authOk\""),
            (MessageType::AuthRejected, "\"authRejected\""),
            (MessageType::SubscribeAck, "\"subscribeAck\""),
            (MessageType::Event, "\"event\""),
        ];
        for (ty, expected) in cases {
            assert_eq!(serde_json::to_string(&ty).unwrap(), expected);
        }
    }

    #[test]
    fn server_originated_split() {
        assert!(MessageType::Event.is_server_originated());
        assert!(MessageType::SubscribeAck.is_server_originated());
        assert!(!MessageType::Subscribe.is_server_originated());
        assert!(!MessageType::Auth.is_server_originated());
    }

    #[test]
    fn auth_timeout_is_thirty_seconds() {
        assert_eq!(AUTH_TIMEOUT, Duration::from_secs(30));
    }
}
