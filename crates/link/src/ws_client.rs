//! WebSocket transport.
//!
//! Each link runs three pumps: read (decode, pong deadline, close codes),
//! write (JSON text frames plus control frames) and ping (keepalive).

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_protocol::constants::{CONNECT_TIMEOUT, WS_MAX_MESSAGE_SIZE};
use tether_protocol::envelope::Message;

use crate::transport::{LinkEvent, OpenFuture, Transport, TransportError, TransportLink};

const OUTBOUND_CAPACITY: usize = 256;
const CONTROL_CAPACITY: usize = 16;

/// [`Transport`] over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let connect = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false);
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url, "websocket connected");

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel::<tungstenite::Message>(CONTROL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<LinkEvent>(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(crate::pumps::write::write_pump(
            write,
            outbound_rx,
            control_rx,
            cancel.clone(),
        ));
        tokio::spawn(crate::pumps::read::read_pump(
            read,
            events_tx,
            control_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(crate::pumps::ping::ping_pump(control_tx, cancel.clone()));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: events_rx,
            close: cancel,
        })
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WsTransport {
    fn open<'a>(&'a self, endpoint: &'a str) -> OpenFuture<'a> {
        Box::pin(self.connect(endpoint))
    }
}
