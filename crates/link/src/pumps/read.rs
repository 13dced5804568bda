//! WebSocket read pump: decodes incoming frames into [`LinkEvent`]s.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use tether_protocol::constants::{WS_CLOSE_SESSION_REVOKED, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use tether_protocol::envelope::Message;

use crate::transport::LinkEvent;

/// Reads messages from the WebSocket and forwards them as link events.
///
/// Uses a pong deadline to detect dead connections: if nothing arrives
/// within [`WS_PONG_WAIT`] the connection is considered dead. Always ends
/// by cancelling the link and emitting exactly one [`LinkEvent::Closed`].
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::Sender<LinkEvent>,
    control_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    // Any incoming message (not just Pong) resets the deadline.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    let mut revoked = false;
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "closed locally".to_string(),

            () = &mut pong_deadline => {
                warn!("pong timeout, connection dead");
                break "pong timeout".to_string();
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                let event = decode_text(&text);
                                if events_tx.send(event).await.is_err() {
                                    break "link dropped".to_string();
                                }
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = control_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                let code = frame.as_ref().map(|f| u16::from(f.code));
                                if code == Some(WS_CLOSE_SESSION_REVOKED) {
                                    debug!("server revoked session (close code {WS_CLOSE_SESSION_REVOKED})");
                                    revoked = true;
                                }
                                debug!(?code, "received close frame");
                                break match frame {
                                    Some(f) if !f.reason.is_empty() => f.reason.to_string(),
                                    _ => "closed by server".to_string(),
                                };
                            }
                            _ => {} // Binary: not part of the protocol.
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break format!("read error: {e}");
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break "stream ended".to_string();
                    }
                }
            }
        }
    };

    cancel.cancel();
    let _ = events_tx.send(LinkEvent::Closed { revoked, reason }).await;
}

/// Decodes a text frame.
fn decode_text(text: &str) -> LinkEvent {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes)", text.len());
        return LinkEvent::Malformed(format!("message too large ({} bytes)", text.len()));
    }

    match serde_json::from_str::<Message>(text) {
        Ok(msg) => {
            trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");
            LinkEvent::Frame(msg)
        }
        Err(e) => {
            warn!("failed to parse message: {e}");
            LinkEvent::Malformed(e.to_string())
        }
    }
}
