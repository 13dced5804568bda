//! WebSocket write pump: serialises outbound messages.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use tether_protocol::envelope::Message;

/// Writes protocol messages and control frames to the WebSocket.
///
/// Exits when cancelled, when every protocol sender is dropped, or on a
/// write error; in each case it sends a close frame and cancels the link.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut control_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbound_rx.recv() => match msg {
                Some(m) => match serde_json::to_string(&m) {
                    Ok(json) => tungstenite::Message::Text(json.into()),
                    Err(e) => {
                        warn!(id = %m.id, "failed to encode message: {e}");
                        continue;
                    }
                },
                None => break,
            },
            ctl = control_rx.recv() => match ctl {
                Some(c) => c,
                None => continue,
            },
        };

        if let Err(e) = write.send(frame).await {
            error!("WebSocket write error: {e}");
            break;
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
    cancel.cancel();
}
