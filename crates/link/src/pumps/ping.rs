//! WebSocket ping pump: periodic keepalive pings.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use tether_protocol::constants::WS_PING_PERIOD;

/// Sends periodic pings so the peer's read deadline keeps moving.
pub(crate) async fn ping_pump(
    control_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(vec![].into());
                if control_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
