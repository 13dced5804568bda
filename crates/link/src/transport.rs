//! Transport port: how the connection manager opens a framed duplex link.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use tether_protocol::envelope::Message;

/// What the read side of a link reports.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A well-formed protocol frame.
    Frame(Message),
    /// A frame that could not be decoded.
    Malformed(String),
    /// The link is gone. Always the last event.
    Closed {
        /// The peer closed because the session is permanently invalid.
        revoked: bool,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out")]
    Timeout,

    #[error("link closed")]
    Closed,
}

/// An open link. Dropping `outbound` or cancelling `close` shuts it down.
pub struct TransportLink {
    pub outbound: mpsc::Sender<Message>,
    pub inbound: mpsc::Receiver<LinkEvent>,
    pub close: CancellationToken,
}

pub type OpenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportLink, TransportError>> + Send + 'a>>;

/// Opens links to a server endpoint.
pub trait Transport: Send + Sync {
    fn open<'a>(&'a self, endpoint: &'a str) -> OpenFuture<'a>;
}

/// The sender of the currently Active link, tagged with its epoch.
///
/// Shared between the connection driver, which sets and clears it, and the
/// subscription registry, which sends through it without awaiting.
#[derive(Clone, Default)]
pub struct CurrentLink {
    slot: Arc<Mutex<Option<(u64, mpsc::Sender<Message>)>>>,
}

impl CurrentLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<(u64, mpsc::Sender<Message>)>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, epoch: u64, outbound: mpsc::Sender<Message>) {
        *self.lock() = Some((epoch, outbound));
    }

    /// Clears the slot only if it still holds `epoch`.
    pub(crate) fn clear_if(&self, epoch: u64) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|(e, _)| *e == epoch) {
            *slot = None;
        }
    }

    /// Epoch of the Active link, if any.
    pub fn epoch(&self) -> Option<u64> {
        self.lock().as_ref().map(|(e, _)| *e)
    }

    /// Queues a frame on the Active link and returns the epoch it went out
    /// on.
    pub fn try_send(&self, message: Message) -> Result<u64, TransportError> {
        let slot = self.lock();
        let Some((epoch, tx)) = slot.as_ref() else {
            return Err(TransportError::Closed);
        };
        match tx.try_send(message) {
            Ok(()) => Ok(*epoch),
            Err(TrySendError::Full(_)) => Err(TransportError::Connect("outbound queue full".into())),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}
