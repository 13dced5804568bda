//! Connection manager for one server.
//!
//! A single driver task owns the connection state machine; everything else
//! observes it through a `watch` snapshot. `connect` is idempotent: it joins
//! whatever attempt is in flight instead of opening a second socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tether_protocol::constants::{AUTH_TIMEOUT, CONNECT_TIMEOUT};
use tether_protocol::envelope::Message;

use crate::feed::EventFeed;
use crate::session::SessionManager;
use crate::subscription::SubscriptionRegistry;
use crate::transport::{Transport, TransportError};
use crate::types::{ConnectionState, ConnectionStatus, ReconnectConfig};

/// Why a connection is not (or is no longer) Active.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Socket or refresh failure with no permanent implication.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The session is permanently invalid; sign-in required.
    #[error("auth revoked, sign-in required")]
    AuthRevoked,

    #[error("auth rejected: {0}")]
    AuthRejected(String),

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded wait expired. Retried like a transient error.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Stopped by `disconnect`.
    #[error("stopped")]
    Stopped,
}

/// Timeouts and retry policy for one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub reconnect: ReconnectConfig,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            auth_timeout: AUTH_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Incremented on every connect attempt.
    pub epoch: u64,
    /// No driver is running and none will start until `connect`.
    pub halted: bool,
    /// Consecutive failed attempts since the last Active transition.
    pub failures: u32,
    pub last_error: Option<ConnectionError>,
    pub status: ConnectionStatus,
}

/// Collaborators a connection manager is built from.
pub struct ConnectionParts {
    pub server_id: String,
    pub endpoint: String,
    pub transport: Arc<dyn Transport>,
    pub session: Arc<SessionManager>,
    pub registry: Arc<SubscriptionRegistry>,
    pub feed: Option<EventFeed>,
}

pub(crate) struct DriverHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Shared state of one connection, owned by the manager and its driver.
pub(crate) struct ConnInner {
    pub(crate) server_id: String,
    pub(crate) endpoint: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) session: Arc<SessionManager>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) feed: Option<EventFeed>,
    pub(crate) settings: ConnectionSettings,
    pub(crate) snapshot: watch::Sender<ConnectionSnapshot>,
    pub(crate) retry_now: Notify,
    driver: Mutex<Option<DriverHandle>>,
}

impl ConnInner {
    /// Applies `f` to the snapshot, recomputes the status and publishes it
    /// to the feed if it changed.
    pub(crate) fn update(&self, f: impl FnOnce(&mut ConnectionSnapshot)) {
        let threshold = self.settings.reconnect.error_after_failures;
        let mut changed = None;
        self.snapshot.send_modify(|s| {
            let before = s.status.clone();
            f(s);
            s.status = derive_status(s, threshold);
            if s.status != before {
                changed = Some(s.status.clone());
            }
        });
        if let Some(status) = changed {
            debug!(server = %self.server_id, %status, "status changed");
            if let Some(feed) = &self.feed {
                feed.publish_status(&self.server_id, status);
            }
        }
    }

    pub(crate) fn current(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }
}

/// Maps the state machine onto the coarse status shown to users.
pub(crate) fn derive_status(s: &ConnectionSnapshot, error_after_failures: u32) -> ConnectionStatus {
    if s.state == ConnectionState::Active {
        return ConnectionStatus::Active;
    }
    if s.halted {
        return match &s.last_error {
            Some(e @ ConnectionError::AuthRevoked) => ConnectionStatus::Error(e.to_string()),
            _ => ConnectionStatus::Disconnected,
        };
    }
    if s.failures >= error_after_failures.max(1) {
        let reason = s
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "repeated connection failures".into());
        return ConnectionStatus::Error(reason);
    }
    match s.state {
        ConnectionState::Initial => ConnectionStatus::Disconnected,
        _ => ConnectionStatus::Connecting,
    }
}

/// Owns one server's socket lifecycle and reconnect policy.
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
    /// Parent of every driver's cancel token; cancelled on drop.
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(parts: ConnectionParts, settings: ConnectionSettings) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Initial,
            epoch: 0,
            halted: true,
            failures: 0,
            last_error: None,
            status: ConnectionStatus::Disconnected,
        });
        Self {
            inner: Arc::new(ConnInner {
                server_id: parts.server_id,
                endpoint: parts.endpoint,
                transport: parts.transport,
                session: parts.session,
                registry: parts.registry,
                feed: parts.feed,
                settings,
                snapshot,
                retry_now: Notify::new(),
                driver: Mutex::new(None),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Starts the driver if it is not running. Does not wait for the
    /// connection and does not cut a backoff delay short.
    pub async fn start(&self) {
        self.ensure_running(false).await;
    }

    /// Connects, or joins the attempt already in flight, and waits until the
    /// connection is Active or that attempt fails.
    ///
    /// Dropping the returned future only detaches this caller.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let target = self.ensure_running(true).await;
        let mut rx = self.inner.snapshot.subscribe();
        loop {
            {
                let s = rx.borrow_and_update();
                if s.state == ConnectionState::Active && s.epoch >= target {
                    return Ok(());
                }
                if s.halted {
                    return Err(s.last_error.clone().unwrap_or(ConnectionError::Stopped));
                }
                if s.state == ConnectionState::Closed && s.epoch >= target {
                    return Err(s
                        .last_error
                        .clone()
                        .unwrap_or_else(|| ConnectionError::Transient("connect failed".into())));
                }
            }
            rx.changed().await.map_err(|_| ConnectionError::Stopped)?;
        }
    }

    /// Closes the connection and suppresses retries until the next
    /// `connect` or `start`.
    pub async fn disconnect(&self) {
        let handle = self.inner.driver.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
            info!(server = %self.inner.server_id, "disconnected");
        }
        self.inner.update(|s| {
            if s.state != ConnectionState::Initial {
                s.state = ConnectionState::Closed;
            }
            s.halted = true;
            if s.last_error != Some(ConnectionError::AuthRevoked) {
                s.last_error = Some(ConnectionError::Stopped);
            }
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.snapshot.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.snapshot.borrow().status.clone()
    }

    /// Epoch of the most recent connect attempt.
    pub fn epoch(&self) -> u64 {
        self.inner.snapshot.borrow().epoch
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Queues a frame on the Active connection without waiting. Returns the
    /// epoch it was sent on.
    pub fn send_current(&self, message: Message) -> Result<u64, TransportError> {
        self.inner.registry.link().try_send(message)
    }

    /// Returns the epoch the caller should wait for.
    async fn ensure_running(&self, nudge: bool) -> u64 {
        let mut driver = self.inner.driver.lock().await;
        let current = self.inner.current();

        if driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
            return match current.state {
                ConnectionState::Closed if nudge => {
                    debug!(server = %self.inner.server_id, "skipping backoff delay");
                    self.inner.retry_now.notify_one();
                    current.epoch + 1
                }
                ConnectionState::Closed | ConnectionState::Initial => current.epoch + 1,
                _ => current.epoch,
            };
        }

        self.inner.update(|s| {
            s.halted = false;
            s.failures = 0;
            s.last_error = None;
        });
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(crate::reconnection::drive(
            self.inner.clone(),
            cancel.clone(),
        ));
        *driver = Some(DriverHandle { cancel, task });
        info!(server = %self.inner.server_id, endpoint = %self.inner.endpoint, "connection started");
        current.epoch + 1
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
