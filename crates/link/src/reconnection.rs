//! The connection driver: connect, authenticate, route, reconnect.
//!
//! One driver task per server walks `Connecting → Authenticating → Active →
//! Closing → Closed` and loops back with exponential backoff. Inbound events
//! from every link it opens are funnelled into one channel tagged with the
//! link's epoch; anything tagged with an older epoch is dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_protocol::constants::{
    ERR_SESSION_REVOKED, ERR_TOKEN_EXPIRED, MessageType, PROTOCOL_VERSION,
};
use tether_protocol::envelope::{Message, WireError};
use tether_protocol::messages::{AuthRejectReason, AuthRejected, AuthRequest, EventPayload, SubscribeAck};

use crate::manager::{ConnInner, ConnectionError};
use crate::session::AuthError;
use crate::transport::{LinkEvent, TransportError, TransportLink};
use crate::types::{Backoff, ConnectionState};

const INBOUND_CAPACITY: usize = 256;

/// An inbound event and the epoch of the link it arrived on.
struct Tagged {
    epoch: u64,
    event: LinkEvent,
}

/// How one connection attempt ended.
#[derive(Debug)]
enum Outcome {
    /// Cancelled by `disconnect` or drop.
    Stopped,
    /// Do not retry until restarted.
    Halt(ConnectionError),
    /// Retry after the backoff delay.
    Retry(ConnectionError),
    /// Retry immediately with a refreshed token.
    RetryNow(ConnectionError),
}

/// What to do after routing one Active-state frame.
enum Route {
    Continue,
    End(Outcome),
}

pub(crate) async fn drive(inner: Arc<ConnInner>, cancel: CancellationToken) {
    let (tagged_tx, mut tagged_rx) = mpsc::channel::<Tagged>(INBOUND_CAPACITY);
    let mut backoff = Backoff::new(inner.settings.reconnect.clone());
    let mut auth_retry_used = false;

    loop {
        let epoch = begin_attempt(&inner);
        let outcome = run_attempt(
            &inner,
            epoch,
            &cancel,
            &tagged_tx,
            &mut tagged_rx,
            &mut backoff,
            !auth_retry_used,
        )
        .await;

        match outcome {
            Outcome::Stopped => {
                debug!(server = %inner.server_id, epoch, "driver stopped");
                break;
            }
            Outcome::Halt(err) => {
                warn!(server = %inner.server_id, epoch, error = %err, "connection halted");
                inner.update(|s| {
                    s.state = ConnectionState::Closed;
                    s.halted = true;
                    s.last_error = Some(err);
                });
                break;
            }
            Outcome::RetryNow(err) => {
                info!(server = %inner.server_id, epoch, reason = %err, "retrying with refreshed credentials");
                auth_retry_used = true;
            }
            Outcome::Retry(err) => {
                auth_retry_used = false;
                let delay = backoff.next_delay();
                let failures = backoff.failures();
                match &err {
                    ConnectionError::Timeout(phase) => warn!(
                        server = %inner.server_id,
                        epoch,
                        phase,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "connection attempt timed out"
                    ),
                    _ => warn!(
                        server = %inner.server_id,
                        epoch,
                        error = %err,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "connection attempt failed"
                    ),
                }
                inner.update(|s| {
                    s.state = ConnectionState::Closed;
                    s.failures = failures;
                    s.last_error = Some(err);
                });

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.retry_now.notified() => {
                        debug!(server = %inner.server_id, "retry requested");
                    }
                }
            }
        }
    }
}

fn begin_attempt(inner: &ConnInner) -> u64 {
    let mut epoch = 0;
    inner.update(|s| {
        s.epoch += 1;
        s.state = ConnectionState::Connecting;
        epoch = s.epoch;
    });
    debug!(server = %inner.server_id, epoch, "connecting");
    epoch
}

async fn run_attempt(
    inner: &ConnInner,
    epoch: u64,
    cancel: &CancellationToken,
    tagged_tx: &mpsc::Sender<Tagged>,
    tagged_rx: &mut mpsc::Receiver<Tagged>,
    backoff: &mut Backoff,
    allow_auth_retry: bool,
) -> Outcome {
    let open = tokio::time::timeout(
        inner.settings.connect_timeout,
        inner.transport.open(&inner.endpoint),
    );
    let link = tokio::select! {
        _ = cancel.cancelled() => return Outcome::Stopped,
        result = open => match result {
            Ok(Ok(link)) => link,
            Ok(Err(TransportError::Timeout)) | Err(_) => {
                return Outcome::Retry(ConnectionError::Timeout("connect"));
            }
            Ok(Err(e)) => return Outcome::Retry(ConnectionError::Transient(e.to_string())),
        },
    };

    let TransportLink {
        outbound,
        inbound,
        close,
    } = link;
    tokio::spawn(forward(epoch, inbound, tagged_tx.clone()));

    let outcome = match authenticate(inner, epoch, cancel, &outbound, tagged_rx, allow_auth_retry).await {
        Ok(()) => {
            backoff.reset();
            serve(inner, epoch, cancel, &outbound, tagged_rx).await
        }
        Err(outcome) => outcome,
    };

    // Every exit path kills the link and invalidates its epoch.
    inner.update(|s| s.state = ConnectionState::Closing);
    close.cancel();
    inner.registry.link().clear_if(epoch);
    inner.registry.mark_stale(epoch);
    outcome
}

/// Copies one link's events into the driver's channel, tagged with its epoch.
async fn forward(epoch: u64, mut inbound: mpsc::Receiver<LinkEvent>, tagged_tx: mpsc::Sender<Tagged>) {
    while let Some(event) = inbound.recv().await {
        if tagged_tx.send(Tagged { epoch, event }).await.is_err() {
            break;
        }
    }
}

/// Sends the auth frame and waits for its acknowledgement.
async fn authenticate(
    inner: &ConnInner,
    epoch: u64,
    cancel: &CancellationToken,
    outbound: &mpsc::Sender<Message>,
    tagged_rx: &mut mpsc::Receiver<Tagged>,
    allow_auth_retry: bool,
) -> Result<(), Outcome> {
    inner.update(|s| s.state = ConnectionState::Authenticating);

    let credentials = tokio::select! {
        _ = cancel.cancelled() => return Err(Outcome::Stopped),
        result = inner.session.ensure_valid() => match result {
            Ok(c) => c,
            Err(AuthError::Revoked | AuthError::MissingCredentials) => {
                return Err(Outcome::Halt(ConnectionError::AuthRevoked));
            }
            Err(AuthError::Transient(reason)) => {
                return Err(Outcome::Retry(ConnectionError::Transient(reason)));
            }
        },
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let body = AuthRequest {
        access_token: credentials.access_token,
        protocol_version: PROTOCOL_VERSION,
    };
    let auth = Message::new(&request_id, MessageType::Auth, Some(&body))
        .map_err(|e| Outcome::Retry(ConnectionError::Protocol(e.to_string())))?;
    if outbound.send(auth).await.is_err() {
        return Err(Outcome::Retry(ConnectionError::Transient(
            "link closed before auth".into(),
        )));
    }

    let deadline = Instant::now() + inner.settings.auth_timeout;
    loop {
        let tagged = tokio::select! {
            _ = cancel.cancelled() => return Err(Outcome::Stopped),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Outcome::Retry(ConnectionError::Timeout("auth")));
            }
            tagged = tagged_rx.recv() => match tagged {
                Some(t) => t,
                None => return Err(Outcome::Stopped),
            },
        };
        if tagged.epoch != epoch {
            trace!(server = %inner.server_id, frame_epoch = tagged.epoch, epoch, "dropping stale event");
            continue;
        }

        let msg = match tagged.event {
            LinkEvent::Frame(msg) => msg,
            other => return Err(link_failure(inner, other)),
        };

        if msg.msg_type == MessageType::Ping {
            reply_pong(outbound, &msg);
            continue;
        }
        if msg.id != request_id {
            return Err(Outcome::Retry(ConnectionError::Protocol(format!(
                "unexpected {:?} frame before auth",
                msg.msg_type
            ))));
        }

        return match msg.msg_type {
            MessageType::AuthOk => Ok(()),
            MessageType::AuthRejected => {
                let rejected: AuthRejected = match msg.parse_payload() {
                    Ok(Some(r)) => r,
                    Ok(None) => AuthRejected {
                        reason: AuthRejectReason::Other,
                        message: String::new(),
                    },
                    Err(e) => {
                        return Err(Outcome::Retry(ConnectionError::Protocol(e.to_string())));
                    }
                };
                let expired = matches!(
                    rejected.reason,
                    AuthRejectReason::TokenExpired | AuthRejectReason::InvalidToken
                );
                Err(rejection(inner, expired, rejected.message, allow_auth_retry))
            }
            MessageType::Error => {
                let err = wire_error(&msg);
                if err.code == ERR_SESSION_REVOKED {
                    inner.session.revoke();
                    return Err(Outcome::Halt(ConnectionError::AuthRevoked));
                }
                Err(rejection(
                    inner,
                    err.code == ERR_TOKEN_EXPIRED,
                    err.message,
                    allow_auth_retry,
                ))
            }
            other => Err(Outcome::Retry(ConnectionError::Protocol(format!(
                "unexpected {other:?} reply to auth"
            )))),
        };
    }
}

/// An auth rejection. Expired tokens get one immediate retry with a
/// refreshed credential.
fn rejection(inner: &ConnInner, expired: bool, message: String, allow_retry: bool) -> Outcome {
    let reason = if message.is_empty() {
        if expired { "token expired".to_string() } else { "rejected".to_string() }
    } else {
        message
    };
    if expired {
        inner.session.invalidate_access();
        if allow_retry {
            return Outcome::RetryNow(ConnectionError::AuthRejected(reason));
        }
    }
    Outcome::Retry(ConnectionError::AuthRejected(reason))
}

/// Active: subscriptions are restored, then inbound frames are routed until
/// the link ends. Subscribe frames that did not fit in the outbound queue go
/// out as soon as it has room.
async fn serve(
    inner: &ConnInner,
    epoch: u64,
    cancel: &CancellationToken,
    outbound: &mpsc::Sender<Message>,
    tagged_rx: &mut mpsc::Receiver<Tagged>,
) -> Outcome {
    inner.registry.link().set(epoch, outbound.clone());
    inner.update(|s| {
        s.state = ConnectionState::Active;
        s.failures = 0;
        s.last_error = None;
    });
    let resent = inner.registry.resubscribe_all(epoch);
    info!(server = %inner.server_id, epoch, resent, "connection active");

    loop {
        let unsent = inner.registry.has_unsent();
        let tagged = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Stopped,
            permit = outbound.reserve(), if unsent => {
                let Ok(permit) = permit else {
                    return Outcome::Retry(ConnectionError::Transient("outbound link closed".into()));
                };
                if let Some(frame) = inner.registry.next_unsent() {
                    permit.send(frame);
                }
                continue;
            }
            _ = inner.registry.deferred(), if !unsent => continue,
            tagged = tagged_rx.recv() => match tagged {
                Some(t) => t,
                None => return Outcome::Stopped,
            },
        };
        if tagged.epoch != epoch {
            trace!(server = %inner.server_id, frame_epoch = tagged.epoch, epoch, "dropping stale event");
            continue;
        }
        match tagged.event {
            LinkEvent::Frame(msg) => {
                if let Route::End(outcome) = route(inner, outbound, msg) {
                    return outcome;
                }
            }
            other => return link_failure(inner, other),
        }
    }
}

/// Dispatches one frame received while Active.
fn route(inner: &ConnInner, outbound: &mpsc::Sender<Message>, msg: Message) -> Route {
    match msg.msg_type {
        MessageType::SubscribeAck => match msg.parse_payload::<SubscribeAck>() {
            Ok(Some(ack)) => {
                if !inner.registry.on_ack(&msg.id, ack) {
                    debug!(server = %inner.server_id, id = %msg.id, "ack for unknown request");
                }
                Route::Continue
            }
            Ok(None) => protocol("subscribeAck without payload"),
            Err(e) => protocol(format!("bad subscribeAck: {e}")),
        },
        MessageType::Event => match msg.parse_payload::<EventPayload>() {
            Ok(Some(event)) => {
                inner.registry.on_event(event);
                Route::Continue
            }
            Ok(None) => protocol("event without payload"),
            Err(e) => protocol(format!("bad event: {e}")),
        },
        MessageType::Error => {
            let err = wire_error(&msg);
            if inner.registry.on_reject(&msg.id, &err) {
                return Route::Continue;
            }
            match err.code {
                ERR_SESSION_REVOKED => {
                    inner.session.revoke();
                    Route::End(Outcome::Halt(ConnectionError::AuthRevoked))
                }
                ERR_TOKEN_EXPIRED => {
                    inner.session.invalidate_access();
                    Route::End(Outcome::Retry(ConnectionError::AuthRejected(
                        "access token expired".into(),
                    )))
                }
                code => {
                    warn!(server = %inner.server_id, code, message = %err.message, "server error");
                    Route::Continue
                }
            }
        }
        MessageType::Ping => {
            reply_pong(outbound, &msg);
            Route::Continue
        }
        MessageType::Pong => Route::Continue,
        other => protocol(format!("unexpected {other:?} frame")),
    }
}

fn protocol(reason: impl Into<String>) -> Route {
    Route::End(Outcome::Retry(ConnectionError::Protocol(reason.into())))
}

/// A non-frame link event on the current epoch.
fn link_failure(inner: &ConnInner, event: LinkEvent) -> Outcome {
    match event {
        LinkEvent::Malformed(reason) => Outcome::Retry(ConnectionError::Protocol(reason)),
        LinkEvent::Closed { revoked: true, .. } => {
            inner.session.revoke();
            Outcome::Halt(ConnectionError::AuthRevoked)
        }
        LinkEvent::Closed { reason, .. } => Outcome::Retry(ConnectionError::Transient(reason)),
        LinkEvent::Frame(msg) => Outcome::Retry(ConnectionError::Protocol(format!(
            "unexpected {:?} frame",
            msg.msg_type
        ))),
    }
}

fn wire_error(msg: &Message) -> WireError {
    msg.error.clone().unwrap_or(WireError {
        code: 0,
        message: "error frame without details".into(),
    })
}

fn reply_pong(outbound: &mpsc::Sender<Message>, ping: &Message) {
    match ping.reply::<()>(MessageType::Pong, None) {
        Ok(pong) => {
            if outbound.try_send(pong).is_err() {
                debug!("pong not sent, outbound queue unavailable");
            }
        }
        Err(e) => debug!("failed to encode pong: {e}"),
    }
}
