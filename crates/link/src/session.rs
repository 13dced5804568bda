//! Per-server session: credential validity, single-flight refresh, revocation.
//!
//! The fast path is a read of the cached credential. Only when it is missing
//! its safety margin does a caller enter the refresh path, where the first
//! caller spawns the exchange and every concurrent caller awaits the same
//! shared result. The exchange runs in its own task, so a caller that gives
//! up only detaches itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::TimeDelta;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::credentials::{CredentialStore, Credentials, StoreError};
use crate::refresh::{RefreshError, TokenRefresher};

/// Default slack subtracted from `expires_at` before a credential counts as
/// usable.
pub const DEFAULT_REFRESH_MARGIN: TimeDelta = TimeDelta::seconds(30);

/// Failures surfaced by [`SessionManager::ensure_valid`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The refresh token is permanently invalid; the user must sign in again.
    #[error("session revoked, sign-in required")]
    Revoked,

    /// No credentials have ever been stored for this server.
    #[error("no credentials for server")]
    MissingCredentials,

    /// The refresh exchange failed but may succeed later.
    #[error("transient auth failure: {0}")]
    Transient(String),
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credentials, AuthError>>>;

#[derive(Debug, Default)]
struct SessionState {
    credentials: Option<Credentials>,
    epoch: u64,
    revoked: bool,
    /// Set when the server refused the access token before its expiry.
    access_invalidated: bool,
}

struct InFlight {
    id: u64,
    result: SharedRefresh,
}

enum Joined {
    Ready(Credentials),
    Flight(SharedRefresh),
}

/// Everything the refresh task needs, detached from `&self`.
#[derive(Clone)]
struct Core {
    server_id: Arc<str>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<SessionState>>,
    inflight: Arc<Mutex<Option<InFlight>>>,
}

impl Core {
    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Revokes under an already-held write lock.
    fn revoke_locked(&self, state: &mut SessionState) {
        state.credentials = None;
        state.revoked = true;
        state.access_invalidated = false;
        state.epoch += 1;
        if let Err(e) = self.store.clear(&self.server_id) {
            warn!(server = %self.server_id, error = %e, "failed to clear stored credentials");
        }
    }

    /// Applies a finished exchange that was started against `started_epoch`.
    fn apply(
        &self,
        started_epoch: u64,
        outcome: Result<Credentials, RefreshError>,
    ) -> Result<Credentials, AuthError> {
        let mut state = self.write();

        if state.epoch != started_epoch {
            // Revoked or reloaded while the exchange was in flight.
            debug!(
                server = %self.server_id,
                started_epoch,
                current_epoch = state.epoch,
                "discarding stale refresh result"
            );
            if state.revoked {
                return Err(AuthError::Revoked);
            }
            return match &state.credentials {
                Some(c) if !state.access_invalidated && c.expires_at > self.clock.now() => {
                    Ok(c.clone())
                }
                _ => Err(AuthError::Transient("session changed during refresh".into())),
            };
        }

        match outcome {
            Ok(credentials) => {
                state.credentials = Some(credentials.clone());
                state.access_invalidated = false;
                state.epoch += 1;
                info!(server = %self.server_id, epoch = state.epoch, "session refreshed");
                if let Err(e) = self.store.save(&self.server_id, &credentials) {
                    warn!(server = %self.server_id, error = %e, "failed to persist refreshed credentials");
                }
                if credentials.expires_at <= self.clock.now() {
                    return Err(AuthError::Transient(
                        "refreshed credential is already expired".into(),
                    ));
                }
                Ok(credentials)
            }
            Err(RefreshError::InvalidGrant(reason)) => {
                warn!(server = %self.server_id, %reason, "refresh token rejected, revoking session");
                self.revoke_locked(&mut state);
                Err(AuthError::Revoked)
            }
            Err(RefreshError::Transient(reason)) => {
                warn!(server = %self.server_id, %reason, "transient refresh failure");
                Err(AuthError::Transient(reason))
            }
        }
    }
}

/// Owns one server's credentials.
pub struct SessionManager {
    token_url: String,
    refresher: Arc<dyn TokenRefresher>,
    margin: TimeDelta,
    next_flight: AtomicU64,
    core: Core,
}

impl SessionManager {
    /// Creates a session seeded from whatever the store holds for the server.
    pub fn open(
        server_id: impl Into<String>,
        token_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
        margin: TimeDelta,
    ) -> Result<Self, StoreError> {
        let server_id: Arc<str> = Arc::from(server_id.into());
        let credentials = store.load(&server_id)?;
        debug!(server = %server_id, has_credentials = credentials.is_some(), "session opened");
        Ok(Self {
            token_url: token_url.into(),
            refresher,
            margin,
            next_flight: AtomicU64::new(1),
            core: Core {
                server_id,
                store,
                clock,
                state: Arc::new(RwLock::new(SessionState {
                    credentials,
                    ..SessionState::default()
                })),
                inflight: Arc::new(Mutex::new(None)),
            },
        })
    }

    pub fn server_id(&self) -> &str {
        &self.core.server_id
    }

    /// Incremented by every successful refresh, revoke and reload.
    pub fn epoch(&self) -> u64 {
        self.core.read().epoch
    }

    pub fn is_revoked(&self) -> bool {
        self.core.read().revoked
    }

    /// Returns a credential that is unexpired at return time.
    ///
    /// Concurrent callers that find the credential stale share a single
    /// refresh exchange and all observe its outcome.
    pub async fn ensure_valid(&self) -> Result<Credentials, AuthError> {
        if let Some(credentials) = self.cached()? {
            return Ok(credentials);
        }
        match self.join_or_start_refresh()? {
            Joined::Ready(credentials) => Ok(credentials),
            Joined::Flight(flight) => flight.await,
        }
    }

    /// Invalidates the session: cached and stored credentials are dropped
    /// and every later [`ensure_valid`](Self::ensure_valid) fails with
    /// [`AuthError::Revoked`] until [`reload`](Self::reload).
    pub fn revoke(&self) {
        let mut state = self.core.write();
        self.core.revoke_locked(&mut state);
        info!(server = %self.core.server_id, epoch = state.epoch, "session revoked");
    }

    /// Marks the access token unusable so the next call refreshes it. The
    /// refresh token is kept.
    pub fn invalidate_access(&self) {
        let mut state = self.core.write();
        if state.credentials.is_some() {
            state.access_invalidated = true;
            debug!(server = %self.core.server_id, "access token invalidated");
        }
    }

    /// Re-reads the store, clearing any revoked state. Returns whether
    /// credentials were found.
    pub fn reload(&self) -> Result<bool, StoreError> {
        let credentials = self.core.store.load(&self.core.server_id)?;
        let found = credentials.is_some();
        let mut state = self.core.write();
        state.credentials = credentials;
        state.revoked = false;
        state.access_invalidated = false;
        state.epoch += 1;
        info!(server = %self.core.server_id, found, epoch = state.epoch, "session reloaded");
        Ok(found)
    }

    fn cached(&self) -> Result<Option<Credentials>, AuthError> {
        let state = self.core.read();
        self.usable(&state)
    }

    fn usable(&self, state: &SessionState) -> Result<Option<Credentials>, AuthError> {
        if state.revoked {
            return Err(AuthError::Revoked);
        }
        match &state.credentials {
            Some(c)
                if !state.access_invalidated
                    && c.is_valid_at(self.core.clock.now(), self.margin) =>
            {
                Ok(Some(c.clone()))
            }
            Some(_) => Ok(None),
            None => Err(AuthError::MissingCredentials),
        }
    }

    fn join_or_start_refresh(&self) -> Result<Joined, AuthError> {
        // The slot stays locked until the new flight is stored, so the
        // task's own cleanup can never run before the insert.
        let mut slot = self.core.slot();
        if let Some(flight) = slot.as_ref() {
            debug!(server = %self.core.server_id, "joining in-flight refresh");
            return Ok(Joined::Flight(flight.result.clone()));
        }

        let (refresh_token, started_epoch) = {
            let state = self.core.read();
            // A flight may have finished between the fast path and here.
            if let Some(credentials) = self.usable(&state)? {
                return Ok(Joined::Ready(credentials));
            }
            match &state.credentials {
                Some(c) => (c.refresh_token.clone(), state.epoch),
                None => return Err(AuthError::MissingCredentials),
            }
        };

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let core = self.core.clone();
        let refresher = self.refresher.clone();
        let token_url = self.token_url.clone();

        info!(server = %core.server_id, started_epoch, "starting token refresh");
        let task = tokio::spawn(async move {
            let outcome = refresher
                .refresh(&core.server_id, &token_url, &refresh_token)
                .await;
            let result = core.apply(started_epoch, outcome);
            let mut slot = core.slot();
            if slot.as_ref().is_some_and(|f| f.id == id) {
                *slot = None;
            }
            result
        });

        let result = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(AuthError::Transient(format!("refresh task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            result: result.clone(),
        });
        Ok(Joined::Flight(result))
    }
}
