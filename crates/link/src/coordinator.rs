//! Multi-server coordination.
//!
//! The coordinator owns one triad (session, connection, subscriptions) per
//! configured server. [`ServerCoordinator::run_once`] is the scheduler entry
//! point: it re-evaluates every server's run policy from scratch and starts
//! or stops triads to match. Servers share nothing but the event feed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::TimeDelta;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{LinkConfig, ServerConfig};
use crate::credentials::{CredentialStore, StoreError};
use crate::feed::{DEFAULT_HISTORY_CAPACITY, EventFeed};
use crate::manager::{ConnectionError, ConnectionManager, ConnectionParts, ConnectionSettings};
use crate::policy::{self, PolicyInputs};
use crate::refresh::TokenRefresher;
use crate::session::{DEFAULT_REFRESH_MARGIN, SessionManager};
use crate::subscription::{
    DEFAULT_BUFFER_CAPACITY, DeliverySink, SubscriptionHandle, SubscriptionRegistry,
    SubscriptionState,
};
use crate::transport::{CurrentLink, Transport};
use crate::types::ConnectionStatus;

/// Errors from coordinator operations addressed to one server.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Adapters shared by every triad.
#[derive(Clone)]
pub struct Ports {
    pub transport: Arc<dyn Transport>,
    pub refresher: Arc<dyn TokenRefresher>,
    pub store: Arc<dyn CredentialStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub connection: ConnectionSettings,
    pub refresh_margin: TimeDelta,
    pub buffer_capacity: usize,
    pub history_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            connection: ConnectionSettings {
                reconnect: config.reconnect_config(),
                ..ConnectionSettings::default()
            },
            refresh_margin: config.refresh_margin(),
            buffer_capacity: config.subscriptions.buffer_capacity,
            history_capacity: config.feed.history_capacity,
        }
    }
}

/// What one [`ServerCoordinator::run_once`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub removed: Vec<String>,
    /// Servers that could not be set up, with the reason.
    pub errors: Vec<(String, String)>,
}

/// Per-status counts across all known servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub total: usize,
    pub active: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub error: usize,
}

struct Triad {
    config: ServerConfig,
    session: Arc<SessionManager>,
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    /// Set by a credential reload; lets a triad halted on revoked auth start
    /// once more.
    reloaded: Arc<AtomicBool>,
}

impl Triad {
    fn with_config(&self, config: ServerConfig) -> Self {
        Self {
            config,
            session: self.session.clone(),
            connection: self.connection.clone(),
            registry: self.registry.clone(),
            reloaded: self.reloaded.clone(),
        }
    }

    /// Halted on revoked or missing credentials and not reloaded since.
    fn needs_login(&self) -> bool {
        let snapshot = self.connection.snapshot();
        snapshot.halted
            && snapshot.last_error == Some(ConnectionError::AuthRevoked)
            && !self.reloaded.load(Ordering::SeqCst)
    }
}

/// Runs one independent triad per configured server.
pub struct ServerCoordinator {
    ports: Ports,
    settings: CoordinatorSettings,
    feed: EventFeed,
    triads: Mutex<HashMap<String, Arc<Triad>>>,
    setup_errors: Mutex<HashMap<String, String>>,
}

impl ServerCoordinator {
    pub fn new(ports: Ports, settings: CoordinatorSettings) -> Self {
        let feed = EventFeed::new(settings.history_capacity);
        Self {
            ports,
            settings,
            feed,
            triads: Mutex::new(HashMap::new()),
            setup_errors: Mutex::new(HashMap::new()),
        }
    }

    fn triads(&self) -> MutexGuard<'_, HashMap<String, Arc<Triad>>> {
        self.triads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn setup_errors(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.setup_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn triad(&self, server_id: &str) -> Result<Arc<Triad>, CoordinatorError> {
        self.triads()
            .get(server_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownServer(server_id.to_string()))
    }

    /// Re-evaluates every server and starts or stops triads to match.
    ///
    /// Never fails: per-server problems are logged and listed in the report.
    pub async fn run_once(&self, servers: &[ServerConfig], inputs: &PolicyInputs) -> RunReport {
        let mut report = RunReport::default();
        let mut to_start = Vec::new();
        let mut to_stop = Vec::new();
        let mut retired = Vec::new();

        {
            let mut triads = self.triads();

            let listed: Vec<&str> = servers.iter().map(|s| s.id.as_str()).collect();
            let gone: Vec<String> = triads
                .keys()
                .filter(|id| !listed.contains(&id.as_str()))
                .cloned()
                .collect();
            for id in gone {
                if let Some(triad) = triads.remove(&id) {
                    to_stop.push((triad, true));
                    report.removed.push(id);
                }
            }
            self.setup_errors()
                .retain(|id, _| listed.contains(&id.as_str()));

            for server in servers {
                let triad = match triads.get(&server.id) {
                    Some(existing) if same_link(&existing.config, server) => {
                        if existing.config != *server {
                            let updated = Arc::new(existing.with_config(server.clone()));
                            triads.insert(server.id.clone(), updated.clone());
                            updated
                        } else {
                            existing.clone()
                        }
                    }
                    existing => {
                        let existing = existing.cloned();
                        let registry = existing.as_ref().map(|t| t.registry.clone());
                        match self.build(server, registry) {
                            Ok(triad) => {
                                if let Some(old) = existing {
                                    retired.push(old.connection.clone());
                                }
                                let triad = Arc::new(triad);
                                triads.insert(server.id.clone(), triad.clone());
                                self.setup_errors().remove(&server.id);
                                triad
                            }
                            Err(e) => {
                                warn!(server = %server.id, error = %e, "failed to set up server");
                                self.setup_errors()
                                    .insert(server.id.clone(), e.to_string());
                                report.errors.push((server.id.clone(), e.to_string()));
                                // The previous triad keeps its subscriptions
                                // and last working configuration.
                                match existing {
                                    Some(old) => old,
                                    None => continue,
                                }
                            }
                        }
                    }
                };

                let decision = policy::evaluate(server, inputs);
                let running = !triad.connection.snapshot().halted;
                if decision.should_run() {
                    if running {
                        continue;
                    }
                    if triad.needs_login() {
                        debug!(server = %server.id, "not starting: credentials revoked");
                        continue;
                    }
                    to_start.push(triad);
                } else if running {
                    debug!(server = %server.id, reason = decision.reason(), "stopping");
                    to_stop.push((triad, false));
                }
            }
        }

        // Old connections of rebuilt triads must be gone before their
        // registries are handed to the replacements.
        join_all(retired.iter().map(|c| c.disconnect())).await;

        join_all(to_stop.iter().map(|(t, _)| t.connection.disconnect())).await;
        for (triad, removed) in to_stop {
            if removed {
                let closed = triad.registry.teardown();
                info!(server = %triad.config.id, subscriptions = closed, "server removed");
            } else {
                report.stopped.push(triad.config.id.clone());
            }
        }

        for triad in to_start {
            triad.reloaded.store(false, Ordering::SeqCst);
            triad.connection.start().await;
            report.started.push(triad.config.id.clone());
        }

        debug!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            removed = report.removed.len(),
            errors = report.errors.len(),
            "run complete"
        );
        report
    }

    fn build(
        &self,
        server: &ServerConfig,
        registry: Option<Arc<SubscriptionRegistry>>,
    ) -> Result<Triad, StoreError> {
        let session = Arc::new(SessionManager::open(
            server.id.clone(),
            server.token_url(),
            self.ports.store.clone(),
            self.ports.refresher.clone(),
            self.ports.clock.clone(),
            self.settings.refresh_margin,
        )?);
        let registry = registry.unwrap_or_else(|| {
            Arc::new(SubscriptionRegistry::new(
                server.id.clone(),
                CurrentLink::new(),
                Some(self.feed.clone()),
                self.settings.buffer_capacity,
            ))
        });
        let connection = Arc::new(ConnectionManager::new(
            ConnectionParts {
                server_id: server.id.clone(),
                endpoint: server.endpoint.clone(),
                transport: self.ports.transport.clone(),
                session: session.clone(),
                registry: registry.clone(),
                feed: Some(self.feed.clone()),
            },
            self.settings.connection.clone(),
        ));
        debug!(server = %server.id, endpoint = %server.endpoint, "triad created");
        Ok(Triad {
            config: server.clone(),
            session,
            connection,
            registry,
            reloaded: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Status of one server. A failed setup reads as an error even while an
    /// older triad for the server is still running. Unknown servers read as
    /// disconnected.
    pub fn status(&self, server_id: &str) -> ConnectionStatus {
        if let Some(reason) = self.setup_errors().get(server_id) {
            return ConnectionStatus::Error(reason.clone());
        }
        match self.triads().get(server_id) {
            Some(triad) => triad.connection.status(),
            None => ConnectionStatus::Disconnected,
        }
    }

    /// Status of every known server, by id.
    pub fn statuses(&self) -> BTreeMap<String, ConnectionStatus> {
        let mut out: BTreeMap<String, ConnectionStatus> = self
            .triads()
            .iter()
            .map(|(id, triad)| (id.clone(), triad.connection.status()))
            .collect();
        for (id, reason) in self.setup_errors().iter() {
            out.insert(id.clone(), ConnectionStatus::Error(reason.clone()));
        }
        out
    }

    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for status in self.statuses().values() {
            summary.total += 1;
            match status {
                ConnectionStatus::Active => summary.active += 1,
                ConnectionStatus::Connecting => summary.connecting += 1,
                ConnectionStatus::Disconnected => summary.disconnected += 1,
                ConnectionStatus::Error(_) => summary.error += 1,
            }
        }
        summary
    }

    /// Registers a subscription with a known server. It survives stops,
    /// restarts and reconnects until unsubscribed or the server is removed.
    pub fn subscribe(
        &self,
        server_id: &str,
        request: Value,
        sink: DeliverySink,
    ) -> Result<SubscriptionHandle, CoordinatorError> {
        Ok(self.triad(server_id)?.registry.subscribe(request, sink))
    }

    pub fn unsubscribe(
        &self,
        server_id: &str,
        handle: SubscriptionHandle,
    ) -> Result<bool, CoordinatorError> {
        Ok(self.triad(server_id)?.registry.unsubscribe(handle))
    }

    pub fn subscription_state(
        &self,
        server_id: &str,
        handle: SubscriptionHandle,
    ) -> Option<SubscriptionState> {
        self.triads()
            .get(server_id)
            .and_then(|t| t.registry.state_of(handle))
    }

    /// Connects a known server now, regardless of policy, and waits for the
    /// outcome.
    pub async fn connect(&self, server_id: &str) -> Result<(), CoordinatorError> {
        let triad = self.triad(server_id)?;
        triad.connection.connect().await?;
        Ok(())
    }

    /// Re-reads a server's credentials after an external login. The next
    /// [`run_once`](Self::run_once) may start it again. Returns whether
    /// credentials were found.
    pub fn reload_credentials(&self, server_id: &str) -> Result<bool, CoordinatorError> {
        let triad = self.triad(server_id)?;
        let found = triad.session.reload()?;
        triad.reloaded.store(true, Ordering::SeqCst);
        Ok(found)
    }

    /// The shared status and delivery feed.
    pub fn feed(&self) -> &EventFeed {
        &self.feed
    }

    /// Stops every triad and drops all subscriptions.
    pub async fn shutdown(&self) {
        let triads: Vec<Arc<Triad>> = self.triads().drain().map(|(_, t)| t).collect();
        join_all(triads.iter().map(|t| t.connection.disconnect())).await;
        for triad in &triads {
            triad.registry.teardown();
        }
        info!(servers = triads.len(), "coordinator shut down");
    }
}

/// True if two configs can share one session and connection.
fn same_link(a: &ServerConfig, b: &ServerConfig) -> bool {
    a.endpoint == b.endpoint && a.token_url() == b.token_url()
}
