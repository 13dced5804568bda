//! Persistent, authenticated, subscription-carrying connections to remote
//! servers.
//!
//! Each server gets a triad: a [`SessionManager`] that keeps credentials
//! fresh with single-flight refresh, a [`ConnectionManager`] that owns the
//! socket lifecycle and reconnects with backoff, and a
//! [`SubscriptionRegistry`] that replays subscriptions after every
//! reconnect. [`ServerCoordinator`] runs one triad per configured server.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod feed;
pub mod manager;
pub mod policy;
pub(crate) mod pumps;
pub(crate) mod reconnection;
pub mod refresh;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod types;
pub mod ws_client;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, LinkConfig, ServerConfig, default_config_path};
pub use coordinator::{
    CoordinatorError, CoordinatorSettings, Ports, RunReport, ServerCoordinator, StatusSummary,
};
pub use credentials::{
    CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore, StoreError,
    default_credentials_path,
};
pub use feed::{EventFeed, FeedEntry, FeedRecord, FeedSubscription};
pub use manager::{ConnectionError, ConnectionManager, ConnectionSettings, ConnectionSnapshot};
pub use policy::{PolicyInputs, RunPolicy, should_run};
pub use refresh::{HttpTokenRefresher, RefreshError, TokenRefresher};
pub use session::{AuthError, SessionManager};
pub use subscription::{Delivery, SubscriptionHandle, SubscriptionRegistry, SubscriptionState};
pub use transport::{Transport, TransportError};
pub use types::{ConnectionState, ConnectionStatus, ReconnectConfig};
pub use ws_client::WsTransport;
