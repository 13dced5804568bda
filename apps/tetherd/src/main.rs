mod inputs;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tether_link::{
    CoordinatorSettings, FeedEntry, FeedRecord, FileCredentialStore, HttpTokenRefresher,
    LinkConfig, Ports, ServerCoordinator, SystemClock, WsTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => tether_link::default_config_path()
            .context("cannot determine the config directory; pass a config path")?,
    };
    let config = LinkConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if config.servers.is_empty() {
        warn!(path = %config_path.display(), "no servers configured");
    }

    let credentials_path = match &config.credentials_path {
        Some(path) => path.clone(),
        None => tether_link::default_credentials_path()
            .context("cannot determine the credentials path; set credentials_path")?,
    };
    let store = FileCredentialStore::open(credentials_path.clone())
        .with_context(|| format!("opening {}", credentials_path.display()))?;

    let clock = Arc::new(SystemClock);
    let ports = Ports {
        transport: Arc::new(WsTransport::new()),
        refresher: Arc::new(HttpTokenRefresher::new(reqwest::Client::new(), clock.clone())),
        store: Arc::new(store),
        clock,
    };
    let coordinator = ServerCoordinator::new(ports, CoordinatorSettings::from_config(&config));

    let printer = tokio::spawn(print_feed(coordinator.feed().subscribe()));

    let mut ticker = tokio::time::interval(config.scheduler_interval());
    info!(
        servers = config.servers.len(),
        interval_secs = config.scheduler_interval().as_secs(),
        "tetherd started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let inputs = inputs::from_env();
                let report = coordinator.run_once(&config.servers, &inputs).await;
                for (server, error) in &report.errors {
                    warn!(server = %server, error = %error, "server unavailable");
                }
                let summary = coordinator.summary();
                debug!(
                    started = ?report.started,
                    stopped = ?report.stopped,
                    active = summary.active,
                    connecting = summary.connecting,
                    errors = summary.error,
                    "scheduler tick"
                );
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                info!("shutting down");
                break;
            }
        }
    }

    coordinator.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_feed(subscription: tether_link::FeedSubscription) {
    for entry in &subscription.history {
        log_entry(entry);
    }
    let mut live = subscription.live;
    loop {
        match live.recv().await {
            Ok(entry) => log_entry(&entry),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "feed printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_entry(entry: &FeedEntry) {
    match &entry.record {
        FeedRecord::Status { server_id, status } => {
            info!(seq = entry.seq, server = %server_id, %status, "status");
        }
        FeedRecord::Delivery {
            server_id,
            handle,
            payload,
        } => {
            info!(seq = entry.seq, server = %server_id, %handle, %payload, "event");
        }
    }
}
