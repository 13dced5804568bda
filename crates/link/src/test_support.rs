//! Scripted transport, refresher and server side for driving the core in
//! tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_protocol::constants::MessageType;
use tether_protocol::envelope::Message;
use tether_protocol::messages::{
    AuthRejectReason, AuthRejected, AuthRequest, EventPayload, SubscribeAck, SubscribeRequest,
};

use crate::clock::{Clock, ManualClock};
use crate::credentials::{Credentials, MemoryCredentialStore};
use crate::feed::EventFeed;
use crate::manager::{ConnectionManager, ConnectionParts, ConnectionSettings};
use crate::refresh::{RefreshError, RefreshFuture, TokenRefresher};
use crate::session::{DEFAULT_REFRESH_MARGIN, SessionManager};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{CurrentLink, LinkEvent, OpenFuture, Transport, TransportError, TransportLink};

const RECV_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_000)
}

/// Refresher that replays queued responses and counts calls.
pub(crate) struct MockRefresher {
    clock: Arc<ManualClock>,
    calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<(String, i64), RefreshError>>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockRefresher {
    pub(crate) fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            calls: AtomicUsize::new(0),
            responses: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Queues a success valid for `expires_in` seconds from when it returns.
    pub(crate) fn push_ok(&self, access_token: &str, expires_in: i64) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok((access_token.to_string(), expires_in)));
    }

    pub(crate) fn push_err(&self, err: RefreshError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    /// Makes every exchange wait until the returned gate is notified.
    pub(crate) fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

impl TokenRefresher for MockRefresher {
    fn refresh<'a>(
        &'a self,
        _server_id: &'a str,
        _token_url: &'a str,
        _refresh_token: &'a str,
    ) -> RefreshFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RefreshError::Transient("no scripted response".into())));
        let gate = self.gate.lock().unwrap().clone();
        let clock = self.clock.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            response.map(|(access, secs)| {
                Credentials::new(
                    access.clone(),
                    format!("refresh-for-{access}"),
                    clock.now() + TimeDelta::seconds(secs),
                )
            })
        })
    }
}

/// The server end of one mock link.
pub(crate) struct ServerSide {
    pub(crate) from_client: mpsc::Receiver<Message>,
    pub(crate) to_client: mpsc::Sender<LinkEvent>,
    pub(crate) close: CancellationToken,
}

impl ServerSide {
    /// Next client frame, skipping pongs.
    pub(crate) async fn recv(&mut self) -> Message {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.from_client.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client link closed");
            if msg.msg_type != MessageType::Pong {
                return msg;
            }
        }
    }

    pub(crate) async fn expect(&mut self, msg_type: MessageType) -> Message {
        let msg = self.recv().await;
        assert_eq!(msg.msg_type, msg_type, "unexpected frame {msg:?}");
        msg
    }

    pub(crate) async fn send(&self, msg: Message) {
        self.to_client
            .send(LinkEvent::Frame(msg))
            .await
            .expect("client stopped reading");
    }

    /// Receives the auth frame and accepts it. Returns the access token.
    pub(crate) async fn accept_auth(&mut self) -> String {
        let auth = self.expect(MessageType::Auth).await;
        let body: AuthRequest = auth.parse_payload().unwrap().unwrap();
        self.send(auth.reply::<()>(MessageType::AuthOk, None).unwrap())
            .await;
        body.access_token
    }

    pub(crate) async fn reject_auth(&mut self, reason: AuthRejectReason) -> String {
        let auth = self.expect(MessageType::Auth).await;
        let body: AuthRequest = auth.parse_payload().unwrap().unwrap();
        let rejected = AuthRejected {
            reason,
            message: String::new(),
        };
        self.send(auth.reply(MessageType::AuthRejected, Some(&rejected)).unwrap())
            .await;
        body.access_token
    }

    /// Receives a subscribe frame. Returns its correlation id and request.
    pub(crate) async fn recv_subscribe(&mut self) -> (String, Value) {
        let msg = self.expect(MessageType::Subscribe).await;
        let body: SubscribeRequest = msg.parse_payload().unwrap().unwrap();
        (msg.id, body.request)
    }

    pub(crate) async fn ack(&self, request_id: &str, subscription_id: &str) {
        let ack = SubscribeAck {
            subscription_id: subscription_id.into(),
        };
        self.send(Message::new(request_id, MessageType::SubscribeAck, Some(&ack)).unwrap())
            .await;
    }

    pub(crate) async fn event(&self, subscription_id: &str, data: Value) {
        let payload = EventPayload {
            subscription_id: subscription_id.into(),
            data,
        };
        let id = uuid::Uuid::new_v4().to_string();
        self.send(Message::new(id, MessageType::Event, Some(&payload)).unwrap())
            .await;
    }

    pub(crate) async fn drop_link(&self, revoked: bool) {
        let _ = self
            .to_client
            .send(LinkEvent::Closed {
                revoked,
                reason: "server closed".into(),
            })
            .await;
    }

    /// Round-trips a ping so everything sent before it has been handled.
    pub(crate) async fn sync(&mut self) {
        let id = uuid::Uuid::new_v4().to_string();
        self.send(Message::new::<()>(id.clone(), MessageType::Ping, None).unwrap())
            .await;
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.from_client.recv())
                .await
                .expect("timed out waiting for pong")
                .expect("client link closed");
            if msg.msg_type == MessageType::Pong && msg.id == id {
                return;
            }
        }
    }

    /// True if the client queued nothing further (pongs ignored).
    pub(crate) fn is_quiet(&mut self) -> bool {
        loop {
            match self.from_client.try_recv() {
                Ok(msg) if msg.msg_type == MessageType::Pong => continue,
                Ok(_) => return false,
                Err(_) => return true,
            }
        }
    }
}

/// Transport whose links terminate in [`ServerSide`] handles.
pub(crate) struct MockTransport {
    fail_next: AtomicUsize,
    opens: Mutex<Vec<Instant>>,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                fail_next: AtomicUsize::new(0),
                opens: Mutex::new(Vec::new()),
                accepted,
            }),
            rx,
        )
    }

    /// Refuses the next `n` opens.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub(crate) fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn open<'a>(&'a self, _endpoint: &'a str) -> OpenFuture<'a> {
        self.opens.lock().unwrap().push(Instant::now());
        let refuse = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if refuse {
                return Err(TransportError::Connect("connection refused".into()));
            }
            let (outbound, from_client) = mpsc::channel(64);
            let (to_client, inbound) = mpsc::channel(64);
            let close = CancellationToken::new();
            let _ = self.accepted.send(ServerSide {
                from_client,
                to_client,
                close: close.clone(),
            });
            Ok(TransportLink {
                outbound,
                inbound,
                close,
            })
        })
    }
}

/// One server's full triad wired to mocks.
pub(crate) struct Harness {
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) refresher: Arc<MockRefresher>,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) accepted: mpsc::UnboundedReceiver<ServerSide>,
    pub(crate) session: Arc<SessionManager>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) feed: EventFeed,
    pub(crate) manager: Arc<ConnectionManager>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_credentials(Some(Credentials::new(
            "initial-access",
            "initial-refresh",
            t0() + TimeDelta::seconds(3600),
        )))
    }

    pub(crate) fn with_credentials(credentials: Option<Credentials>) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let mut store = MemoryCredentialStore::new();
        if let Some(c) = credentials {
            store = store.with("srv", c);
        }
        let refresher = Arc::new(MockRefresher::new(clock.clone()));
        let (transport, accepted) = MockTransport::new();
        let session = Arc::new(
            SessionManager::open(
                "srv",
                "https://auth.example/oauth/token",
                Arc::new(store),
                refresher.clone(),
                clock.clone(),
                DEFAULT_REFRESH_MARGIN,
            )
            .unwrap(),
        );
        let feed = EventFeed::new(256);
        let registry = Arc::new(SubscriptionRegistry::new(
            "srv",
            CurrentLink::new(),
            Some(feed.clone()),
            16,
        ));
        let manager = Arc::new(ConnectionManager::new(
            ConnectionParts {
                server_id: "srv".into(),
                endpoint: "ws://mock".into(),
                transport: transport.clone(),
                session: session.clone(),
                registry: registry.clone(),
                feed: Some(feed.clone()),
            },
            ConnectionSettings::default(),
        ));
        Self {
            clock,
            refresher,
            transport,
            accepted,
            session,
            registry,
            feed,
            manager,
        }
    }

    /// Waits for the driver to open the next link.
    pub(crate) async fn next_server(&mut self) -> ServerSide {
        tokio::time::timeout(RECV_TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a link")
            .expect("transport dropped")
    }

    /// Starts a `connect()` in the background.
    pub(crate) fn spawn_connect(
        &self,
    ) -> tokio::task::JoinHandle<Result<(), crate::manager::ConnectionError>> {
        let manager = self.manager.clone();
        tokio::spawn(async move { manager.connect().await })
    }

    /// Waits until the snapshot satisfies `pred`.
    pub(crate) async fn wait_for(
        &self,
        pred: impl Fn(&crate::manager::ConnectionSnapshot) -> bool,
    ) -> crate::manager::ConnectionSnapshot {
        let mut rx = self.manager.watch_state();
        let snapshot = tokio::time::timeout(RECV_TIMEOUT, rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for state")
            .expect("manager dropped")
            .clone();
        snapshot
    }
}
