//! Logical subscriptions that survive reconnects.
//!
//! Callers hold a [`SubscriptionHandle`] that never changes. The
//! server-assigned id is per connection and lives only inside the registry:
//! every Active transition re-sends every entry in registration order and
//! waits for a fresh ack.
//!
//! The registry never awaits. Frames go out through [`CurrentLink`] with
//! `try_send`, and deliveries go to unbounded per-subscription sinks, so the
//! connection driver can call in while it owns the read side. Subscribe
//! frames that do not fit in the outbound queue wait in registration order
//! until the driver sees capacity and pulls them with
//! [`SubscriptionRegistry::next_unsent`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use tether_protocol::constants::MessageType;
use tether_protocol::envelope::{Message, WireError};
use tether_protocol::messages::{EventPayload, SubscribeAck, SubscribeRequest, UnsubscribeRequest};

use crate::buffer::RingBuffer;
use crate::feed::EventFeed;
use crate::transport::CurrentLink;

/// Default bound on events held for a subscription awaiting its ack.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Stable caller-facing identity of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionHandle(pub(crate) u64);

impl SubscriptionHandle {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Sent (or waiting to be sent) and not yet acknowledged on the current
    /// connection.
    Pending,
    /// Acknowledged on the current connection.
    Active,
    /// Was Active on a connection that has since died.
    Stale,
}

/// One event payload routed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub handle: SubscriptionHandle,
    pub payload: Value,
}

pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

struct Entry {
    request: Value,
    sink: DeliverySink,
    state: SubscriptionState,
    /// Server-assigned id on the current connection.
    server_sub_id: Option<String>,
    /// Correlation id of the outstanding subscribe frame.
    request_id: Option<String>,
    sent_epoch: Option<u64>,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    entries: BTreeMap<u64, Entry>,
    /// Epoch of the Active connection, if any.
    live_epoch: Option<u64>,
    by_request: HashMap<String, u64>,
    by_server_id: HashMap<String, u64>,
    /// Events for server ids whose ack has not arrived yet.
    orphans: HashMap<String, RingBuffer<Value>>,
    /// Subscribe request ids whose subscription was cancelled before the ack.
    abandoned: HashSet<String>,
    /// Entries owed a subscribe frame on the live connection that did not
    /// fit in the outbound queue.
    unsent: BTreeSet<u64>,
}

/// The set of logically active subscriptions for one server.
pub struct SubscriptionRegistry {
    server_id: String,
    link: CurrentLink,
    feed: Option<EventFeed>,
    buffer_capacity: usize,
    inner: Mutex<Inner>,
    /// Signalled when `subscribe` defers a frame.
    deferred: Notify,
}

impl SubscriptionRegistry {
    pub fn new(
        server_id: impl Into<String>,
        link: CurrentLink,
        feed: Option<EventFeed>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            link,
            feed,
            buffer_capacity: buffer_capacity.max(1),
            inner: Mutex::new(Inner {
                next_handle: 1,
                ..Inner::default()
            }),
            deferred: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The link subscribe frames are sent through.
    pub fn link(&self) -> &CurrentLink {
        &self.link
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Registers a subscription. If a connection is Active the request goes
    /// out immediately, behind any frames already waiting for queue space;
    /// otherwise it waits for the next Active transition.
    pub fn subscribe(&self, request: Value, sink: DeliverySink) -> SubscriptionHandle {
        let mut inner = self.lock();
        let key = inner.next_handle;
        inner.next_handle += 1;
        inner.entries.insert(
            key,
            Entry {
                request,
                sink,
                state: SubscriptionState::Pending,
                server_sub_id: None,
                request_id: None,
                sent_epoch: None,
            },
        );
        let handle = SubscriptionHandle(key);
        debug!(server = %self.server_id, %handle, "subscription registered");

        if inner.live_epoch.is_some()
            && (!inner.unsent.is_empty() || !self.send_subscribe(&mut inner, key))
        {
            inner.unsent.insert(key);
            self.deferred.notify_one();
        }
        handle
    }

    /// Removes a subscription. Returns `false` for unknown handles.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.remove(&handle.0) else {
            return false;
        };
        inner.unsent.remove(&handle.0);

        if let Some(request_id) = entry.request_id {
            inner.by_request.remove(&request_id);
            if inner.live_epoch.is_some() {
                // Ack still in flight; cancel on the server once it lands.
                inner.abandoned.insert(request_id);
            }
        }
        if let Some(sub_id) = entry.server_sub_id {
            inner.by_server_id.remove(&sub_id);
            if entry.state == SubscriptionState::Active {
                self.send_unsubscribe(&sub_id);
            }
        }
        debug!(server = %self.server_id, %handle, "subscription removed");
        true
    }

    /// Re-sends every entry in registration order on the connection that
    /// just became Active. Entries already sent on `epoch` are skipped, and
    /// once the outbound queue fills the rest are left for
    /// [`next_unsent`](Self::next_unsent). Returns the number of subscribe
    /// frames sent.
    pub fn resubscribe_all(&self, epoch: u64) -> usize {
        let mut inner = self.lock();
        inner.live_epoch = Some(epoch);
        inner.unsent.clear();

        let keys: Vec<u64> = inner.entries.keys().copied().collect();
        let mut sent = 0;
        for key in keys {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            if entry.sent_epoch == Some(epoch) {
                continue;
            }
            entry.state = SubscriptionState::Pending;
            entry.server_sub_id = None;
            if inner.unsent.is_empty() && self.send_subscribe(&mut inner, key) {
                sent += 1;
            } else {
                inner.unsent.insert(key);
            }
        }
        debug!(
            server = %self.server_id,
            epoch,
            sent,
            deferred = inner.unsent.len(),
            "resubscribed"
        );
        sent
    }

    /// Whether subscribe frames are waiting for outbound queue space.
    pub fn has_unsent(&self) -> bool {
        !self.lock().unsent.is_empty()
    }

    /// Resolves once `subscribe` has deferred a frame since the last wait.
    pub async fn deferred(&self) {
        self.deferred.notified().await
    }

    /// Takes the oldest deferred subscribe frame and records it as sent on
    /// the live connection. The caller must hold a send permit for that
    /// connection's queue.
    pub fn next_unsent(&self) -> Option<Message> {
        let mut inner = self.lock();
        let epoch = inner.live_epoch?;
        while let Some(key) = inner.unsent.pop_first() {
            let Some(entry) = inner.entries.get(&key) else {
                continue;
            };
            let Some((request_id, message)) = self.subscribe_frame(&entry.request) else {
                continue;
            };
            Self::record_sent(&mut inner, key, request_id, epoch);
            return Some(message);
        }
        None
    }

    /// The connection with `epoch` is dead. Active entries become Stale and
    /// every per-connection mapping is dropped.
    pub fn mark_stale(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.live_epoch.is_some_and(|e| e != epoch) {
            return;
        }
        inner.live_epoch = None;
        inner.by_request.clear();
        inner.by_server_id.clear();
        inner.orphans.clear();
        inner.abandoned.clear();
        inner.unsent.clear();
        for entry in inner.entries.values_mut() {
            if entry.state == SubscriptionState::Active {
                entry.state = SubscriptionState::Stale;
            }
            entry.server_sub_id = None;
            entry.request_id = None;
            entry.sent_epoch = None;
        }
        trace!(server = %self.server_id, epoch, "subscriptions marked stale");
    }

    /// Handles a subscribe ack. Returns `false` if `request_id` is unknown.
    pub fn on_ack(&self, request_id: &str, ack: SubscribeAck) -> bool {
        let mut inner = self.lock();

        if inner.abandoned.remove(request_id) {
            debug!(
                server = %self.server_id,
                sub_id = %ack.subscription_id,
                "ack for cancelled subscription, unsubscribing"
            );
            inner.orphans.remove(&ack.subscription_id);
            self.send_unsubscribe(&ack.subscription_id);
            return true;
        }

        let Some(key) = inner.by_request.remove(request_id) else {
            return false;
        };
        let backlog = inner.orphans.remove(&ack.subscription_id);
        inner
            .by_server_id
            .insert(ack.subscription_id.clone(), key);

        let Some(entry) = inner.entries.get_mut(&key) else {
            return true;
        };
        entry.state = SubscriptionState::Active;
        entry.request_id = None;
        entry.server_sub_id = Some(ack.subscription_id);

        let handle = SubscriptionHandle(key);
        debug!(server = %self.server_id, %handle, "subscription active");

        if let Some(mut backlog) = backlog {
            if backlog.evicted() > 0 {
                warn!(
                    server = %self.server_id,
                    %handle,
                    dropped = backlog.evicted(),
                    "resubscription buffer overflowed, oldest events dropped"
                );
            }
            for payload in backlog.drain() {
                self.deliver(&entry.sink, handle, payload);
            }
        }
        true
    }

    /// Routes an event to its subscription, or holds it until the matching
    /// ack arrives.
    pub fn on_event(&self, event: EventPayload) {
        let mut inner = self.lock();
        if inner.live_epoch.is_none() {
            return;
        }

        if let Some(&key) = inner.by_server_id.get(&event.subscription_id) {
            if let Some(entry) = inner.entries.get(&key) {
                self.deliver(&entry.sink, SubscriptionHandle(key), event.data);
            }
            return;
        }

        // Each outstanding subscribe can produce at most one id we have not
        // seen an ack for yet.
        let capacity = self.buffer_capacity;
        let outstanding = inner.by_request.len() + inner.abandoned.len();
        let known = inner.orphans.contains_key(&event.subscription_id);
        if !known && inner.orphans.len() >= outstanding {
            warn!(
                server = %self.server_id,
                sub_id = %event.subscription_id,
                "event for unknown subscription id, dropping"
            );
            return;
        }
        let backlog = inner
            .orphans
            .entry(event.subscription_id.clone())
            .or_insert_with(|| RingBuffer::new(capacity));
        if backlog.push(event.data).is_some() {
            trace!(server = %self.server_id, sub_id = %event.subscription_id, "buffer full, evicted oldest");
        }
    }

    /// Handles an error reply to a subscribe frame. The entry stays Pending
    /// and is retried on the next Active transition. Returns `false` if
    /// `request_id` is unknown.
    pub fn on_reject(&self, request_id: &str, error: &WireError) -> bool {
        let mut inner = self.lock();
        if inner.abandoned.remove(request_id) {
            return true;
        }
        let Some(key) = inner.by_request.remove(request_id) else {
            return false;
        };
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.request_id = None;
        }
        warn!(
            server = %self.server_id,
            handle = %SubscriptionHandle(key),
            code = error.code,
            message = %error.message,
            "subscribe rejected"
        );
        true
    }

    /// Drops every entry. Sinks are closed as a side effect.
    pub fn teardown(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.entries.len();
        let next_handle = inner.next_handle;
        *inner = Inner {
            next_handle,
            ..Inner::default()
        };
        debug!(server = %self.server_id, count, "registry torn down");
        count
    }

    /// Handles in registration order.
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        self.lock()
            .entries
            .keys()
            .map(|&k| SubscriptionHandle(k))
            .collect()
    }

    pub fn state_of(&self, handle: SubscriptionHandle) -> Option<SubscriptionState> {
        self.lock().entries.get(&handle.0).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Sends the subscribe frame for `key`. On failure the entry stays
    /// Pending and the caller decides whether to queue it.
    fn send_subscribe(&self, inner: &mut Inner, key: u64) -> bool {
        let Some(entry) = inner.entries.get(&key) else {
            return false;
        };
        let Some((request_id, message)) = self.subscribe_frame(&entry.request) else {
            return false;
        };

        match self.link.try_send(message) {
            Ok(epoch) => {
                Self::record_sent(inner, key, request_id, epoch);
                true
            }
            Err(e) => {
                debug!(
                    server = %self.server_id,
                    handle = %SubscriptionHandle(key),
                    error = %e,
                    "subscribe deferred"
                );
                false
            }
        }
    }

    fn subscribe_frame(&self, request: &Value) -> Option<(String, Message)> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let body = SubscribeRequest {
            request: request.clone(),
        };
        match Message::new(&request_id, MessageType::Subscribe, Some(&body)) {
            Ok(m) => Some((request_id, m)),
            Err(e) => {
                warn!(server = %self.server_id, error = %e, "failed to encode subscribe request");
                None
            }
        }
    }

    fn record_sent(inner: &mut Inner, key: u64, request_id: String, epoch: u64) {
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.state = SubscriptionState::Pending;
            entry.request_id = Some(request_id.clone());
            entry.sent_epoch = Some(epoch);
            inner.by_request.insert(request_id, key);
        }
    }

    fn send_unsubscribe(&self, sub_id: &str) {
        let body = UnsubscribeRequest {
            subscription_id: sub_id.to_string(),
        };
        let id = uuid::Uuid::new_v4().to_string();
        let result = Message::new(id, MessageType::Unsubscribe, Some(&body))
            .map_err(|e| e.to_string())
            .and_then(|m| self.link.try_send(m).map_err(|e| e.to_string()));
        if let Err(e) = result {
            debug!(server = %self.server_id, sub_id, error = %e, "best-effort unsubscribe not sent");
        }
    }

    fn deliver(&self, sink: &DeliverySink, handle: SubscriptionHandle, payload: Value) {
        if let Some(feed) = &self.feed {
            feed.publish_delivery(&self.server_id, handle, payload.clone());
        }
        if sink.send(Delivery { handle, payload }).is_err() {
            trace!(server = %self.server_id, %handle, "delivery sink closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Fixture {
        link: CurrentLink,
        registry: SubscriptionRegistry,
    }

    fn fixture(capacity: usize) -> Fixture {
        let link = CurrentLink::new();
        let registry = SubscriptionRegistry::new("srv", link.clone(), None, capacity);
        Fixture { link, registry }
    }

    fn activate(f: &Fixture, epoch: u64) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(64);
        f.link.set(epoch, tx);
        f.registry.resubscribe_all(epoch);
        rx
    }

    fn drain_subscribes(rx: &mut mpsc::Receiver<Message>) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if msg.msg_type == MessageType::Subscribe {
                let body: SubscribeRequest = msg.parse_payload().unwrap().unwrap();
                out.push((msg.id, body.request));
            }
        }
        out
    }

    fn ack(f: &Fixture, request_id: &str, sub_id: &str) {
        assert!(f.registry.on_ack(
            request_id,
            SubscribeAck {
                subscription_id: sub_id.into()
            }
        ));
    }

    fn event(sub_id: &str, n: i64) -> EventPayload {
        EventPayload {
            subscription_id: sub_id.into(),
            data: json!({ "n": n }),
        }
    }

    #[test]
    fn subscribe_while_idle_stays_pending() {
        let f = fixture(8);
        let (sink, _rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({"topic": "a"}), sink);
        assert_eq!(f.registry.state_of(h), Some(SubscriptionState::Pending));
        assert_eq!(h.to_string(), "sub-1");
    }

    #[test]
    fn subscribe_while_active_sends_immediately() {
        let f = fixture(8);
        let mut wire = activate(&f, 1);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({"topic": "a"}), sink);

        let sent = drain_subscribes(&mut wire);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, json!({"topic": "a"}));

        ack(&f, &sent[0].0, "s-1");
        assert_eq!(f.registry.state_of(h), Some(SubscriptionState::Active));

        f.registry.on_event(event("s-1", 1));
        assert_eq!(rx.try_recv().unwrap().payload, json!({"n": 1}));
    }

    #[test]
    fn reconnect_resends_in_registration_order_exactly_once() {
        let f = fixture(8);
        let mut handles = Vec::new();
        let mut sinks = Vec::new();
        for topic in ["a", "b", "c", "d"] {
            let (sink, rx) = mpsc::unbounded_channel();
            handles.push(f.registry.subscribe(json!({ "topic": topic }), sink));
            sinks.push(rx);
        }

        let mut wire = activate(&f, 1);
        let first = drain_subscribes(&mut wire);
        let topics: Vec<_> = first.iter().map(|(_, r)| r["topic"].clone()).collect();
        assert_eq!(topics, vec!["a", "b", "c", "d"]);
        for (i, (req, _)) in first.iter().enumerate() {
            ack(&f, req, &format!("old-{i}"));
        }

        f.link.clear_if(1);
        f.registry.mark_stale(1);
        for h in &handles {
            assert_eq!(f.registry.state_of(*h), Some(SubscriptionState::Stale));
        }

        let mut wire = activate(&f, 2);
        // A second call for the same epoch must not resend.
        assert_eq!(f.registry.resubscribe_all(2), 0);
        let second = drain_subscribes(&mut wire);
        let topics: Vec<_> = second.iter().map(|(_, r)| r["topic"].clone()).collect();
        assert_eq!(topics, vec!["a", "b", "c", "d"]);
        for h in &handles {
            assert_eq!(f.registry.state_of(*h), Some(SubscriptionState::Pending));
        }
    }

    #[test]
    fn events_before_ack_are_buffered_then_delivered_in_order() {
        let f = fixture(8);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({}), sink);
        let mut wire = activate(&f, 1);
        let sent = drain_subscribes(&mut wire);

        f.registry.on_event(event("s-9", 1));
        f.registry.on_event(event("s-9", 2));
        assert!(rx.try_recv().is_err());

        ack(&f, &sent[0].0, "s-9");
        f.registry.on_event(event("s-9", 3));

        let got: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| {
                assert_eq!(d.handle, h);
                d.payload["n"].as_i64().unwrap()
            })
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn buffer_overflow_drops_oldest() {
        let f = fixture(2);
        let (sink, mut rx) = mpsc::unbounded_channel();
        f.registry.subscribe(json!({}), sink);
        let mut wire = activate(&f, 1);
        let sent = drain_subscribes(&mut wire);

        for n in 1..=5 {
            f.registry.on_event(event("s-1", n));
        }
        ack(&f, &sent[0].0, "s-1");

        let got: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| d.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(got, vec![4, 5]);
    }

    #[test]
    fn unsubscribe_active_notifies_server() {
        let f = fixture(8);
        let mut wire = activate(&f, 1);
        let (sink, _rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({}), sink);
        let sent = drain_subscribes(&mut wire);
        ack(&f, &sent[0].0, "s-1");

        assert!(f.registry.unsubscribe(h));
        assert!(!f.registry.unsubscribe(h));
        let msg = wire.try_recv().unwrap();
        assert_eq!(msg.msg_type, MessageType::Unsubscribe);
        let body: UnsubscribeRequest = msg.parse_payload().unwrap().unwrap();
        assert_eq!(body.subscription_id, "s-1");
        assert!(f.registry.is_empty());
    }

    #[test]
    fn late_ack_for_cancelled_subscription_unsubscribes() {
        let f = fixture(8);
        let mut wire = activate(&f, 1);
        let (sink, _rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({}), sink);
        let sent = drain_subscribes(&mut wire);

        f.registry.unsubscribe(h);
        assert!(wire.try_recv().is_err());

        ack(&f, &sent[0].0, "s-late");
        let msg = wire.try_recv().unwrap();
        assert_eq!(msg.msg_type, MessageType::Unsubscribe);
    }

    #[test]
    fn rejected_subscribe_stays_pending_and_retries_next_epoch() {
        let f = fixture(8);
        let (sink, _rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({}), sink);
        let mut wire = activate(&f, 1);
        let sent = drain_subscribes(&mut wire);

        let err = WireError {
            code: 500,
            message: "busy".into(),
        };
        assert!(f.registry.on_reject(&sent[0].0, &err));
        assert_eq!(f.registry.state_of(h), Some(SubscriptionState::Pending));

        f.link.clear_if(1);
        f.registry.mark_stale(1);
        let mut wire = activate(&f, 2);
        assert_eq!(drain_subscribes(&mut wire).len(), 1);
    }

    #[test]
    fn send_failure_leaves_entry_pending() {
        let f = fixture(8);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        f.link.set(1, tx);
        f.registry.resubscribe_all(1);

        let (sink, _rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({}), sink);
        assert_eq!(f.registry.state_of(h), Some(SubscriptionState::Pending));

        f.link.clear_if(1);
        f.registry.mark_stale(1);
        let mut wire = activate(&f, 2);
        assert_eq!(drain_subscribes(&mut wire).len(), 1);
    }

    #[test]
    fn frames_beyond_queue_capacity_go_out_as_space_frees() {
        let f = fixture(8);
        let mut handles = Vec::new();
        for topic in ["a", "b", "c"] {
            let (sink, _rx) = mpsc::unbounded_channel();
            handles.push(f.registry.subscribe(json!({ "topic": topic }), sink));
        }

        let (tx, mut wire) = mpsc::channel(2);
        f.link.set(1, tx);
        assert_eq!(f.registry.resubscribe_all(1), 2);
        assert!(f.registry.has_unsent());

        // Registered while frames are still waiting, so it queues behind them.
        let (sink, _rx) = mpsc::unbounded_channel();
        handles.push(f.registry.subscribe(json!({ "topic": "d" }), sink));

        let mut sent = drain_subscribes(&mut wire);
        while let Some(frame) = f.registry.next_unsent() {
            let body: SubscribeRequest = frame.parse_payload().unwrap().unwrap();
            sent.push((frame.id, body.request));
        }
        assert!(!f.registry.has_unsent());

        let topics: Vec<_> = sent.iter().map(|(_, r)| r["topic"].clone()).collect();
        assert_eq!(topics, vec!["a", "b", "c", "d"]);
        for (i, (req, _)) in sent.iter().enumerate() {
            ack(&f, req, &format!("s-{i}"));
        }
        for h in &handles {
            assert_eq!(f.registry.state_of(*h), Some(SubscriptionState::Active));
        }
        // Already sent on this epoch; nothing goes out twice.
        assert_eq!(f.registry.resubscribe_all(1), 0);
        assert!(wire.try_recv().is_err());
    }

    #[test]
    fn deferred_frames_are_dropped_when_connection_dies() {
        let f = fixture(8);
        for _ in 0..3 {
            let (sink, _rx) = mpsc::unbounded_channel();
            f.registry.subscribe(json!({}), sink);
        }
        let (tx, _wire) = mpsc::channel(1);
        f.link.set(1, tx);
        assert_eq!(f.registry.resubscribe_all(1), 1);
        assert!(f.registry.has_unsent());

        f.link.clear_if(1);
        f.registry.mark_stale(1);
        assert!(!f.registry.has_unsent());
        assert!(f.registry.next_unsent().is_none());
    }

    #[test]
    fn early_events_are_held_for_every_outstanding_subscribe() {
        let f = fixture(4);
        let mut sinks = Vec::new();
        for _ in 0..70 {
            let (sink, rx) = mpsc::unbounded_channel();
            f.registry.subscribe(json!({}), sink);
            sinks.push(rx);
        }
        let (tx, mut wire) = mpsc::channel(128);
        f.link.set(1, tx);
        assert_eq!(f.registry.resubscribe_all(1), 70);
        let sent = drain_subscribes(&mut wire);

        for i in 0..70i64 {
            f.registry.on_event(event(&format!("s-{i}"), i));
        }
        // Nothing outstanding maps to this id.
        f.registry.on_event(event("stray", -1));

        for (i, (req, _)) in sent.iter().enumerate() {
            ack(&f, req, &format!("s-{i}"));
        }
        for (i, rx) in sinks.iter_mut().enumerate() {
            let got = rx.try_recv().unwrap();
            assert_eq!(got.payload["n"], i as i64);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn mark_stale_for_old_epoch_is_ignored() {
        let f = fixture(8);
        let mut wire = activate(&f, 2);
        let (sink, _rx) = mpsc::unbounded_channel();
        let h = f.registry.subscribe(json!({}), sink);
        let sent = drain_subscribes(&mut wire);
        ack(&f, &sent[0].0, "s-1");

        f.registry.mark_stale(1);
        assert_eq!(f.registry.state_of(h), Some(SubscriptionState::Active));
    }

    #[test]
    fn teardown_closes_sinks() {
        let f = fixture(8);
        let (sink, mut rx) = mpsc::unbounded_channel();
        f.registry.subscribe(json!({}), sink);
        assert_eq!(f.registry.teardown(), 1);
        assert!(f.registry.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn deliveries_are_mirrored_to_feed() {
        let link = CurrentLink::new();
        let feed = EventFeed::new(16);
        let registry = SubscriptionRegistry::new("srv", link.clone(), Some(feed.clone()), 8);
        let (tx, mut wire) = mpsc::channel(8);
        link.set(1, tx);
        registry.resubscribe_all(1);

        let (sink, _rx) = mpsc::unbounded_channel();
        let h = registry.subscribe(json!({}), sink);
        let sent = drain_subscribes(&mut wire);
        registry.on_ack(
            &sent[0].0,
            SubscribeAck {
                subscription_id: "s-1".into(),
            },
        );
        registry.on_event(event("s-1", 42));

        let history = feed.subscribe().history;
        assert!(matches!(
            &history[0].record,
            crate::feed::FeedRecord::Delivery { handle, payload, .. }
                if *handle == h && payload["n"] == 42
        ));
    }
}
