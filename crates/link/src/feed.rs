//! Append-only status and delivery feed for UI consumers.
//!
//! Late subscribers get the retained history first, then live records,
//! with no gap or duplicate between the two.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::buffer::RingBuffer;
use crate::subscription::SubscriptionHandle;
use crate::types::ConnectionStatus;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedRecord {
    Status {
        server_id: String,
        status: ConnectionStatus,
    },
    Delivery {
        server_id: String,
        handle: SubscriptionHandle,
        payload: Value,
    },
}

impl FeedRecord {
    pub fn server_id(&self) -> &str {
        match self {
            Self::Status { server_id, .. } | Self::Delivery { server_id, .. } => server_id,
        }
    }
}

/// A record with its position in the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub seq: u64,
    pub record: FeedRecord,
}

/// Replayed history plus the live tail that follows it.
pub struct FeedSubscription {
    pub history: Vec<FeedEntry>,
    pub live: broadcast::Receiver<FeedEntry>,
}

struct FeedInner {
    next_seq: u64,
    history: RingBuffer<FeedEntry>,
}

#[derive(Clone)]
pub struct EventFeed {
    inner: Arc<Mutex<FeedInner>>,
    live: broadcast::Sender<FeedEntry>,
}

impl EventFeed {
    pub fn new(history_capacity: usize) -> Self {
        let (live, _) = broadcast::channel(history_capacity.max(16));
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                next_seq: 1,
                history: RingBuffer::new(history_capacity),
            })),
            live,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record and returns its sequence number.
    pub fn publish(&self, record: FeedRecord) -> u64 {
        let mut inner = self.lock();
        let entry = FeedEntry {
            seq: inner.next_seq,
            record,
        };
        inner.next_seq += 1;
        inner.history.push(entry.clone());
        // No live receivers is fine; history still has it.
        let _ = self.live.send(entry.clone());
        entry.seq
    }

    pub fn publish_status(&self, server_id: &str, status: ConnectionStatus) -> u64 {
        self.publish(FeedRecord::Status {
            server_id: server_id.to_string(),
            status,
        })
    }

    pub fn publish_delivery(
        &self,
        server_id: &str,
        handle: SubscriptionHandle,
        payload: Value,
    ) -> u64 {
        self.publish(FeedRecord::Delivery {
            server_id: server_id.to_string(),
            handle,
            payload,
        })
    }

    pub fn subscribe(&self) -> FeedSubscription {
        let inner = self.lock();
        FeedSubscription {
            history: inner.history.iter().cloned().collect(),
            live: self.live.subscribe(),
        }
    }

    /// Most recent retained status for a server.
    pub fn latest_status(&self, server_id: &str) -> Option<ConnectionStatus> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .rev()
            .find_map(|entry| match &entry.record {
                FeedRecord::Status { server_id: id, status } if id == server_id => {
                    Some(status.clone())
                }
                _ => None,
            })
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let feed = EventFeed::new(8);
        let a = feed.publish_status("a", ConnectionStatus::Connecting);
        let b = feed.publish_status("a", ConnectionStatus::Active);
        assert!(b > a);
    }

    #[tokio::test]
    async fn late_subscriber_replays_then_follows_live() {
        let feed = EventFeed::new(8);
        feed.publish_status("a", ConnectionStatus::Connecting);
        feed.publish_status("a", ConnectionStatus::Active);

        let mut sub = feed.subscribe();
        assert_eq!(sub.history.len(), 2);
        assert_eq!(
            sub.history[1].record,
            FeedRecord::Status {
                server_id: "a".into(),
                status: ConnectionStatus::Active
            }
        );

        feed.publish_delivery("a", SubscriptionHandle(7), serde_json::json!({"n": 1}));
        let live = sub.live.recv().await.unwrap();
        assert_eq!(live.seq, sub.history[1].seq + 1);
        assert!(matches!(live.record, FeedRecord::Delivery { handle, .. } if handle == SubscriptionHandle(7)));
    }

    #[test]
    fn history_is_bounded() {
        let feed = EventFeed::new(2);
        for _ in 0..5 {
            feed.publish_status("a", ConnectionStatus::Connecting);
        }
        let sub = feed.subscribe();
        assert_eq!(sub.history.len(), 2);
        assert_eq!(sub.history[0].seq, 4);
    }

    #[test]
    fn latest_status_per_server() {
        let feed = EventFeed::new(8);
        feed.publish_status("a", ConnectionStatus::Active);
        feed.publish_status("b", ConnectionStatus::Error("down".into()));
        assert_eq!(feed.latest_status("a"), Some(ConnectionStatus::Active));
        assert_eq!(
            feed.latest_status("b"),
            Some(ConnectionStatus::Error("down".into()))
        );
        assert_eq!(feed.latest_status("c"), None);
    }
}
