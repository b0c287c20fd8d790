//! Bounded pool of recently active senders with live profile subscriptions.
//!
//! Keeps nickname/avatar changes flowing for the people actually talking
//! without subscribing to every historical sender. Least-recently-seen
//! entries are evicted (and their subscriptions cancelled) when the pool is
//! full.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::mpsc;

use crate::store::traits::{ProfileService, ProfileUpdate, Subscription};
use crate::types::message::Message;

pub const HOT_USER_CAPACITY: usize = 20;

struct PoolEntry {
    last_seen: DateTime<Utc>,
    subscription: Box<dyn Subscription>,
}

pub struct HotUserPool {
    capacity: usize,
    entries: HashMap<String, PoolEntry>,
    profiles: std::sync::Arc<dyn ProfileService>,
    updates_tx: mpsc::Sender<ProfileUpdate>,
}

impl HotUserPool {
    pub fn new(
        profiles: std::sync::Arc<dyn ProfileService>,
        updates_tx: mpsc::Sender<ProfileUpdate>,
        capacity: usize,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            profiles,
            updates_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, sender_id: &str) -> bool {
        self.entries.contains_key(sender_id)
    }

    /// Fill the pool from an initial load, scanning most-recent-first so the
    /// people speaking now win the slots.
    pub fn seed(&mut self, messages: &[Message]) {
        for msg in messages.iter().rev() {
            if self.entries.len() >= self.capacity {
                break;
            }
            if self.entries.contains_key(&msg.sender_id) {
                continue;
            }
            self.subscribe(&msg.sender_id, msg.sent_at.unwrap_or_else(Utc::now));
        }
        debug!("hot users: seeded {} senders", self.entries.len());
    }

    /// Record activity for a sender: refresh recency if present, otherwise
    /// insert, evicting the least-recently-seen entry when full.
    pub fn touch(&mut self, sender_id: &str, last_seen: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(sender_id) {
            entry.last_seen = last_seen.max(entry.last_seen);
            return;
        }
        if self.entries.len() >= self.capacity {
            let coldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(id, _)| id.clone());
            if let Some(id) = coldest {
                if let Some(mut evicted) = self.entries.remove(&id) {
                    evicted.subscription.cancel();
                }
                debug!("hot users: evicted {id} for {sender_id}");
            }
        }
        self.subscribe(sender_id, last_seen);
    }

    /// Cancel every subscription. Called on room exit.
    pub fn reset(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.subscription.cancel();
        }
    }

    fn subscribe(&mut self, sender_id: &str, last_seen: DateTime<Utc>) {
        let subscription = self
            .profiles
            .subscribe(sender_id, self.updates_tx.clone());
        self.entries.insert(
            sender_id.to_string(),
            PoolEntry {
                last_seen,
                subscription,
            },
        );
    }
}

impl Drop for HotUserPool {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn msg_from(sender: &str, ts: i64) -> Message {
        Message {
            id: format!("{sender}-{ts}"),
            seq: ts,
            room_id: "room".to_string(),
            sender_id: sender.to_string(),
            sender_nickname: sender.to_string(),
            sender_avatar: None,
            text: None,
            sent_at: Some(Utc.timestamp_opt(ts, 0).unwrap()),
            attachments: Vec::new(),
            reply_preview: None,
            is_deleted: false,
            is_failed: false,
        }
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[derive(Default)]
    struct TrackingProfiles {
        active: Arc<Mutex<Vec<String>>>,
    }

    struct TrackingSubscription {
        user_id: String,
        active: Arc<Mutex<Vec<String>>>,
        cancelled: bool,
    }

    impl Subscription for TrackingSubscription {
        fn cancel(&mut self) {
            // Idempotent.
            if !self.cancelled {
                self.cancelled = true;
                self.active.lock().unwrap().retain(|u| u != &self.user_id);
            }
        }
    }

    impl ProfileService for TrackingProfiles {
        fn subscribe(
            &self,
            user_id: &str,
            _updates: mpsc::Sender<ProfileUpdate>,
        ) -> Box<dyn Subscription> {
            self.active.lock().unwrap().push(user_id.to_string());
            Box::new(TrackingSubscription {
                user_id: user_id.to_string(),
                active: self.active.clone(),
                cancelled: false,
            })
        }
    }

    fn pool(capacity: usize) -> (HotUserPool, Arc<Mutex<Vec<String>>>) {
        let profiles = Arc::new(TrackingProfiles::default());
        let active = profiles.active.clone();
        let (tx, _rx) = mpsc::channel(8);
        (HotUserPool::new(profiles, tx, capacity), active)
    }

    #[test]
    fn seed_prefers_most_recent_senders() {
        let (mut pool, active) = pool(2);
        let messages = vec![msg_from("old", 100), msg_from("mid", 200), msg_from("new", 300)];
        pool.seed(&messages);

        assert_eq!(pool.len(), 2);
        assert!(pool.contains("new"));
        assert!(pool.contains("mid"));
        assert!(!pool.contains("old"));
        assert_eq!(active.lock().unwrap().len(), 2);
    }

    #[test]
    fn touch_evicts_least_recently_seen_when_full() {
        let (mut pool, active) = pool(2);
        pool.touch("a", at(100));
        pool.touch("b", at(200));
        pool.touch("c", at(300));

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains("a"));
        assert!(pool.contains("b"));
        assert!(pool.contains("c"));
        // The evicted subscription was cancelled.
        assert!(!active.lock().unwrap().contains(&"a".to_string()));
    }

    #[test]
    fn touch_refreshes_recency_without_resubscribing() {
        let (mut pool, active) = pool(2);
        pool.touch("a", at(100));
        pool.touch("b", at(200));
        // "a" speaks again, so "b" is now the coldest.
        pool.touch("a", at(300));
        pool.touch("c", at(400));

        assert!(pool.contains("a"));
        assert!(!pool.contains("b"));
        assert!(pool.contains("c"));
        assert_eq!(active.lock().unwrap().len(), 2);
    }

    #[test]
    fn reset_cancels_everything() {
        let (mut pool, active) = pool(5);
        pool.touch("a", at(100));
        pool.touch("b", at(200));
        pool.reset();

        assert!(pool.is_empty());
        assert!(active.lock().unwrap().is_empty());
    }
}
