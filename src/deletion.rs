//! Reconciliation of deletion flags between the local cache and the remote
//! authoritative store.
//!
//! Runs once over the initial load and again for every live deletion event.
//! Deletion is one-directional: a flag is only ever flipped false -> true.

use std::sync::Arc;

use log::{debug, warn};

use crate::store::traits::{ChatStore, RemoteStore};
use crate::types::message::Message;

/// Ids per remote deletion-state lookup call.
pub const LOOKUP_CHUNK: usize = 50;
/// Upper bound on locally loaded messages checked at startup.
pub const RECONCILE_LIMIT: usize = 200;

pub struct DeletionReconciler {
    local: Arc<dyn ChatStore>,
    remote: Arc<dyn RemoteStore>,
}

impl DeletionReconciler {
    pub fn new(local: Arc<dyn ChatStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { local, remote }
    }

    /// Diff local deletion flags against the remote store for the given
    /// recently loaded messages. Returns the ids that the remote marks
    /// deleted but the local copies do not yet; persisting the flip (message
    /// plus referencing reply previews) happens on a background task so the
    /// caller is not blocked on storage.
    pub async fn reconcile_on_load(&self, room_id: &str, messages: &[Message]) -> Vec<String> {
        let candidates: Vec<String> = messages
            .iter()
            .filter(|m| !m.is_deleted && !m.is_pending_seq())
            .take(RECONCILE_LIMIT)
            .map(|m| m.id.clone())
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut newly_deleted = Vec::new();
        for chunk in candidates.chunks(LOOKUP_CHUNK) {
            match self.remote.fetch_deletion_states(room_id, chunk).await {
                Ok(states) => {
                    for id in chunk {
                        if states.get(id).copied().unwrap_or(false) {
                            newly_deleted.push(id.clone());
                        }
                    }
                }
                Err(e) => {
                    // Partial reconciliation is fine; the rest catches up on
                    // the next room entry.
                    warn!("deletion: state lookup failed for {room_id}: {e}");
                }
            }
        }

        if !newly_deleted.is_empty() {
            debug!(
                "deletion: {} messages newly deleted remotely in {room_id}",
                newly_deleted.len()
            );
            let local = self.local.clone();
            let room = room_id.to_string();
            let ids = newly_deleted.clone();
            tokio::spawn(async move {
                if let Err(e) = local.update_deleted_flags(&room, &ids).await {
                    warn!("deletion: persisting {} flags failed for {room}: {e}", ids.len());
                }
            });
        }
        newly_deleted
    }

    /// Persist the deletion flag for a single live deletion event. The
    /// caller applies the in-memory propagation through the window.
    pub async fn on_live_deletion(&self, room_id: &str, message_id: &str) {
        let ids = [message_id.to_string()];
        if let Err(e) = self.local.update_deleted_flags(room_id, &ids).await {
            warn!("deletion: persisting live deletion of {message_id} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::error::Result;
    use crate::store::memory::MemoryChatStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn msg(id: &str, seq: i64) -> Message {
        Message {
            id: id.to_string(),
            seq,
            room_id: "room".to_string(),
            sender_id: "alice".to_string(),
            sender_nickname: "Alice".to_string(),
            sender_avatar: None,
            text: None,
            sent_at: Some(Utc.timestamp_opt(seq * 10, 0).unwrap()),
            attachments: Vec::new(),
            reply_preview: None,
            is_deleted: false,
            is_failed: false,
        }
    }

    struct DeletionRemote {
        deleted: HashSet<String>,
        queried: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl RemoteStore for DeletionRemote {
        async fn fetch_paged(&self, _: &str, _: usize, _: bool) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn fetch_older(&self, _: &str, _: &str, _: usize) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn fetch_after(&self, _: &str, _: &str, _: usize) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn fetch_deletion_states(
            &self,
            _: &str,
            ids: &[String],
        ) -> Result<HashMap<String, bool>> {
            self.queried.lock().unwrap().push(ids.len());
            Ok(ids
                .iter()
                .map(|id| (id.clone(), self.deleted.contains(id)))
                .collect())
        }
        async fn update_read_position(&self, _: &str, _: &str, _: i64) -> Result<()> {
            Ok(())
        }
        async fn mark_deleted(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn returns_only_remotely_deleted_and_persists() {
        let local = Arc::new(MemoryChatStore::new());
        let messages: Vec<_> = (0..4).map(|i| msg(&format!("m{i}"), i + 1)).collect();
        local.save(&messages).await.unwrap();

        let remote = Arc::new(DeletionRemote {
            deleted: HashSet::from(["m1".to_string(), "m3".to_string()]),
            queried: Mutex::new(Vec::new()),
        });
        let reconciler = DeletionReconciler::new(local.clone(), remote);

        let newly = reconciler.reconcile_on_load("room", &messages).await;
        assert_eq!(newly, vec!["m1".to_string(), "m3".to_string()]);

        // Background persistence lands in the local store.
        tokio::task::yield_now().await;
        let recent = local.fetch_recent("room", 10).await.unwrap();
        let deleted: Vec<_> = recent.iter().filter(|m| m.is_deleted).map(|m| m.id.as_str()).collect();
        assert_eq!(deleted, vec!["m1", "m3"]);
    }

    #[tokio::test]
    async fn lookups_are_chunked() {
        let local = Arc::new(MemoryChatStore::new());
        let messages: Vec<_> = (0..120).map(|i| msg(&format!("m{i}"), i + 1)).collect();

        let remote = Arc::new(DeletionRemote {
            deleted: HashSet::new(),
            queried: Mutex::new(Vec::new()),
        });
        let reconciler = DeletionReconciler::new(local, remote.clone());

        reconciler.reconcile_on_load("room", &messages).await;
        assert_eq!(*remote.queried.lock().unwrap(), vec![50, 50, 20]);
    }

    #[tokio::test]
    async fn already_deleted_messages_are_not_requeried() {
        let local = Arc::new(MemoryChatStore::new());
        let mut gone = msg("m0", 1);
        gone.is_deleted = true;
        let messages = vec![gone, msg("m1", 2)];

        let remote = Arc::new(DeletionRemote {
            deleted: HashSet::from(["m0".to_string()]),
            queried: Mutex::new(Vec::new()),
        });
        let reconciler = DeletionReconciler::new(local, remote.clone());

        let newly = reconciler.reconcile_on_load("room", &messages).await;
        assert!(newly.is_empty());
        assert_eq!(*remote.queried.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn live_deletion_persists_flag() {
        let local = Arc::new(MemoryChatStore::new());
        local.save(&[msg("m0", 1)]).await.unwrap();

        let remote = Arc::new(DeletionRemote {
            deleted: HashSet::new(),
            queried: Mutex::new(Vec::new()),
        });
        let reconciler = DeletionReconciler::new(local.clone(), remote);

        reconciler.on_live_deletion("room", "m0").await;
        let recent = local.fetch_recent("room", 10).await.unwrap();
        assert!(recent[0].is_deleted);
    }
}
