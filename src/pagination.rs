//! Older/newer page loads against the local and remote stores.
//!
//! Each direction carries an in-flight guard plus a trigger de-bounce, so
//! scroll-edge oscillation cannot stack requests. I/O failures are logged
//! and surfaced as an empty page; the caller retries implicitly on the next
//! proximity trigger.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::store::traits::{ChatStore, RemoteStore};
use crate::types::message::Message;

pub const INITIAL_LOCAL_LIMIT: usize = 200;
pub const INITIAL_REMOTE_LIMIT: usize = 300;
pub const PAGE_LIMIT: usize = 100;
/// Minimum item-index distance between two accepted triggers in the same
/// direction.
pub const TRIGGER_DEBOUNCE_DISTANCE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Older,
    Newer,
}

/// Result of the initial room load. Both slices are returned so the caller
/// can seed the window and compute its sync state from either source.
pub struct InitialLoad {
    pub local: Vec<Message>,
    pub remote: Vec<Message>,
}

pub struct PaginationController {
    local: Arc<dyn ChatStore>,
    remote: Arc<dyn RemoteStore>,
    is_loading_older: Arc<AtomicBool>,
    is_loading_newer: Arc<AtomicBool>,
    has_more_older: AtomicBool,
    last_older_trigger: Mutex<Option<usize>>,
    last_newer_trigger: Mutex<Option<usize>>,
}

impl PaginationController {
    pub fn new(local: Arc<dyn ChatStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            remote,
            is_loading_older: Arc::new(AtomicBool::new(false)),
            is_loading_newer: Arc::new(AtomicBool::new(false)),
            has_more_older: AtomicBool::new(true),
            last_older_trigger: Mutex::new(None),
            last_newer_trigger: Mutex::new(None),
        }
    }

    pub fn has_more_older(&self) -> bool {
        self.has_more_older.load(Ordering::SeqCst)
    }

    /// Forget recorded trigger positions. Called after a page has been
    /// applied to the window, since item indices shift under the user.
    pub fn reset_debounce(&self) {
        *self.last_older_trigger.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.last_newer_trigger.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Synchronously claim the in-flight slot for a direction. Returns false
    /// (and loads nothing) when a load is already running or the trigger is
    /// too close to the previous one. On true, the caller must follow up
    /// with the matching `run_*` call, which releases the slot.
    pub fn try_begin(&self, direction: PageDirection, trigger_index: Option<usize>) -> bool {
        let (flag, last) = match direction {
            PageDirection::Older => (&self.is_loading_older, &self.last_older_trigger),
            PageDirection::Newer => (&self.is_loading_newer, &self.last_newer_trigger),
        };
        if flag.swap(true, Ordering::SeqCst) {
            debug!("pagination: {direction:?} load already in flight, ignoring trigger");
            return false;
        }
        if let Some(index) = trigger_index {
            let mut slot = last.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = *slot
                && previous.abs_diff(index) < TRIGGER_DEBOUNCE_DISTANCE
            {
                debug!(
                    "pagination: {direction:?} trigger at index {index} debounced (previous {previous})"
                );
                flag.store(false, Ordering::SeqCst);
                return false;
            }
            *slot = Some(index);
        }
        true
    }

    /// Initial room load: recent local cache plus a reset remote page. The
    /// remote page is persisted locally as a side effect.
    pub async fn load_initial(&self, room_id: &str) -> InitialLoad {
        let local = match self.local.fetch_recent(room_id, INITIAL_LOCAL_LIMIT).await {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("pagination: initial local fetch failed for {room_id}: {e}");
                Vec::new()
            }
        };
        let remote = match self
            .remote
            .fetch_paged(room_id, INITIAL_REMOTE_LIMIT, true)
            .await
        {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("pagination: initial remote fetch failed for {room_id}: {e}");
                Vec::new()
            }
        };
        self.persist(&remote).await;
        debug!(
            "pagination: initial load for {room_id}: {} local, {} remote",
            local.len(),
            remote.len()
        );
        InitialLoad { local, remote }
    }

    /// Load up to [`PAGE_LIMIT`] messages older than `before_id`, local
    /// first, topping up from the remote store. Must only run after a
    /// successful [`Self::try_begin`] for [`PageDirection::Older`].
    pub async fn run_older(&self, room_id: &str, before_id: &str) -> Vec<Message> {
        let flag = self.is_loading_older.clone();
        let _release = scopeguard::guard((), move |_| flag.store(false, Ordering::SeqCst));

        let mut page = match self.local.fetch_older(room_id, before_id, PAGE_LIMIT).await {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("pagination: local older fetch failed for {room_id}: {e}");
                Vec::new()
            }
        };

        if page.len() < PAGE_LIMIT {
            let remainder = PAGE_LIMIT - page.len();
            // Anchor the remote fetch on the oldest message we already have
            // so the two halves do not overlap.
            let anchor = page
                .first()
                .map(|m| m.id.clone())
                .unwrap_or_else(|| before_id.to_string());
            match self.remote.fetch_older(room_id, &anchor, remainder).await {
                Ok(remote_page) => {
                    if remote_page.is_empty() {
                        self.has_more_older.store(false, Ordering::SeqCst);
                        debug!("pagination: reached start of history for {room_id}");
                    } else {
                        self.persist(&remote_page).await;
                        let mut merged = remote_page;
                        merged.extend(page);
                        page = merged;
                    }
                }
                Err(e) => {
                    // has_more_older stays untouched; the next trigger retries.
                    warn!("pagination: remote older fetch failed for {room_id}: {e}");
                }
            }
        }
        page
    }

    /// Load up to [`PAGE_LIMIT`] messages newer than `after_id` from the
    /// remote store (new data always originates remotely). Must only run
    /// after a successful [`Self::try_begin`] for [`PageDirection::Newer`].
    pub async fn run_newer(&self, room_id: &str, after_id: &str) -> Vec<Message> {
        let flag = self.is_loading_newer.clone();
        let _release = scopeguard::guard((), move |_| flag.store(false, Ordering::SeqCst));

        match self.remote.fetch_after(room_id, after_id, PAGE_LIMIT).await {
            Ok(page) => {
                self.persist(&page).await;
                page
            }
            Err(e) => {
                warn!("pagination: remote newer fetch failed for {room_id}: {e}");
                Vec::new()
            }
        }
    }

    async fn persist(&self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        if let Err(e) = self.local.save(messages).await {
            warn!("pagination: persisting {} messages failed: {e}", messages.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::error::{Result, StoreError};
    use crate::store::memory::MemoryChatStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn msg(id: &str, seq: i64, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            seq,
            room_id: "room".to_string(),
            sender_id: "alice".to_string(),
            sender_nickname: "Alice".to_string(),
            sender_avatar: None,
            text: None,
            sent_at: Some(Utc.timestamp_opt(ts, 0).unwrap()),
            attachments: Vec::new(),
            reply_preview: None,
            is_deleted: false,
            is_failed: false,
        }
    }

    /// Remote store serving a fixed history, counting calls per method.
    #[derive(Default)]
    struct ScriptedRemote {
        history: Vec<Message>,
        fail: bool,
        older_calls: AtomicUsize,
        after_calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for ScriptedRemote {
        async fn fetch_paged(
            &self,
            _room_id: &str,
            page_size: usize,
            _reset: bool,
        ) -> Result<Vec<Message>> {
            let start = self.history.len().saturating_sub(page_size);
            Ok(self.history[start..].to_vec())
        }

        async fn fetch_older(
            &self,
            _room_id: &str,
            before_id: &str,
            limit: usize,
        ) -> Result<Vec<Message>> {
            self.older_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Remote("scripted failure".into()));
            }
            let pos = self
                .history
                .iter()
                .position(|m| m.id == before_id)
                .unwrap_or(0);
            let start = pos.saturating_sub(limit);
            Ok(self.history[start..pos].to_vec())
        }

        async fn fetch_after(
            &self,
            _room_id: &str,
            after_id: &str,
            limit: usize,
        ) -> Result<Vec<Message>> {
            self.after_calls.fetch_add(1, Ordering::SeqCst);
            let pos = self
                .history
                .iter()
                .position(|m| m.id == after_id)
                .map(|p| p + 1)
                .unwrap_or(0);
            let end = (pos + limit).min(self.history.len());
            Ok(self.history[pos..end].to_vec())
        }

        async fn fetch_deletion_states(
            &self,
            _room_id: &str,
            _ids: &[String],
        ) -> Result<HashMap<String, bool>> {
            Ok(HashMap::new())
        }

        async fn update_read_position(&self, _: &str, _: &str, _: i64) -> Result<()> {
            Ok(())
        }

        async fn mark_deleted(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn controller(remote: ScriptedRemote) -> (PaginationController, Arc<MemoryChatStore>) {
        let local = Arc::new(MemoryChatStore::new());
        (
            PaginationController::new(local.clone(), Arc::new(remote)),
            local,
        )
    }

    #[tokio::test]
    async fn initial_load_persists_remote_page() {
        let remote = ScriptedRemote {
            history: vec![msg("a", 1, 100), msg("b", 2, 200)],
            ..Default::default()
        };
        let (pc, local) = controller(remote);

        let initial = pc.load_initial("room").await;
        assert!(initial.local.is_empty());
        assert_eq!(initial.remote.len(), 2);
        assert_eq!(local.message_count("room").await, 2);
    }

    #[tokio::test]
    async fn older_tops_up_from_remote_and_persists() {
        let history: Vec<_> = (0..30).map(|i| msg(&format!("m{i}"), i, 100 + i)).collect();
        let (pc, local) = controller(ScriptedRemote {
            history: history.clone(),
            ..Default::default()
        });
        // Local cache only knows the anchor and the five before it.
        local.save(&history[24..30]).await.unwrap();

        assert!(pc.try_begin(PageDirection::Older, None));
        let page = pc.run_older("room", "m29").await;

        assert_eq!(page.len(), 29);
        assert_eq!(page.first().unwrap().id, "m0");
        assert_eq!(page.last().unwrap().id, "m28");
        assert!(pc.has_more_older());
        // Remote portion landed in the local cache.
        assert_eq!(local.message_count("room").await, 30);
    }

    #[tokio::test]
    async fn empty_remote_older_page_ends_history() {
        let (pc, local) = controller(ScriptedRemote::default());
        local.save(&[msg("a", 1, 100), msg("b", 2, 200)]).await.unwrap();

        assert!(pc.try_begin(PageDirection::Older, None));
        let page = pc.run_older("room", "b").await;

        assert_eq!(page.len(), 1);
        assert!(!pc.has_more_older());
    }

    #[tokio::test]
    async fn remote_error_leaves_has_more_untouched() {
        let (pc, _local) = controller(ScriptedRemote {
            fail: true,
            ..Default::default()
        });

        assert!(pc.try_begin(PageDirection::Older, None));
        let page = pc.run_older("room", "missing").await;

        assert!(page.is_empty());
        assert!(pc.has_more_older());

        // Guard released: a later trigger is accepted again.
        assert!(pc.try_begin(PageDirection::Older, None));
    }

    #[tokio::test]
    async fn near_identical_triggers_are_debounced() {
        let history: Vec<_> = (0..10).map(|i| msg(&format!("m{i}"), i, 100 + i)).collect();
        let remote = ScriptedRemote {
            history,
            ..Default::default()
        };
        let (pc, _local) = controller(remote);

        assert!(pc.try_begin(PageDirection::Older, Some(2)));
        let _ = pc.run_older("room", "m9").await;

        // Index 3 is within the distance threshold of the accepted trigger.
        assert!(!pc.try_begin(PageDirection::Older, Some(3)));
        // Far enough away, accepted again.
        assert!(pc.try_begin(PageDirection::Older, Some(9)));
    }

    #[tokio::test]
    async fn in_flight_guard_rejects_reentry() {
        let (pc, _local) = controller(ScriptedRemote::default());
        assert!(pc.try_begin(PageDirection::Newer, None));
        assert!(!pc.try_begin(PageDirection::Newer, None));
        let _ = pc.run_newer("room", "m0").await;
        assert!(pc.try_begin(PageDirection::Newer, None));
    }

    #[tokio::test]
    async fn reset_debounce_opens_a_new_round() {
        let (pc, _local) = controller(ScriptedRemote::default());
        assert!(pc.try_begin(PageDirection::Older, Some(2)));
        let _ = pc.run_older("room", "x").await;

        assert!(!pc.try_begin(PageDirection::Older, Some(3)));
        pc.reset_debounce();
        assert!(pc.try_begin(PageDirection::Older, Some(3)));
    }
}
