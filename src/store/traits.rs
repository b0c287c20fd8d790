//! Collaborator contracts consumed by the sync core.
//!
//! Everything the core talks to (the local cache, the remote durable store,
//! the push channel, the media cache and the profile service) sits behind
//! one of these traits so the core stays transport- and storage-agnostic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::store::error::Result;
use crate::types::message::Message;

/// Local persistent message cache.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Up to `limit` most recent messages for the room, ascending display
    /// order.
    async fn fetch_recent(&self, room_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Up to `limit` messages strictly older than `before_id`, ascending
    /// display order.
    async fn fetch_older(&self, room_id: &str, before_id: &str, limit: usize)
    -> Result<Vec<Message>>;

    /// Upsert by message id.
    async fn save(&self, messages: &[Message]) -> Result<()>;

    /// Set `is_deleted` for the given ids and for the reply previews of any
    /// stored message referencing them. Idempotent; never clears the flag.
    async fn update_deleted_flags(&self, room_id: &str, ids: &[String]) -> Result<()>;

    /// Drop every cached message of the room. Used when a non-participant
    /// leaves a preview room.
    async fn delete_all(&self, room_id: &str) -> Result<()>;
}

/// Remote durable message store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Next page of recent messages; `reset` restarts paging from the tail.
    async fn fetch_paged(&self, room_id: &str, page_size: usize, reset: bool)
    -> Result<Vec<Message>>;

    async fn fetch_older(&self, room_id: &str, before_id: &str, limit: usize)
    -> Result<Vec<Message>>;

    /// Messages strictly newer than `after_id`, ascending.
    async fn fetch_after(&self, room_id: &str, after_id: &str, limit: usize)
    -> Result<Vec<Message>>;

    /// Authoritative deletion flags for exactly the given ids.
    async fn fetch_deletion_states(
        &self,
        room_id: &str,
        ids: &[String],
    ) -> Result<HashMap<String, bool>>;

    async fn update_read_position(&self, room_id: &str, user_id: &str, seq: i64) -> Result<()>;

    async fn mark_deleted(&self, room_id: &str, message_id: &str) -> Result<()>;
}

/// Real-time push channel. Both streams are at-least-once; the core
/// deduplicates by message id.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn subscribe(&self, room_id: &str) -> mpsc::Receiver<Message>;
    async fn subscribe_deletions(&self, room_id: &str) -> mpsc::Receiver<String>;
}

/// Retention tier for a populated media entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Short-lived memory cache, for items the user is about to look at.
    Memory,
    /// Disk cache only.
    Disk,
}

/// Media cache / URL-resolve service.
#[async_trait]
pub trait MediaService: Send + Sync {
    /// Resolve a storage path to a fetchable URL. May hit the network; the
    /// core memoizes and single-flights calls per path.
    async fn resolve(&self, storage_path: &str) -> anyhow::Result<String>;

    async fn is_cached(&self, key: &str) -> bool;

    /// Fetch the asset behind `url` into the cache under `key`.
    async fn populate(&self, key: &str, url: &str, tier: CacheTier) -> anyhow::Result<()>;
}

/// Handle for a live profile subscription. `cancel` is idempotent.
pub trait Subscription: Send {
    fn cancel(&mut self);
}

#[derive(Debug, Clone)]
pub struct ProfileUpdate {
    pub user_id: String,
    pub nickname: String,
    pub avatar: Option<String>,
}

/// Live nickname/avatar change feed, one subscription per user.
pub trait ProfileService: Send + Sync {
    /// Start delivering updates for `user_id` into `updates`. The returned
    /// handle stops delivery when cancelled or dropped.
    fn subscribe(&self, user_id: &str, updates: mpsc::Sender<ProfileUpdate>)
    -> Box<dyn Subscription>;
}
