//! In-memory [`ChatStore`] backend, used by tests and by embedders that do
//! not need durable local storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::error::Result;
use crate::store::traits::ChatStore;
use crate::types::message::Message;

type RoomMessages = HashMap<String, Vec<Message>>;

#[derive(Default)]
pub struct MemoryChatStore {
    // Messages per room, kept in ascending display order.
    rooms: RwLock<RoomMessages>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn fetch_recent(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rooms = self.rooms.read().await;
        let Some(msgs) = rooms.get(room_id) else {
            return Ok(Vec::new());
        };
        let start = msgs.len().saturating_sub(limit);
        Ok(msgs[start..].to_vec())
    }

    async fn fetch_older(
        &self,
        room_id: &str,
        before_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let rooms = self.rooms.read().await;
        let Some(msgs) = rooms.get(room_id) else {
            return Ok(Vec::new());
        };
        let Some(pos) = msgs.iter().position(|m| m.id == before_id) else {
            return Ok(Vec::new());
        };
        let start = pos.saturating_sub(limit);
        Ok(msgs[start..pos].to_vec())
    }

    async fn save(&self, messages: &[Message]) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        for msg in messages {
            let room = rooms.entry(msg.room_id.clone()).or_default();
            if let Some(existing) = room.iter_mut().find(|m| m.id == msg.id) {
                let was_deleted = existing.is_deleted;
                *existing = msg.clone();
                // Deletion is one-directional, even across re-saves.
                existing.is_deleted = existing.is_deleted || was_deleted;
            } else {
                room.push(msg.clone());
            }
            room.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        }
        Ok(())
    }

    async fn update_deleted_flags(&self, room_id: &str, ids: &[String]) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        let Some(msgs) = rooms.get_mut(room_id) else {
            return Ok(());
        };
        for msg in msgs.iter_mut() {
            if ids.contains(&msg.id) {
                msg.is_deleted = true;
            }
            if let Some(preview) = msg.reply_preview.as_mut()
                && ids.contains(&preview.message_id)
            {
                preview.is_deleted = true;
            }
        }
        Ok(())
    }

    async fn delete_all(&self, room_id: &str) -> Result<()> {
        self.rooms.write().await.remove(room_id);
        Ok(())
    }
}
