//! Bounded, deduplicated, ordered view of a room's messages.
//!
//! The canonical state is a sorted `Vec<Message>`; the item sequence handed
//! to the rendering layer (messages interleaved with date separators and an
//! optional read marker) is rebuilt after every mutation, so the separator
//! and marker invariants hold by construction rather than by bookkeeping.

use std::collections::HashMap;

use log::debug;

use crate::types::events::WindowItem;
use crate::types::message::Message;

pub const DEFAULT_WINDOW_MAX_SIZE: usize = 300;

/// Which edge of the window a batch was inserted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertEdge {
    /// Older page: grows the top.
    Head,
    /// Newer page or live arrival: grows the bottom.
    Tail,
}

pub struct MessageWindow {
    msgs: Vec<Message>,
    /// Auxiliary id lookup, pruned together with evictions.
    lookup: HashMap<String, Message>,
    items: Vec<WindowItem>,
    /// Id of the message the read marker sits immediately before.
    read_marker_anchor: Option<String>,
    last_growth: InsertEdge,
    max_size: usize,
}

impl MessageWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            msgs: Vec::new(),
            lookup: HashMap::new(),
            items: Vec::new(),
            read_marker_anchor: None,
            last_growth: InsertEdge::Tail,
            max_size: max_size.max(1),
        }
    }

    /// Current ordered item sequence.
    pub fn items(&self) -> &[WindowItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Messages only, in display order.
    pub fn messages(&self) -> &[Message] {
        &self.msgs
    }

    pub fn message_count(&self) -> usize {
        self.msgs.len()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.lookup.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup.contains_key(id)
    }

    pub fn oldest_id(&self) -> Option<&str> {
        self.msgs.first().map(|m| m.id.as_str())
    }

    pub fn newest_id(&self) -> Option<&str> {
        self.msgs.last().map(|m| m.id.as_str())
    }

    /// Highest server-assigned sequence number in the window.
    pub fn max_seq(&self) -> i64 {
        self.msgs.iter().map(|m| m.seq).max().unwrap_or(0)
    }

    /// Map an item index (as seen by the rendering layer) to an index into
    /// [`Self::messages`].
    pub fn message_index_of_item(&self, item_index: usize) -> Option<usize> {
        let target = self.items.get(item_index)?.as_message()?;
        self.msgs.iter().position(|m| m.id == target.id)
    }

    /// Translate a range of item indices into the corresponding range of
    /// message indices, skipping separators and the read marker.
    pub fn message_range_of_items(&self, items: std::ops::Range<usize>) -> std::ops::Range<usize> {
        let start_item = items.start.min(self.items.len());
        let end_item = items.end.min(self.items.len());
        let before = self.items[..start_item]
            .iter()
            .filter(|i| i.as_message().is_some())
            .count();
        let inside = self.items[start_item..end_item]
            .iter()
            .filter(|i| i.as_message().is_some())
            .count();
        before..before + inside
    }

    /// Insert a batch at one edge, deduplicated by id. The batch is sorted by
    /// `(sent_at, id)` before merging, and the merged sequence keeps global
    /// display order. Returns the number of messages added or replaced.
    pub fn insert(&mut self, batch: Vec<Message>, edge: InsertEdge) -> usize {
        let mut batch = batch;
        batch.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut changed = 0;
        for msg in batch {
            match self.lookup.get(&msg.id) {
                Some(existing) if existing.is_pending_seq() && msg.seq > 0 => {
                    // Authoritative copy replaces a local placeholder.
                    if let Some(slot) = self.msgs.iter_mut().find(|m| m.id == msg.id) {
                        *slot = msg.clone();
                    }
                    self.lookup.insert(msg.id.clone(), msg);
                    changed += 1;
                }
                Some(_) => {
                    debug!("window: dropping duplicate message {}", msg.id);
                }
                None => {
                    self.lookup.insert(msg.id.clone(), msg.clone());
                    self.msgs.push(msg);
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            self.msgs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            self.last_growth = edge;
            self.rebuild_items();
        }
        changed
    }

    /// Evict until the item count fits `max_size`, always removing from the
    /// edge opposite to the last growth edge. Orphaned date separators and
    /// stale lookup entries go with the evicted messages.
    pub fn apply_virtualization(&mut self) -> usize {
        let mut evicted = 0;
        while self.items.len() > self.max_size && !self.msgs.is_empty() {
            let msg = match self.last_growth {
                InsertEdge::Head => self.msgs.pop(),
                InsertEdge::Tail => Some(self.msgs.remove(0)),
            };
            if let Some(msg) = msg {
                self.lookup.remove(&msg.id);
                if self.read_marker_anchor.as_deref() == Some(msg.id.as_str()) {
                    self.read_marker_anchor = None;
                }
                evicted += 1;
            }
            self.rebuild_items();
        }
        if evicted > 0 {
            debug!("window: evicted {evicted} messages, {} items retained", self.items.len());
        }
        evicted
    }

    /// Replace the content of existing items in place, without reordering.
    /// Messages whose id is not in the window are ignored. Returns how many
    /// items were replaced.
    pub fn reload(&mut self, updated: &[Message]) -> usize {
        let mut replaced = 0;
        for msg in updated {
            if let Some(slot) = self.msgs.iter_mut().find(|m| m.id == msg.id) {
                *slot = msg.clone();
                self.lookup.insert(msg.id.clone(), msg.clone());
                replaced += 1;
            }
        }
        if replaced > 0 {
            self.rebuild_items();
        }
        replaced
    }

    /// Flip the deletion flag on the message with `message_id` and on the
    /// reply previews of any message referencing it. The flag never clears.
    /// Returns the ids of every message whose content changed.
    pub fn mark_deleted(&mut self, message_id: &str) -> Vec<String> {
        let mut touched = Vec::new();
        for msg in self.msgs.iter_mut() {
            if msg.id == message_id && !msg.is_deleted {
                msg.is_deleted = true;
                touched.push(msg.id.clone());
            }
            if let Some(preview) = msg.reply_preview.as_mut()
                && preview.message_id == message_id
                && !preview.is_deleted
            {
                preview.is_deleted = true;
                if !touched.contains(&msg.id) {
                    touched.push(msg.id.clone());
                }
            }
        }
        if !touched.is_empty() {
            for id in &touched {
                if let Some(msg) = self.msgs.iter().find(|m| &m.id == id) {
                    self.lookup.insert(id.clone(), msg.clone());
                }
            }
            self.rebuild_items();
        }
        touched
    }

    /// Place the read marker before the first message with a server-assigned
    /// sequence above `last_read_seq`. No-op if everything has been seen.
    pub fn set_read_marker(&mut self, last_read_seq: i64) {
        self.read_marker_anchor = self
            .msgs
            .iter()
            .find(|m| m.seq > last_read_seq && !m.is_pending_seq())
            .map(|m| m.id.clone());
        self.rebuild_items();
    }

    pub fn clear_read_marker(&mut self) {
        if self.read_marker_anchor.take().is_some() {
            self.rebuild_items();
        }
    }

    fn rebuild_items(&mut self) {
        let mut items = Vec::with_capacity(self.msgs.len() + 8);
        let mut current_day = None;
        for msg in &self.msgs {
            if let Some(day) = msg.day()
                && current_day != Some(day)
            {
                items.push(WindowItem::DateSeparator(day));
                current_day = Some(day);
            }
            if self.read_marker_anchor.as_deref() == Some(msg.id.as_str()) {
                items.push(WindowItem::ReadMarker);
            }
            items.push(WindowItem::Message(msg.clone()));
        }
        self.items = items;
    }
}

impl Default for MessageWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MAX_SIZE)
    }
}
