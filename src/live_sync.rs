//! Catch-up/live gating for real-time arrivals.
//!
//! A client entering a room with a backlog must not interleave live pushes
//! with historical backfill, or the user could see message N+5 before
//! message N. Arrivals are buffered until paged loads have caught the window
//! up to the tail sequence observed at entry time, then drained in order.

use std::collections::HashMap;

use log::{debug, info};
use serde::Serialize;

use crate::types::message::Message;

/// Messages applied to the window per drain chunk, bounding per-frame cost
/// on the rendering side.
pub const DRAIN_CHUNK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveMode {
    CatchingUp,
    Live,
}

pub struct LiveSyncStateMachine {
    /// Tail sequence of the room at entry time. A fixed snapshot, never
    /// re-read during the session.
    entry_tail_seq: i64,
    window_max_seq: i64,
    mode: LiveMode,
    /// Arrivals held back while catching up, deduplicated by id.
    buffer: HashMap<String, Message>,
}

impl LiveSyncStateMachine {
    pub fn new(entry_tail_seq: i64, initial_window_max_seq: i64) -> Self {
        let mode = if initial_window_max_seq >= entry_tail_seq {
            LiveMode::Live
        } else {
            LiveMode::CatchingUp
        };
        info!(
            "live sync: starting {mode:?} (window max {initial_window_max_seq}, entry tail {entry_tail_seq})"
        );
        Self {
            entry_tail_seq,
            window_max_seq: initial_window_max_seq,
            mode,
            buffer: HashMap::new(),
        }
    }

    pub fn mode(&self) -> LiveMode {
        self.mode
    }

    pub fn entry_tail_seq(&self) -> i64 {
        self.entry_tail_seq
    }

    pub fn window_max_seq(&self) -> i64 {
        self.window_max_seq
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Route one arrival from the push channel. Returns the message when it
    /// may be applied to the window immediately; `None` means it was
    /// buffered for a later drain.
    pub fn on_live_message(&mut self, message: Message) -> Option<Message> {
        match self.mode {
            LiveMode::CatchingUp => {
                debug!(
                    "live sync: buffering {} (seq {}) while catching up",
                    message.id, message.seq
                );
                self.buffer.insert(message.id.clone(), message);
                None
            }
            LiveMode::Live => {
                if message.seq > self.window_max_seq {
                    self.window_max_seq = message.seq;
                }
                Some(message)
            }
        }
    }

    /// Account for a successful newer page. When the window has caught up to
    /// the entry tail, transitions to live and returns the buffered arrivals
    /// sorted by `seq` ascending, split into chunks of [`DRAIN_CHUNK`].
    pub fn on_page_applied(&mut self, page_max_seq: i64) -> Option<Vec<Vec<Message>>> {
        if page_max_seq > self.window_max_seq {
            self.window_max_seq = page_max_seq;
        }
        if self.mode == LiveMode::Live || self.window_max_seq < self.entry_tail_seq {
            return None;
        }

        self.mode = LiveMode::Live;
        let mut drained: Vec<Message> = self.buffer.drain().map(|(_, m)| m).collect();
        drained.sort_by(|a, b| (a.seq, a.id.as_str()).cmp(&(b.seq, b.id.as_str())));
        for msg in &drained {
            if msg.seq > self.window_max_seq {
                self.window_max_seq = msg.seq;
            }
        }
        info!(
            "live sync: caught up to tail {}, going live with {} buffered arrivals",
            self.entry_tail_seq,
            drained.len()
        );

        let chunks = drained
            .chunks(DRAIN_CHUNK)
            .map(<[Message]>::to_vec)
            .collect();
        Some(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

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

    #[test]
    fn starts_live_when_window_covers_entry_tail() {
        let sm = LiveSyncStateMachine::new(100, 100);
        assert_eq!(sm.mode(), LiveMode::Live);

        // An empty room is live from the start.
        let sm = LiveSyncStateMachine::new(0, 0);
        assert_eq!(sm.mode(), LiveMode::Live);
    }

    #[test]
    fn buffers_arrivals_while_catching_up() {
        let mut sm = LiveSyncStateMachine::new(100, 80);
        assert_eq!(sm.mode(), LiveMode::CatchingUp);

        assert!(sm.on_live_message(msg("x", 150)).is_none());
        assert_eq!(sm.buffered_len(), 1);
        // Live arrivals never advance the window max while catching up.
        assert_eq!(sm.window_max_seq(), 80);

        // A page short of the tail keeps buffering.
        assert!(sm.on_page_applied(90).is_none());
        assert_eq!(sm.mode(), LiveMode::CatchingUp);

        // Catching up to the tail drains the buffer.
        let chunks = sm.on_page_applied(100).expect("should go live");
        assert_eq!(sm.mode(), LiveMode::Live);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0].id, "x");
        assert_eq!(sm.buffered_len(), 0);
        assert_eq!(sm.window_max_seq(), 150);
    }

    #[test]
    fn buffer_deduplicates_by_id() {
        let mut sm = LiveSyncStateMachine::new(100, 80);
        sm.on_live_message(msg("x", 150));
        sm.on_live_message(msg("x", 150));
        assert_eq!(sm.buffered_len(), 1);
    }

    #[test]
    fn drain_is_seq_ascending_and_chunked() {
        let mut sm = LiveSyncStateMachine::new(10, 5);
        for seq in (11..=55).rev() {
            sm.on_live_message(msg(&format!("m{seq}"), seq));
        }

        let chunks = sm.on_page_applied(10).expect("should go live");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), DRAIN_CHUNK);
        assert_eq!(chunks[1].len(), DRAIN_CHUNK);
        assert_eq!(chunks[2].len(), 5);

        let seqs: Vec<i64> = chunks.iter().flatten().map(|m| m.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        assert_eq!(sm.window_max_seq(), 55);
    }

    #[test]
    fn live_arrivals_apply_immediately_and_advance_max() {
        let mut sm = LiveSyncStateMachine::new(100, 100);
        let applied = sm.on_live_message(msg("n", 101)).expect("applied");
        assert_eq!(applied.seq, 101);
        assert_eq!(sm.window_max_seq(), 101);

        // Out-of-order duplicate delivery does not regress the max.
        sm.on_live_message(msg("old", 90));
        assert_eq!(sm.window_max_seq(), 101);
    }

    #[test]
    fn later_pages_do_not_drain_twice() {
        let mut sm = LiveSyncStateMachine::new(100, 80);
        sm.on_live_message(msg("x", 150));
        assert!(sm.on_page_applied(100).is_some());
        assert!(sm.on_page_applied(120).is_none());
    }
}
