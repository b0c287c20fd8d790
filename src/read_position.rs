//! Monotonic, throttled write-back of the user's read position.
//!
//! The candidate is always `min(window_max_seq, entry_tail_seq)`: content
//! that arrived purely over the live feed while still catching up was never
//! on screen, so it is not marked read. Writes are fire-and-forget; a failed
//! write is retried naturally because the next call computes the same or a
//! newer candidate.

use std::sync::Arc;

use log::{debug, warn};

use crate::store::traits::RemoteStore;

/// What prompted a read-position update, for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTrigger {
    LiveArrival,
    PageApplied,
    Scroll,
    SessionEnd,
}

pub struct ReadPositionTracker {
    remote: Arc<dyn RemoteStore>,
    room_id: String,
    user_id: String,
    last_sent: i64,
}

impl ReadPositionTracker {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        last_read_seq: i64,
    ) -> Self {
        Self {
            remote,
            room_id: room_id.into(),
            user_id: user_id.into(),
            last_sent: last_read_seq,
        }
    }

    pub fn last_sent(&self) -> i64 {
        self.last_sent
    }

    /// Write `min(window_max_seq, entry_tail_seq)` if it strictly advances
    /// the last sent position. Unless `skip_proximity_check`, the write is
    /// suppressed while the view is not near the newest content. Returns
    /// whether a write was issued.
    pub async fn maybe_update(
        &mut self,
        trigger: ReadTrigger,
        window_max_seq: i64,
        entry_tail_seq: i64,
        near_bottom: bool,
        skip_proximity_check: bool,
    ) -> bool {
        if !near_bottom && !skip_proximity_check {
            debug!("read position: {trigger:?} update suppressed, view not near bottom");
            return false;
        }
        let candidate = window_max_seq.min(entry_tail_seq);
        if candidate <= self.last_sent {
            return false;
        }
        self.write(trigger, candidate).await
    }

    /// Final write at room exit: unconditional on proximity, still
    /// monotonic.
    pub async fn flush_on_exit(&mut self, window_max_seq: i64, entry_tail_seq: i64) -> bool {
        let candidate = window_max_seq.min(entry_tail_seq);
        if candidate <= self.last_sent {
            return false;
        }
        self.write(ReadTrigger::SessionEnd, candidate).await
    }

    async fn write(&mut self, trigger: ReadTrigger, candidate: i64) -> bool {
        match self
            .remote
            .update_read_position(&self.room_id, &self.user_id, candidate)
            .await
        {
            Ok(()) => {
                debug!(
                    "read position: {trigger:?} advanced {} -> {candidate} for {}",
                    self.last_sent, self.room_id
                );
                self.last_sent = candidate;
                true
            }
            Err(e) => {
                // No retry queue; the next call attempts the same or a newer
                // candidate.
                warn!("read position: write of {candidate} failed for {}: {e}", self.room_id);
                false
            }
        }
    }
}
