use std::time::Duration;

/// Tunables for a room session. [`Default`] matches production values.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Upper bound on window items (messages + separators + read marker).
    pub window_max_size: usize,
    /// Items beyond the visible range on each side that still get media
    /// prefetch.
    pub prefetch_pad: usize,
    /// Read-position updates are suppressed unless the bottom of the visible
    /// range is within this many items of the newest content.
    pub near_bottom_rows: usize,
    /// Delay before an out-of-range media prefetch is actually cancelled,
    /// so fast flicks do not thrash cancel/restart.
    pub cancel_debounce: Duration,
    /// Capacity of the session event broadcast channel.
    pub event_buffer: usize,
    /// Capacity of the session command channel.
    pub command_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_max_size: 300,
            prefetch_pad: 25,
            near_bottom_rows: 3,
            cancel_debounce: Duration::from_millis(200),
            event_buffer: 64,
            command_buffer: 32,
        }
    }
}
