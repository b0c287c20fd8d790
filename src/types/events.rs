use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::live_sync::LiveMode;
use crate::types::message::Message;

/// One entry in the display window.
///
/// A `DateSeparator` sits immediately before the first message of each
/// distinct calendar day. `ReadMarker` is inserted at most once, before the
/// first message the user had not seen at session start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WindowItem {
    Message(Message),
    DateSeparator(NaiveDate),
    ReadMarker,
}

impl WindowItem {
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            WindowItem::Message(m) => Some(m),
            _ => None,
        }
    }
}

/// Events a room session broadcasts to the rendering layer.
///
/// Snapshots are wrapped in `Arc` so dispatch to multiple subscribers does
/// not clone the item sequence.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The ordered item sequence changed. Carries the complete current
    /// window; diffing against the previous snapshot is the subscriber's
    /// concern.
    WindowChanged { items: Arc<Vec<WindowItem>> },
    /// The session moved between catch-up and live.
    ModeChanged { mode: LiveMode },
}
