use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A chat message as held by the window and the stores.
///
/// `id` is globally unique within a room. `seq` is the room-scoped,
/// server-assigned, strictly increasing sequence number; locally composed
/// messages carry `seq == 0` until the server assigns the real value, at
/// which point the authoritative copy replaces the placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub seq: i64,
    pub room_id: String,
    pub sender_id: String,
    pub sender_nickname: String,
    pub sender_avatar: Option<String>,
    pub text: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attachments: Vec<Attachment>,
    pub reply_preview: Option<ReplyPreview>,
    pub is_deleted: bool,
    pub is_failed: bool,
}

impl Message {
    /// Display-order key: `(sent_at, id)` ascending, with missing timestamps
    /// sorting first.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (
            self.sent_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            self.id.as_str(),
        )
    }

    /// Calendar day used for date-separator grouping.
    pub fn day(&self) -> Option<NaiveDate> {
        self.sent_at.map(|t| t.date_naive())
    }

    pub fn has_media(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Whether this is a locally composed message still waiting for its
    /// server-assigned sequence number.
    pub fn is_pending_seq(&self) -> bool {
        self.seq == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Intra-message display order.
    pub index: u32,
    pub kind: AttachmentType,
    pub path_thumb: String,
    pub path_original: String,
    pub content_hash: String,
}

/// Denormalized snapshot of a referenced message. `is_deleted` is propagated
/// from the referenced message, never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: String,
    pub sender_display: String,
    pub text: String,
    pub is_deleted: bool,
}
