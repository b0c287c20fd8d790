//! Message synchronization and windowing core for chat room clients.
//!
//! The crate reconciles three message sources for a room (a local persistent
//! cache, a paginated remote store and a real-time push channel) into a
//! bounded, consistently ordered window of display items, while tracking the
//! user's read position and propagating out-of-band deletions.
//!
//! All window state is owned by a single session task spawned by
//! [`session::RoomSessionHandle`];
//! I/O runs on background tasks and results are marshaled back through
//! channels before touching the window.

pub mod config;
pub mod deletion;
pub mod hot_users;
pub mod live_sync;
pub mod media;
pub mod pagination;
pub mod read_position;
pub mod session;
pub mod store;
pub mod types;
pub mod window;

pub use config::SyncConfig;
pub use live_sync::LiveMode;
pub use session::{RoomEntry, RoomSessionHandle, SessionCommand, SessionDeps};
pub use types::events::{SessionEvent, WindowItem};
pub use types::message::{Attachment, AttachmentType, Message, ReplyPreview};
pub use window::{InsertEdge, MessageWindow};
