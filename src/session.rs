//! Per-room session actor.
//!
//! One task owns the window and all sync state; commands from the UI layer,
//! push-channel events and background load completions are marshaled into it
//! over channels, so window mutations never need a lock. Subscribers receive
//! full ordered snapshots over a broadcast channel and diff as they see fit.

use std::ops::Range;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::deletion::DeletionReconciler;
use crate::hot_users::{HOT_USER_CAPACITY, HotUserPool};
use crate::live_sync::LiveSyncStateMachine;
use crate::media::MediaPrefetchScheduler;
use crate::pagination::{PageDirection, PaginationController};
use crate::read_position::{ReadPositionTracker, ReadTrigger};
use crate::store::traits::{
    ChatStore, LiveChannel, MediaService, ProfileService, ProfileUpdate, RemoteStore,
};
use crate::types::events::SessionEvent;
use crate::types::message::Message;
use crate::window::{InsertEdge, MessageWindow};

/// Snapshot of the room taken by the caller at entry time.
#[derive(Debug, Clone)]
pub struct RoomEntry {
    pub room_id: String,
    pub user_id: String,
    /// Authoritative tail sequence at entry; never re-read mid-session.
    pub tail_seq: i64,
    /// Last persisted read position, used to place the read marker and as
    /// the monotonic floor for read-position writes.
    pub last_read_seq: i64,
    /// Non-participants previewing a room get their local cache dropped on
    /// exit.
    pub is_participant: bool,
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub local: Arc<dyn ChatStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub live: Arc<dyn LiveChannel>,
    pub media: Arc<dyn MediaService>,
    pub profiles: Arc<dyn ProfileService>,
}

/// Imperative entry points exposed to the UI layer.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    ScrollNearTop { trigger_index: usize },
    ScrollNearBottom { trigger_index: usize },
    VisibleRangeChanged { start: usize, end: usize },
    OpenViewer { item_index: usize },
    DeleteRequested { message_id: String },
    Exit,
}

/// Completions of background page loads, marshaled back into the actor.
enum Internal {
    OlderLoaded(Vec<Message>),
    NewerLoaded(Vec<Message>),
}

pub struct RoomSessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    task: JoinHandle<()>,
}

impl RoomSessionHandle {
    /// Enter a room: spawns the session task, which performs the initial
    /// local+remote load and then serves commands until [`Self::exit`].
    pub fn spawn(entry: RoomEntry, deps: SessionDeps, config: SyncConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let event_tx = events.clone();
        let task = tokio::spawn(async move {
            run_session(entry, deps, config, command_rx, event_tx).await;
        });
        Self {
            commands,
            events,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, command: SessionCommand) {
        if self.commands.send(command).await.is_err() {
            warn!("session: command dropped, session task is gone");
        }
    }

    pub async fn scroll_near_top(&self, trigger_index: usize) {
        self.send(SessionCommand::ScrollNearTop { trigger_index }).await;
    }

    pub async fn scroll_near_bottom(&self, trigger_index: usize) {
        self.send(SessionCommand::ScrollNearBottom { trigger_index }).await;
    }

    pub async fn visible_range_changed(&self, start: usize, end: usize) {
        self.send(SessionCommand::VisibleRangeChanged { start, end }).await;
    }

    pub async fn open_viewer(&self, item_index: usize) {
        self.send(SessionCommand::OpenViewer { item_index }).await;
    }

    pub async fn delete_requested(&self, message_id: impl Into<String>) {
        self.send(SessionCommand::DeleteRequested {
            message_id: message_id.into(),
        })
        .await;
    }

    /// Leave the room: final read-position write, subscription teardown,
    /// preview-cache cleanup. Resolves when the session task has finished.
    pub async fn exit(self) {
        self.send(SessionCommand::Exit).await;
        if let Err(e) = self.task.await {
            warn!("session: task join failed: {e}");
        }
    }
}

struct Session {
    entry: RoomEntry,
    config: SyncConfig,
    local: Arc<dyn ChatStore>,
    remote: Arc<dyn RemoteStore>,
    window: MessageWindow,
    pagination: Arc<PaginationController>,
    live_sync: LiveSyncStateMachine,
    tracker: ReadPositionTracker,
    reconciler: DeletionReconciler,
    prefetch: Arc<MediaPrefetchScheduler>,
    pool: HotUserPool,
    visible: Option<Range<usize>>,
    events: broadcast::Sender<SessionEvent>,
    internal_tx: mpsc::Sender<Internal>,
}

async fn run_session(
    entry: RoomEntry,
    deps: SessionDeps,
    config: SyncConfig,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
) {
    let room_id = entry.room_id.clone();
    info!("session: entering room {room_id}");

    let mut live_rx = deps.live.subscribe(&room_id).await;
    let mut deletions_rx = deps.live.subscribe_deletions(&room_id).await;
    let (profile_tx, mut profile_rx) = mpsc::channel::<ProfileUpdate>(32);
    let (internal_tx, mut internal_rx) = mpsc::channel::<Internal>(8);

    let pagination = Arc::new(PaginationController::new(
        deps.local.clone(),
        deps.remote.clone(),
    ));
    let prefetch = Arc::new(MediaPrefetchScheduler::new(
        deps.media.clone(),
        config.prefetch_pad,
        config.cancel_debounce,
    ));

    // Initial load seeds the window before any live event is applied.
    let initial = pagination.load_initial(&room_id).await;
    let mut window = MessageWindow::new(config.window_max_size);
    window.insert(initial.local, InsertEdge::Tail);
    window.insert(initial.remote, InsertEdge::Tail);
    window.apply_virtualization();
    window.set_read_marker(entry.last_read_seq);

    let live_sync = LiveSyncStateMachine::new(entry.tail_seq, window.max_seq());
    let tracker = ReadPositionTracker::new(
        deps.remote.clone(),
        room_id.clone(),
        entry.user_id.clone(),
        entry.last_read_seq,
    );
    let reconciler = DeletionReconciler::new(deps.local.clone(), deps.remote.clone());
    let mut pool = HotUserPool::new(deps.profiles.clone(), profile_tx, HOT_USER_CAPACITY);
    pool.seed(window.messages());

    let mut session = Session {
        entry,
        config,
        local: deps.local,
        remote: deps.remote,
        window,
        pagination,
        live_sync,
        tracker,
        reconciler,
        prefetch,
        pool,
        visible: None,
        events,
        internal_tx,
    };

    // Reconcile deletion flags that changed while the room was closed.
    let newly_deleted = session
        .reconciler
        .reconcile_on_load(&room_id, session.window.messages())
        .await;
    for id in &newly_deleted {
        session.window.mark_deleted(id);
    }

    session.emit_mode();
    session.emit_window();

    let mut live_open = true;
    let mut deletions_open = true;
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SessionCommand::Exit) | None => break,
                Some(cmd) => session.handle_command(cmd).await,
            },
            Some(internal) = internal_rx.recv() => {
                session.handle_internal(internal).await;
            }
            msg = live_rx.recv(), if live_open => match msg {
                Some(msg) => session.handle_live_message(msg).await,
                None => {
                    warn!("session: live message stream for {room_id} closed");
                    live_open = false;
                }
            },
            deleted = deletions_rx.recv(), if deletions_open => match deleted {
                Some(message_id) => session.handle_live_deletion(&message_id).await,
                None => {
                    warn!("session: live deletion stream for {room_id} closed");
                    deletions_open = false;
                }
            },
            Some(update) = profile_rx.recv() => {
                session.handle_profile_update(update);
            }
        }
    }

    session.shutdown().await;
    info!("session: left room {room_id}");
}

impl Session {
    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ScrollNearTop { trigger_index } => {
                self.begin_older_load(trigger_index);
            }
            SessionCommand::ScrollNearBottom { trigger_index } => {
                self.begin_newer_load(trigger_index);
                let near_bottom = self.near_bottom();
                self.tracker
                    .maybe_update(
                        ReadTrigger::Scroll,
                        self.live_sync.window_max_seq(),
                        self.live_sync.entry_tail_seq(),
                        near_bottom,
                        false,
                    )
                    .await;
            }
            SessionCommand::VisibleRangeChanged { start, end } => {
                self.visible = Some(start..end);
                let msg_range = self.window.message_range_of_items(start..end);
                self.prefetch
                    .update_visible_range(self.window.messages(), msg_range);
                let near_bottom = self.near_bottom();
                self.tracker
                    .maybe_update(
                        ReadTrigger::Scroll,
                        self.live_sync.window_max_seq(),
                        self.live_sync.entry_tail_seq(),
                        near_bottom,
                        false,
                    )
                    .await;
            }
            SessionCommand::OpenViewer { item_index } => {
                if let Some(index) = self.window.message_index_of_item(item_index) {
                    self.prefetch.prioritize_viewer(self.window.messages(), index);
                }
            }
            SessionCommand::DeleteRequested { message_id } => {
                if let Err(e) = self
                    .remote
                    .mark_deleted(&self.entry.room_id, &message_id)
                    .await
                {
                    warn!("session: remote delete of {message_id} failed: {e}");
                    return;
                }
                self.reconciler
                    .on_live_deletion(&self.entry.room_id, &message_id)
                    .await;
                if !self.window.mark_deleted(&message_id).is_empty() {
                    self.emit_window();
                }
            }
            // Exit never reaches here; the session loop intercepts it.
            SessionCommand::Exit => {}
        }
    }

    fn begin_older_load(&mut self, trigger_index: usize) {
        if !self.pagination.has_more_older() {
            debug!("session: start of history reached, ignoring older trigger");
            return;
        }
        let Some(before_id) = self.window.oldest_id().map(str::to_string) else {
            return;
        };
        if !self
            .pagination
            .try_begin(PageDirection::Older, Some(trigger_index))
        {
            return;
        }
        let pagination = self.pagination.clone();
        let room_id = self.entry.room_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let page = pagination.run_older(&room_id, &before_id).await;
            let _ = tx.send(Internal::OlderLoaded(page)).await;
        });
    }

    fn begin_newer_load(&mut self, trigger_index: usize) {
        let Some(after_id) = self.window.newest_id().map(str::to_string) else {
            return;
        };
        if !self
            .pagination
            .try_begin(PageDirection::Newer, Some(trigger_index))
        {
            return;
        }
        let pagination = self.pagination.clone();
        let room_id = self.entry.room_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let page = pagination.run_newer(&room_id, &after_id).await;
            let _ = tx.send(Internal::NewerLoaded(page)).await;
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::OlderLoaded(page) => {
                if page.is_empty() {
                    return;
                }
                self.window.insert(page, InsertEdge::Head);
                self.window.apply_virtualization();
                self.pagination.reset_debounce();
                self.emit_window();
            }
            Internal::NewerLoaded(page) => {
                if page.is_empty() {
                    return;
                }
                let page_max_seq = page.iter().map(|m| m.seq).max().unwrap_or(0);
                self.window.insert(page, InsertEdge::Tail);
                self.window.apply_virtualization();
                self.pagination.reset_debounce();
                self.emit_window();

                if let Some(chunks) = self.live_sync.on_page_applied(page_max_seq) {
                    self.emit_mode();
                    // The drain must run to completion: a partial drain
                    // would leave buffered arrivals older than the window
                    // tail.
                    for chunk in chunks {
                        for msg in &chunk {
                            self.pool.touch(
                                &msg.sender_id,
                                msg.sent_at.unwrap_or_else(chrono::Utc::now),
                            );
                        }
                        self.window.insert(chunk, InsertEdge::Tail);
                        self.window.apply_virtualization();
                        self.emit_window();
                    }
                }
                let near_bottom = self.near_bottom();
                self.tracker
                    .maybe_update(
                        ReadTrigger::PageApplied,
                        self.live_sync.window_max_seq(),
                        self.live_sync.entry_tail_seq(),
                        near_bottom,
                        false,
                    )
                    .await;
            }
        }
    }

    async fn handle_live_message(&mut self, message: Message) {
        if message.room_id != self.entry.room_id {
            debug!(
                "session: ignoring live message {} for other room {}",
                message.id, message.room_id
            );
            return;
        }
        let Some(message) = self.live_sync.on_live_message(message) else {
            return;
        };
        self.pool.touch(
            &message.sender_id,
            message.sent_at.unwrap_or_else(chrono::Utc::now),
        );
        self.window.insert(vec![message], InsertEdge::Tail);
        self.window.apply_virtualization();
        let near_bottom = self.near_bottom();
        self.tracker
            .maybe_update(
                ReadTrigger::LiveArrival,
                self.live_sync.window_max_seq(),
                self.live_sync.entry_tail_seq(),
                near_bottom,
                false,
            )
            .await;
        self.emit_window();
    }

    async fn handle_live_deletion(&mut self, message_id: &str) {
        self.reconciler
            .on_live_deletion(&self.entry.room_id, message_id)
            .await;
        if !self.window.mark_deleted(message_id).is_empty() {
            self.emit_window();
        }
    }

    fn handle_profile_update(&mut self, update: ProfileUpdate) {
        let updated: Vec<Message> = self
            .window
            .messages()
            .iter()
            .filter(|m| m.sender_id == update.user_id)
            .cloned()
            .map(|mut m| {
                m.sender_nickname = update.nickname.clone();
                m.sender_avatar = update.avatar.clone();
                m
            })
            .collect();
        if updated.is_empty() {
            return;
        }
        self.window.reload(&updated);
        self.emit_window();
    }

    async fn shutdown(&mut self) {
        self.tracker
            .flush_on_exit(
                self.live_sync.window_max_seq(),
                self.live_sync.entry_tail_seq(),
            )
            .await;
        self.pool.reset();
        self.prefetch.cancel_all();
        self.window.clear_read_marker();
        if !self.entry.is_participant
            && let Err(e) = self.local.delete_all(&self.entry.room_id).await
        {
            warn!(
                "session: dropping preview cache for {} failed: {e}",
                self.entry.room_id
            );
        }
    }

    fn near_bottom(&self) -> bool {
        match &self.visible {
            None => true,
            Some(range) => range.end + self.config.near_bottom_rows >= self.window.len(),
        }
    }

    fn emit_window(&self) {
        let _ = self.events.send(SessionEvent::WindowChanged {
            items: Arc::new(self.window.items().to_vec()),
        });
    }

    fn emit_mode(&self) {
        let _ = self.events.send(SessionEvent::ModeChanged {
            mode: self.live_sync.mode(),
        });
    }
}
