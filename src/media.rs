//! Background prefetch of attachment media near the visible window.
//!
//! Fetches are keyed by message id and idempotent; tasks that scroll out of
//! the padded range are cancelled after a short debounce so fast flicks do
//! not thrash cancel/restart. Opening the viewer re-prioritizes fetches in
//! ring order around the focused item, with a small near tier kept warm in
//! memory.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::store::traits::{CacheTier, MediaService};
use crate::types::message::{Attachment, AttachmentType, Message};

/// Items past each end of the visible range that still get prefetch.
pub const DEFAULT_PREFETCH_PAD: usize = 25;
/// Ring-order ranks kept warm in memory when the viewer opens.
pub const VIEWER_NEAR_TIER: usize = 8;

/// Memoized storage-path resolution with per-key single-flight semantics:
/// concurrent resolves for the same path share one underlying call.
pub struct UrlResolver {
    service: Arc<dyn MediaService>,
    resolved: DashMap<String, Arc<OnceCell<String>>>,
}

impl UrlResolver {
    pub fn new(service: Arc<dyn MediaService>) -> Self {
        Self {
            service,
            resolved: DashMap::new(),
        }
    }

    pub async fn resolve(&self, storage_path: &str) -> anyhow::Result<String> {
        let cell = self
            .resolved
            .entry(storage_path.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        // A failed resolve leaves the cell empty, so the next call retries.
        let url = cell
            .get_or_try_init(|| self.service.resolve(storage_path))
            .await?;
        Ok(url.clone())
    }
}

struct PrefetchEntry {
    handle: JoinHandle<()>,
    /// Generation of the last range update that still covered this message.
    last_seen: AtomicU64,
}

pub struct MediaPrefetchScheduler {
    service: Arc<dyn MediaService>,
    resolver: Arc<UrlResolver>,
    in_flight: Arc<DashMap<String, PrefetchEntry>>,
    generation: Arc<AtomicU64>,
    viewer_task: Mutex<Option<JoinHandle<()>>>,
    pad: usize,
    cancel_debounce: Duration,
}

impl MediaPrefetchScheduler {
    pub fn new(service: Arc<dyn MediaService>, pad: usize, cancel_debounce: Duration) -> Self {
        Self {
            resolver: Arc::new(UrlResolver::new(service.clone())),
            service,
            in_flight: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            viewer_task: Mutex::new(None),
            pad,
            cancel_debounce,
        }
    }

    pub fn resolver(&self) -> Arc<UrlResolver> {
        self.resolver.clone()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// React to a change of the visible sub-range: start fetches for media
    /// messages inside the padded range and schedule debounced cancellation
    /// for everything that left it.
    pub fn update_visible_range(&self, messages: &[Message], visible: Range<usize>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let lo = visible.start.saturating_sub(self.pad);
        let hi = visible.end.saturating_add(self.pad).min(messages.len());

        for msg in messages.get(lo..hi).unwrap_or(&[]) {
            if !msg.has_media() || msg.is_deleted {
                continue;
            }
            if let Some(entry) = self.in_flight.get(&msg.id) {
                // Already running; just note it is still wanted.
                entry.last_seen.store(generation, Ordering::SeqCst);
                continue;
            }
            self.start_prefetch(msg, generation);
        }

        // Debounced sweep: whatever has not been seen by a newer update by
        // the time the timer fires gets cancelled.
        let in_flight = self.in_flight.clone();
        let debounce = self.cancel_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            in_flight.retain(|id, entry| {
                if entry.last_seen.load(Ordering::SeqCst) >= generation {
                    true
                } else {
                    debug!("media: cancelling prefetch for {id} (out of range)");
                    entry.handle.abort();
                    false
                }
            });
        });
    }

    /// Viewer opened at message index `focus` (into the message slice):
    /// fetch original-resolution assets nearest-first in ring order. The
    /// first [`VIEWER_NEAR_TIER`] ranks stay warm in the memory cache, the
    /// rest land on disk only.
    pub fn prioritize_viewer(&self, messages: &[Message], focus: usize) {
        let targets: Vec<(usize, Vec<Attachment>)> = ring_order(focus, messages.len())
            .into_iter()
            .filter(|&i| messages[i].has_media() && !messages[i].is_deleted)
            .map(|i| (i, messages[i].attachments.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let service = self.service.clone();
        let resolver = self.resolver.clone();
        let handle = tokio::spawn(async move {
            for (rank, (_, attachments)) in targets.into_iter().enumerate() {
                let tier = if rank < VIEWER_NEAR_TIER {
                    CacheTier::Memory
                } else {
                    CacheTier::Disk
                };
                for attachment in attachments {
                    fetch_original(&*service, &resolver, &attachment, tier).await;
                }
            }
        });

        let mut slot = self.viewer_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Abort everything. Called on room exit.
    pub fn cancel_all(&self) {
        self.in_flight.retain(|_, entry| {
            entry.handle.abort();
            false
        });
        let mut slot = self.viewer_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    fn start_prefetch(&self, msg: &Message, generation: u64) {
        let service = self.service.clone();
        let resolver = self.resolver.clone();
        let in_flight = self.in_flight.clone();
        let id = msg.id.clone();
        let attachments = msg.attachments.clone();

        let task_id = id.clone();
        let task_map = in_flight.clone();
        let handle = tokio::spawn(async move {
            for attachment in &attachments {
                fetch_thumbnail(&*service, &resolver, attachment).await;
            }
            task_map.remove(&task_id);
        });

        in_flight.insert(
            id,
            PrefetchEntry {
                handle,
                last_seen: AtomicU64::new(generation),
            },
        );
    }
}

impl Drop for MediaPrefetchScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn fetch_thumbnail(service: &dyn MediaService, resolver: &UrlResolver, att: &Attachment) {
    let key = thumb_key(att);
    if service.is_cached(&key).await {
        return;
    }
    let url = match resolver.resolve(&att.path_thumb).await {
        Ok(url) => url,
        Err(e) => {
            warn!("media: resolving thumbnail {} failed: {e:#}", att.path_thumb);
            return;
        }
    };
    if let Err(e) = service.populate(&key, &url, CacheTier::Disk).await {
        warn!("media: thumbnail fetch for {key} failed: {e:#}");
        return;
    }
    // Video playback starts from the original URL; warm the resolve so the
    // player does not pay for it on tap.
    if att.kind == AttachmentType::Video
        && let Err(e) = resolver.resolve(&att.path_original).await
    {
        warn!("media: warming original URL for {key} failed: {e:#}");
    }
}

async fn fetch_original(
    service: &dyn MediaService,
    resolver: &UrlResolver,
    att: &Attachment,
    tier: CacheTier,
) {
    let key = original_key(att);
    if service.is_cached(&key).await && tier == CacheTier::Disk {
        return;
    }
    let url = match resolver.resolve(&att.path_original).await {
        Ok(url) => url,
        Err(e) => {
            warn!("media: resolving original {} failed: {e:#}", att.path_original);
            return;
        }
    };
    if let Err(e) = service.populate(&key, &url, tier).await {
        warn!("media: original fetch for {key} failed: {e:#}");
    }
}

fn thumb_key(att: &Attachment) -> String {
    format!("{}:thumb", att.content_hash)
}

fn original_key(att: &Attachment) -> String {
    format!("{}:orig", att.content_hash)
}

/// Traversal order around `focus`: K, K+1, K-1, K+2, K-2, ... clamped to
/// `0..len`.
pub fn ring_order(focus: usize, len: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let focus = focus.min(len - 1);
    let mut order = Vec::with_capacity(len);
    order.push(focus);
    let mut step = 1usize;
    while order.len() < len {
        if focus + step < len {
            order.push(focus + step);
        }
        if let Some(below) = focus.checked_sub(step) {
            order.push(below);
        }
        step += 1;
    }
    order
}
