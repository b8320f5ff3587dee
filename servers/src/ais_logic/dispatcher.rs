//! # Dirty-Tile Dispatcher
//!
//! The fan-out hub between the ingest client and the subscriber sessions.
//! It owns the tile subscription index (the inverse of every session's
//! subscribed-tiles set), a registry of session handles, and the dirty-tile
//! set the ingest client feeds through a typed channel.
//!
//! Every flush tick the dirty set is swapped for an empty one and each
//! drained tile with at least one subscriber produces exactly one
//! `vessel_update` per subscriber, carrying a fresh store snapshot. That is
//! the coalescing point of the pipeline: any number of vessel movements
//! inside one tile between ticks collapses into a single outbound message.
//!
//! Subscription changes and flushes enqueue under the same index lock, so
//! per (tile, session) the initial snapshot always precedes the first
//! tick-driven update and updates are ordered by tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::interval;

use lib_common::core::VesselStore;
use lib_common::tiles::TileKey;

use crate::ais_logic::model::ServerMessage;

pub type SessionId = u64;

/// A batch of tile keys whose population changed since the last ingest
/// flush. Sole message type on the ingest-to-dispatcher channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyTileBatch(pub Vec<TileKey>);

/// One item on a session's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Protocol-level ping carrying no payload.
    Ping,
    /// Terminates the session after the close frame is written.
    Close { code: u16, reason: &'static str },
}

/// Bounded per-session outbound queue.
///
/// Overflow sheds the oldest pending `vessel_update`; control frames
/// (connected/subscribed/unsubscribed/pong, pings, closes) are never
/// dropped and may transiently push the queue past its capacity.
pub struct OutboundQueue {
    items: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: Outbound) {
        {
            let mut items = self.items.lock().expect("outbound queue lock poisoned");
            if items.len() >= self.capacity {
                let oldest_update = items.iter().position(
                    |i| matches!(i, Outbound::Frame(msg) if msg.is_droppable()),
                );
                if let Some(idx) = oldest_update {
                    items.remove(idx);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Waits for the next outbound item. Single-consumer.
    pub async fn pop(&self) -> Outbound {
        loop {
            if let Some(item) = self
                .items
                .lock()
                .expect("outbound queue lock poisoned")
                .pop_front()
            {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("outbound queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Updates shed since the session started.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Shared state of one downstream connection. The socket task owns the
/// transport; the dispatcher and the heartbeat monitor reach the session
/// through this handle.
pub struct SessionHandle {
    pub id: SessionId,
    pub queue: OutboundQueue,
    /// Cleared by each heartbeat sweep, set by any inbound traffic. A
    /// session found cleared on the next sweep has missed an interval and
    /// is terminated.
    pub alive: AtomicBool,
    subscribed: Mutex<HashSet<TileKey>>,
}

impl SessionHandle {
    pub fn new(id: SessionId, queue_capacity: usize) -> Self {
        Self {
            id,
            queue: OutboundQueue::new(queue_capacity),
            alive: AtomicBool::new(true),
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    pub fn subscribed_tiles(&self) -> Vec<TileKey> {
        self.subscribed
            .lock()
            .expect("session lock poisoned")
            .iter()
            .copied()
            .collect()
    }
}

struct IndexInner {
    sessions: HashMap<SessionId, Arc<SessionHandle>>,
    subs: HashMap<TileKey, HashSet<SessionId>>,
}

pub struct Dispatcher {
    index: Mutex<IndexInner>,
    dirty: Mutex<HashSet<TileKey>>,
    max_tiles_per_session: usize,
}

impl Dispatcher {
    pub fn new(max_tiles_per_session: usize) -> Self {
        Self {
            index: Mutex::new(IndexInner {
                sessions: HashMap::new(),
                subs: HashMap::new(),
            }),
            dirty: Mutex::new(HashSet::new()),
            max_tiles_per_session,
        }
    }

    pub fn register(&self, session: Arc<SessionHandle>) {
        let mut index = self.index.lock().expect("dispatcher lock poisoned");
        index.sessions.insert(session.id, session);
    }

    /// Removes a session from the registry and from every tile it was
    /// subscribed to, evicting reverse-index entries that become empty.
    pub fn unregister(&self, sid: SessionId) {
        let mut index = self.index.lock().expect("dispatcher lock poisoned");
        let Some(session) = index.sessions.remove(&sid) else {
            return;
        };
        let tiles = session.subscribed_tiles();
        for tile in tiles {
            if let Some(subscribers) = index.subs.get_mut(&tile) {
                subscribers.remove(&sid);
                if subscribers.is_empty() {
                    index.subs.remove(&tile);
                }
            }
        }
        log::info!("Client {} removed from dispatcher", sid);
    }

    /// Subscribes a session to a set of tiles and queues the ack followed by
    /// one snapshot per newly subscribed, non-empty tile. The whole exchange
    /// happens under the index lock so no flush can slip a tick-driven
    /// update in front of the initial snapshot.
    pub fn subscribe(&self, sid: SessionId, tiles: &[TileKey], store: &VesselStore) {
        let index = &mut *self.index.lock().expect("dispatcher lock poisoned");
        let Some(session) = index.sessions.get(&sid) else {
            return;
        };

        let mut subscribed = session.subscribed.lock().expect("session lock poisoned");
        let mut accepted = Vec::new();
        let mut fresh = Vec::new();
        let mut rejected = 0usize;

        for &tile in tiles {
            if !subscribed.contains(&tile) && subscribed.len() >= self.max_tiles_per_session {
                rejected += 1;
                continue;
            }
            if subscribed.insert(tile) {
                index.subs.entry(tile).or_default().insert(sid);
                fresh.push(tile);
            }
            // Re-subscribing an already held tile is a no-op beyond the ack.
            accepted.push(tile);
        }
        drop(subscribed);

        if rejected > 0 {
            log::warn!(
                "Client {} exceeded the {}-tile subscription cap, dropped {} tiles",
                sid,
                self.max_tiles_per_session,
                rejected
            );
        }

        session.queue.push(Outbound::Frame(ServerMessage::Subscribed {
            tiles: accepted.clone(),
            message: format!("subscribed to {} tiles", accepted.len()),
        }));

        // Initial data rides the same channel as live updates, one message
        // per tile that currently holds vessels.
        for tile in fresh {
            let vessels = store.vessels_in_tile(tile);
            if vessels.is_empty() {
                continue;
            }
            session
                .queue
                .push(Outbound::Frame(ServerMessage::VesselUpdate { tile, vessels }));
        }
    }

    pub fn unsubscribe(&self, sid: SessionId, tiles: &[TileKey]) {
        let index = &mut *self.index.lock().expect("dispatcher lock poisoned");
        let Some(session) = index.sessions.get(&sid) else {
            return;
        };

        let mut subscribed = session.subscribed.lock().expect("session lock poisoned");
        let mut removed = Vec::new();
        for &tile in tiles {
            if subscribed.remove(&tile) {
                if let Some(subscribers) = index.subs.get_mut(&tile) {
                    subscribers.remove(&sid);
                    if subscribers.is_empty() {
                        index.subs.remove(&tile);
                    }
                }
            }
            removed.push(tile);
        }
        drop(subscribed);

        session.queue.push(Outbound::Frame(ServerMessage::Unsubscribed {
            tiles: removed.clone(),
            message: format!("unsubscribed from {} tiles", removed.len()),
        }));
    }

    /// Folds a batch of dirty tiles into the pending set.
    pub fn mark_dirty(&self, batch: DirtyTileBatch) {
        self.dirty
            .lock()
            .expect("dispatcher lock poisoned")
            .extend(batch.0);
    }

    /// One dispatch tick: swap out the dirty set and broadcast a snapshot
    /// per drained tile to its subscribers. An empty vessel list is still
    /// sent; it is the only signal that a tile has been depopulated.
    /// Returns (tiles flushed, messages queued).
    pub fn flush(&self, store: &VesselStore) -> (usize, usize) {
        let drained = {
            let mut dirty = self.dirty.lock().expect("dispatcher lock poisoned");
            std::mem::take(&mut *dirty)
        };
        if drained.is_empty() {
            return (0, 0);
        }

        let index = self.index.lock().expect("dispatcher lock poisoned");
        let mut tiles_flushed = 0;
        let mut messages = 0;
        for tile in drained {
            let Some(subscribers) = index.subs.get(&tile) else {
                continue;
            };
            if subscribers.is_empty() {
                continue;
            }

            let vessels = store.vessels_in_tile(tile);
            let update = ServerMessage::VesselUpdate { tile, vessels };
            tiles_flushed += 1;
            for sid in subscribers {
                if let Some(session) = index.sessions.get(sid) {
                    session.queue.push(Outbound::Frame(update.clone()));
                    messages += 1;
                }
            }
        }
        (tiles_flushed, messages)
    }

    /// One heartbeat sweep: sessions that produced no traffic since the
    /// previous sweep are returned for termination, the rest get a ping and
    /// their liveness flag cleared for the next round.
    pub fn heartbeat_sweep(&self) -> Vec<Arc<SessionHandle>> {
        let index = self.index.lock().expect("dispatcher lock poisoned");
        let mut expired = Vec::new();
        for session in index.sessions.values() {
            if session.alive.swap(false, Ordering::Relaxed) {
                session.queue.push(Outbound::Ping);
            } else {
                expired.push(Arc::clone(session));
            }
        }
        expired
    }

    pub fn session_count(&self) -> usize {
        self.index
            .lock()
            .expect("dispatcher lock poisoned")
            .sessions
            .len()
    }

    pub fn subscribed_tile_count(&self) -> usize {
        self.index
            .lock()
            .expect("dispatcher lock poisoned")
            .subs
            .len()
    }

    /// Flush loop: the single consumer of the ingest client's dirty-tile
    /// channel, draining it continuously and flushing on the dispatch tick.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<VesselStore>,
        mut dirty_rx: mpsc::UnboundedReceiver<DirtyTileBatch>,
        flush_ms: u64,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut flush_tick = interval(Duration::from_millis(flush_ms.max(1)));
        let mut ingest_gone = false;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Dispatcher shutting down.");
                    break;
                }
                batch = dirty_rx.recv(), if !ingest_gone => {
                    match batch {
                        Some(batch) => self.mark_dirty(batch),
                        None => {
                            log::warn!("Dirty-tile channel closed, dispatcher continues on ticks only.");
                            ingest_gone = true;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    let (tiles, messages) = self.flush(&store);
                    if tiles > 0 {
                        log::debug!("Dispatch tick: {} tiles, {} messages", tiles, messages);
                    }
                }
            }
        }
    }
}
