//! The dirty-tile dispatcher: owns the tile subscription index, coalesces
//! dirty-tile signals between flush ticks, and fans out one `vessel_update`
//! per (tile, subscriber) per tick.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tilemath::TileKey;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::session::Session;
use crate::store::Store;

pub struct Dispatcher {
    subs: RwLock<FxHashMap<TileKey, FxHashSet<Uuid>>>,
    sessions: RwLock<FxHashMap<Uuid, Arc<Session>>>,
    dirty: Mutex<FxHashSet<TileKey>>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: RwLock::new(FxHashMap::default()),
            sessions: RwLock::new(FxHashMap::default()),
            dirty: Mutex::new(FxHashSet::default()),
        })
    }

    pub fn register_session(&self, sid: Uuid, session: Arc<Session>) {
        self.sessions.write().insert(sid, session);
    }

    /// Removes a session from the registry and from every tile it was
    /// subscribed to, evicting any reverse-index entry left empty.
    pub fn remove_session(&self, sid: Uuid, subscribed: &FxHashSet<TileKey>) {
        self.sessions.write().remove(&sid);
        let mut subs = self.subs.write();
        for tile in subscribed {
            if let Some(set) = subs.get_mut(tile) {
                set.remove(&sid);
                if set.is_empty() {
                    subs.remove(tile);
                }
            }
        }
    }

    /// Adds `sid` to each tile's subscriber set. Subscribing to a tile the
    /// session is already in is a no-op on the reverse index (the set
    /// insert is naturally idempotent).
    pub fn subscribe(&self, sid: Uuid, tiles: &[TileKey]) {
        let mut subs = self.subs.write();
        for &tile in tiles {
            subs.entry(tile).or_default().insert(sid);
        }
    }

    pub fn unsubscribe(&self, sid: Uuid, tiles: &[TileKey]) {
        let mut subs = self.subs.write();
        for tile in tiles {
            if let Some(set) = subs.get_mut(tile) {
                set.remove(&sid);
                if set.is_empty() {
                    subs.remove(tile);
                }
            }
        }
    }

    /// Additive: merges `tiles` into the pending dirty set. Safe to call
    /// from any number of concurrent ingest flush cycles.
    pub fn mark_dirty(&self, tiles: impl IntoIterator<Item = TileKey>) {
        let mut dirty = self.dirty.lock();
        dirty.extend(tiles);
    }

    pub fn subscriber_count(&self, tile: TileKey) -> usize {
        self.subs.read().get(&tile).map(|s| s.len()).unwrap_or(0)
    }

    /// Sends `msg` to one session, dropping it (logging) if the session has
    /// since disconnected or its outbox has been closed. Best-effort by
    /// design: a single subscriber's misbehavior never blocks the tick.
    fn send_to(&self, sid: Uuid, msg: ServerMessage) {
        let session = self.sessions.read().get(&sid).cloned();
        match session {
            Some(session) => {
                if !session.outbox.push(msg) {
                    tracing::debug!(session = %sid, "outbox closed, dropping send");
                }
            }
            None => tracing::debug!(session = %sid, "session vanished before send"),
        }
    }

    /// Runs the heartbeat sweep until cancelled: every `interval`, pings
    /// every registered session that answered its last ping, and closes any
    /// session that didn't.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_once(),
            }
        }
    }

    fn heartbeat_once(&self) {
        let sessions = self.sessions.read();
        crate::metrics::session_count(sessions.len());
        crate::metrics::subscribed_tile_count(self.subs.read().len());
        for (sid, session) in sessions.iter() {
            if session.awaiting_pong.swap(true, Ordering::AcqRel) {
                tracing::info!(session = %sid, "heartbeat timeout, closing session");
                crate::metrics::heartbeat_timeout();
                session.request_close(1006, "Heartbeat timeout");
            } else {
                session.request_ping();
            }
        }
    }

    /// Runs the flush loop until cancelled: every `interval`, swap the dirty
    /// set for an empty one and, for each drained tile with at least one
    /// subscriber, build and fan out a single `vessel_update`.
    pub async fn run(self: Arc<Self>, store: Arc<Store>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let started = std::time::Instant::now();
                    self.flush_once(&store);
                    crate::metrics::dispatch_tick_duration(started.elapsed().as_secs_f64());
                }
            }
        }
    }

    fn flush_once(&self, store: &Store) {
        let drained: FxHashSet<TileKey> = {
            let mut dirty = self.dirty.lock();
            std::mem::take(&mut *dirty)
        };
        if drained.is_empty() {
            return;
        }

        for tile in drained {
            let subscribers: Vec<Uuid> = {
                let subs = self.subs.read();
                match subs.get(&tile) {
                    Some(set) if !set.is_empty() => set.iter().copied().collect(),
                    _ => continue,
                }
            };

            let vessels: Vec<crate::protocol::VesselDto> = store
                .get_vessels_in_tile(tile)
                .iter()
                .map(crate::protocol::VesselDto::from)
                .collect();

            let msg = ServerMessage::VesselUpdate {
                tile: tile.to_string(),
                vessels,
            };
            for sid in subscribers {
                self.send_to(sid, msg.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VesselRecord;
    use chrono::Utc;
    use std::time::Duration as StdDuration;

    fn rec(mmsi: u64, tile: TileKey) -> VesselRecord {
        VesselRecord {
            mmsi,
            lat: 0.0,
            lon: 0.0,
            cog: None,
            sog: None,
            heading: None,
            timestamp: Utc::now(),
            tile,
        }
    }

    #[tokio::test]
    async fn flush_coalesces_multiple_updates_into_one_message() {
        let dispatcher = Dispatcher::new();
        let store = Store::new(StdDuration::from_secs(120));
        let tile = TileKey::new(12, 1, 1);
        let session = test_session();
        let sid = session.id;
        let outbox = session.outbox.clone();
        dispatcher.register_session(sid, session);
        dispatcher.subscribe(sid, &[tile]);

        store.put_vessel(rec(1, tile));
        store.put_vessel(rec(2, tile));
        dispatcher.mark_dirty([tile, tile]);

        dispatcher.flush_once(&store);

        let msg = outbox.pop().await.unwrap();
        match msg {
            ServerMessage::VesselUpdate { tile: t, vessels } => {
                assert_eq!(t, tile.to_string());
                assert_eq!(vessels.len(), 2);
            }
            _ => panic!("expected vessel_update"),
        }
        assert!(outbox.is_empty());
    }

    fn test_session() -> Arc<Session> {
        Session::new(16)
    }

    #[tokio::test]
    async fn empty_tile_produces_depopulation_signal() {
        let dispatcher = Dispatcher::new();
        let store = Store::new(StdDuration::from_secs(120));
        let tile = TileKey::new(12, 5, 5);
        let session = test_session();
        let sid = session.id;
        let outbox = session.outbox.clone();
        dispatcher.register_session(sid, session);
        dispatcher.subscribe(sid, &[tile]);

        dispatcher.mark_dirty([tile]);
        dispatcher.flush_once(&store);

        let msg = outbox.pop().await.unwrap();
        match msg {
            ServerMessage::VesselUpdate { vessels, .. } => assert!(vessels.is_empty()),
            _ => panic!("expected vessel_update"),
        }
    }

    #[test]
    fn dirty_tile_with_no_subscribers_is_skipped() {
        let dispatcher = Dispatcher::new();
        let store = Store::new(StdDuration::from_secs(120));
        dispatcher.mark_dirty([TileKey::new(12, 9, 9)]);
        dispatcher.flush_once(&store); // must not panic with no subscribers
    }

    #[test]
    fn heartbeat_pings_on_first_sweep_and_closes_on_second_unanswered() {
        let dispatcher = Dispatcher::new();
        let session = test_session();
        let sid = session.id;
        dispatcher.register_session(sid, session.clone());

        dispatcher.heartbeat_once();
        assert!(session.awaiting_pong.load(Ordering::Relaxed));

        dispatcher.heartbeat_once();
        // still no pong since the first ping: session gets closed this round.
    }
}
