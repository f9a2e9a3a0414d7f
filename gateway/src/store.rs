//! The tile-indexed in-memory store: vessel records, tile membership sets,
//! TTL expiry, and the atomic `put_vessel` primitive.
//!
//! Mutation goes through a single `RwLock`, chosen over a per-MMSI mutex or
//! a remote shared-cache script (both sanctioned alternatives) because the
//! pipeline runs the store in-process: a writer takes the write half for the
//! whole five-step transition, so no reader ever observes tile-set removal
//! without the corresponding vessel write, and concurrent readers
//! (dispatcher ticks, subscribe snapshots, batch-sync scans) never block one
//! another.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tilemath::TileKey;

/// A vessel's last known kinematic state, keyed by MMSI.
#[derive(Debug, Clone)]
pub struct VesselRecord {
    pub mmsi: u64,
    pub lat: f64,
    pub lon: f64,
    pub cog: Option<f64>,
    pub sog: Option<f64>,
    /// 0-359, or None if the wire sentinel 511 ("not available") was seen.
    pub heading: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub tile: TileKey,
}

struct Entry {
    record: VesselRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    vessels: FxHashMap<u64, Entry>,
    tile_sets: FxHashMap<TileKey, FxHashSet<u64>>,
}

pub struct Store {
    inner: RwLock<Inner>,
    ttl: Duration,
}

/// Result of `put_vessel`: the vessel's previous tile (None if this is a
/// first sighting) and its new tile. Both, when non-null/different, are
/// dirty and should be signalled to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileTransition {
    pub old_tile: Option<TileKey>,
    pub new_tile: TileKey,
}

impl Store {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            ttl,
        })
    }

    /// Atomically writes `rec`, moving its MMSI between tile sets as needed.
    /// All five steps of the update happen under one write-lock acquisition,
    /// so no reader can observe an intermediate "vessel in two tiles" state.
    pub fn put_vessel(&self, rec: VesselRecord) -> TileTransition {
        let mmsi = rec.mmsi;
        let new_tile = rec.tile;
        let expires_at = Instant::now() + self.ttl;

        let mut inner = self.inner.write();
        let old_tile = inner.vessels.get(&mmsi).map(|e| e.record.tile);

        inner.vessels.insert(mmsi, Entry { record: rec, expires_at });

        if let Some(old) = old_tile
            && old != new_tile
            && let Some(set) = inner.tile_sets.get_mut(&old)
        {
            set.remove(&mmsi);
            if set.is_empty() {
                inner.tile_sets.remove(&old);
            }
        }
        inner.tile_sets.entry(new_tile).or_default().insert(mmsi);

        TileTransition { old_tile, new_tile }
    }

    /// Returns a consistent snapshot of every live vessel currently in
    /// `tile`. Entries that raced against expiry are silently dropped
    /// rather than surfaced as an error.
    pub fn get_vessels_in_tile(&self, tile: TileKey) -> Vec<VesselRecord> {
        let inner = self.inner.read();
        let Some(set) = inner.tile_sets.get(&tile) else {
            return Vec::new();
        };
        let now = Instant::now();
        set.iter()
            .filter_map(|mmsi| {
                inner
                    .vessels
                    .get(mmsi)
                    .filter(|e| e.expires_at > now)
                    .map(|e| e.record.clone())
            })
            .collect()
    }

    /// Removes entries whose TTL has lapsed and evicts any tile set left
    /// empty by that removal. Lazy expiry (filtering on read) already
    /// guarantees correctness; this sweep bounds the store's resident size
    /// under a sustained drop in ingest traffic.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let expired: Vec<u64> = inner
            .vessels
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(mmsi, _)| *mmsi)
            .collect();
        for mmsi in &expired {
            if let Some(entry) = inner.vessels.remove(mmsi)
                && let Some(set) = inner.tile_sets.get_mut(&entry.record.tile)
            {
                set.remove(mmsi);
                if set.is_empty() {
                    inner.tile_sets.remove(&entry.record.tile);
                }
            }
        }
        expired.len()
    }

    /// Scans up to `limit` live records in MMSI order, resuming from
    /// `cursor` (exclusive) and wrapping back to the start when it runs off
    /// the end. Backs the batch synchronizer's incremental scan — a full
    /// pass isn't guaranteed within one tick, but every record is eventually
    /// visited.
    pub fn scan(&self, cursor: u64, limit: usize) -> (Vec<VesselRecord>, u64) {
        let inner = self.inner.read();
        let now = Instant::now();
        let mut keys: Vec<u64> = inner
            .vessels
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(mmsi, _)| *mmsi)
            .collect();
        keys.sort_unstable();

        if keys.is_empty() {
            return (Vec::new(), 0);
        }

        let start = keys.partition_point(|&m| m <= cursor);
        let mut out = Vec::with_capacity(limit.min(keys.len()));
        let mut idx = start;
        while out.len() < limit && out.len() < keys.len() {
            let mmsi = keys[idx % keys.len()];
            if let Some(entry) = inner.vessels.get(&mmsi) {
                out.push(entry.record.clone());
            }
            idx += 1;
            if idx % keys.len() == start {
                break;
            }
        }
        let next_cursor = out.last().map(|v| v.mmsi).unwrap_or(0);
        (out, next_cursor)
    }

    pub fn live_vessel_count(&self) -> usize {
        let inner = self.inner.read();
        let now = Instant::now();
        inner.vessels.values().filter(|e| e.expires_at > now).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn put_vessel_reports_transition_and_moves_tile_sets() {
        let store = Store::new(Duration::from_secs(120));
        let t1 = TileKey::new(12, 1, 1);
        let t2 = TileKey::new(12, 2, 2);

        let first = store.put_vessel(rec(1, t1));
        assert_eq!(first.old_tile, None);
        assert_eq!(first.new_tile, t1);
        assert_eq!(store.get_vessels_in_tile(t1).len(), 1);

        let moved = store.put_vessel(rec(1, t2));
        assert_eq!(moved.old_tile, Some(t1));
        assert_eq!(moved.new_tile, t2);
        assert!(store.get_vessels_in_tile(t1).is_empty());
        assert_eq!(store.get_vessels_in_tile(t2).len(), 1);
    }

    #[test]
    fn expired_vessel_is_absent_from_store_and_tile_set() {
        let store = Store::new(Duration::from_millis(1));
        let t1 = TileKey::new(12, 1, 1);
        store.put_vessel(rec(1, t1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get_vessels_in_tile(t1).is_empty());
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.live_vessel_count(), 0);
    }

    #[test]
    fn same_payload_put_twice_is_idempotent() {
        let store = Store::new(Duration::from_secs(120));
        let t1 = TileKey::new(12, 5, 5);
        store.put_vessel(rec(7, t1));
        store.put_vessel(rec(7, t1));
        assert_eq!(store.get_vessels_in_tile(t1).len(), 1);
    }

    #[test]
    fn scan_wraps_and_covers_every_record() {
        let store = Store::new(Duration::from_secs(120));
        let t = TileKey::new(12, 0, 0);
        for m in 1..=5u64 {
            store.put_vessel(rec(m, t));
        }
        let (batch1, cursor) = store.scan(0, 3);
        assert_eq!(batch1.len(), 3);
        let (batch2, _) = store.scan(cursor, 3);
        let mut seen: Vec<u64> = batch1.iter().chain(batch2.iter()).map(|v| v.mmsi).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
