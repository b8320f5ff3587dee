//! # Tile-Indexed Vessel Store
//!
//! The single shared mutable resource of the pipeline: the latest record per
//! vessel, plus a reverse index from tile to the vessels currently inside it.
//!
//! ## Contracts
//!
//! - `put_vessel` is one atomic transition: the vessel slot, the old tile
//!   set and the new tile set change under one writer lock, so no reader
//!   ever observes a vessel in two tiles or in none while live.
//! - Every entry carries a TTL. Expiry is enforced lazily on every read
//!   path (an expired record is "absent" even if still allocated) and
//!   physically by `sweep_expired`, which bounds memory.
//! - Reads take the shared side of the lock and do not block each other.
//!
//! Time is injected through the `_at` variants so tests drive the clock;
//! the public methods stamp `Instant::now()`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::model::VesselRecord;
use crate::tiles::TileKey;

/// Result of an atomic vessel write: which tile the vessel left (if it was
/// live somewhere else) and which tile it is in now. Both tiles are dirty
/// from the dispatcher's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub old_tile: Option<TileKey>,
    pub new_tile: TileKey,
}

struct VesselEntry {
    record: VesselRecord,
    expires_at: Instant,
}

struct TileEntry {
    mmsis: HashSet<u64>,
    expires_at: Instant,
}

struct StoreInner {
    vessels: HashMap<u64, VesselEntry>,
    tile_sets: HashMap<TileKey, TileEntry>,
}

pub struct VesselStore {
    ttl: Duration,
    inner: RwLock<StoreInner>,
}

impl VesselStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(StoreInner {
                vessels: HashMap::new(),
                tile_sets: HashMap::new(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Writes a vessel record, refreshing its TTL and maintaining the tile
    /// reverse index, as a single atomic transition.
    pub fn put_vessel(&self, record: VesselRecord) -> PutOutcome {
        self.put_vessel_at(record, Instant::now())
    }

    pub fn put_vessel_at(&self, record: VesselRecord, now: Instant) -> PutOutcome {
        let mmsi = record.mmsi;
        let new_tile = record.tile;
        let expires_at = now + self.ttl;

        let mut inner = self.inner.write().expect("store lock poisoned");

        let prev = inner.vessels.insert(
            mmsi,
            VesselEntry { record, expires_at },
        );

        let mut old_tile = None;
        if let Some(prev) = prev {
            let prev_tile = prev.record.tile;
            if prev.expires_at > now {
                old_tile = Some(prev_tile);
            }
            // Stale membership is scrubbed even when the previous record had
            // already expired, so a tile set never retains a moved vessel.
            if prev_tile != new_tile {
                remove_from_tile(&mut inner.tile_sets, prev_tile, mmsi);
            }
        }

        let entry = inner
            .tile_sets
            .entry(new_tile)
            .or_insert_with(|| TileEntry {
                mmsis: HashSet::new(),
                expires_at,
            });
        entry.mmsis.insert(mmsi);
        entry.expires_at = expires_at;

        PutOutcome { old_tile, new_tile }
    }

    /// The live record for one vessel, if any.
    pub fn get_vessel(&self, mmsi: u64) -> Option<VesselRecord> {
        self.get_vessel_at(mmsi, Instant::now())
    }

    pub fn get_vessel_at(&self, mmsi: u64, now: Instant) -> Option<VesselRecord> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .vessels
            .get(&mmsi)
            .filter(|e| e.expires_at > now)
            .map(|e| e.record.clone())
    }

    /// Consistent snapshot of the live vessels in one tile, ordered by MMSI.
    ///
    /// Membership races against eviction resolve by silently dropping the
    /// missing record.
    pub fn vessels_in_tile(&self, tile: TileKey) -> Vec<VesselRecord> {
        self.vessels_in_tile_at(tile, Instant::now())
    }

    pub fn vessels_in_tile_at(&self, tile: TileKey, now: Instant) -> Vec<VesselRecord> {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some(entry) = inner.tile_sets.get(&tile) else {
            return Vec::new();
        };

        let mut records: Vec<VesselRecord> = entry
            .mmsis
            .iter()
            .filter_map(|mmsi| inner.vessels.get(mmsi))
            .filter(|e| e.expires_at > now && e.record.tile == tile)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by_key(|r| r.mmsi);
        records
    }

    /// Number of live vessels.
    pub fn vessel_count(&self) -> usize {
        self.vessel_count_at(Instant::now())
    }

    pub fn vessel_count_at(&self, now: Instant) -> usize {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .vessels
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Number of tracked tile sets, including not-yet-swept empty shells.
    pub fn tile_count(&self) -> usize {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.tile_sets.len()
    }

    /// One page of an incremental MMSI-ordered scan.
    ///
    /// Pass `None` to start a pass and the returned cursor to continue it;
    /// a `None` cursor back means the pass is complete. Only live records
    /// are returned.
    pub fn scan_from(&self, cursor: Option<u64>, limit: usize) -> (Vec<VesselRecord>, Option<u64>) {
        self.scan_from_at(cursor, limit, Instant::now())
    }

    pub fn scan_from_at(
        &self,
        cursor: Option<u64>,
        limit: usize,
        now: Instant,
    ) -> (Vec<VesselRecord>, Option<u64>) {
        let inner = self.inner.read().expect("store lock poisoned");

        let mut mmsis: Vec<u64> = inner
            .vessels
            .iter()
            .filter(|(mmsi, e)| e.expires_at > now && cursor.map_or(true, |c| **mmsi > c))
            .map(|(mmsi, _)| *mmsi)
            .collect();
        mmsis.sort_unstable();

        let exhausted = mmsis.len() <= limit;
        mmsis.truncate(limit);

        let next_cursor = if exhausted { None } else { mmsis.last().copied() };
        let records = mmsis
            .iter()
            .map(|mmsi| inner.vessels[mmsi].record.clone())
            .collect();
        (records, next_cursor)
    }

    /// Physically removes expired vessels and empty tile sets. Returns the
    /// number of vessels dropped.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let expired: Vec<(u64, TileKey)> = inner
            .vessels
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(mmsi, e)| (*mmsi, e.record.tile))
            .collect();

        for (mmsi, tile) in &expired {
            inner.vessels.remove(mmsi);
            remove_from_tile(&mut inner.tile_sets, *tile, *mmsi);
        }
        // Tile shells whose refresh deadline passed hold no live members.
        inner
            .tile_sets
            .retain(|_, entry| !entry.mmsis.is_empty() || entry.expires_at > now);

        if !expired.is_empty() {
            log::debug!("store sweep dropped {} expired vessels", expired.len());
        }
        expired.len()
    }
}

fn remove_from_tile(tile_sets: &mut HashMap<TileKey, TileEntry>, tile: TileKey, mmsi: u64) {
    if let Some(entry) = tile_sets.get_mut(&tile) {
        entry.mmsis.remove(&mmsi);
        if entry.mmsis.is_empty() {
            tile_sets.remove(&tile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::tile_of;
    use chrono::{TimeZone, Utc};

    const TTL: Duration = Duration::from_secs(120);

    fn record(mmsi: u64, lat: f64, lon: f64) -> VesselRecord {
        VesselRecord {
            mmsi,
            lat,
            lon,
            cog: Some(45.0),
            sog: Some(12.3),
            heading: Some(50),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            tile: tile_of(lat, lon, 12),
        }
    }

    #[test]
    fn put_then_read_round_trips() {
        let store = VesselStore::new(TTL);
        let rec = record(111, 22.3964, 114.1095);
        let outcome = store.put_vessel(rec.clone());

        assert_eq!(outcome.old_tile, None);
        assert_eq!(outcome.new_tile, rec.tile);
        assert_eq!(store.get_vessel(111), Some(rec.clone()));
        assert_eq!(store.vessels_in_tile(rec.tile), vec![rec]);
    }

    #[test]
    fn moving_between_tiles_updates_both_sets_atomically() {
        let store = VesselStore::new(TTL);
        let first = record(222, 22.40, 114.11);
        let second = record(222, 22.41, 114.20);
        assert_ne!(first.tile, second.tile);

        store.put_vessel(first.clone());
        let outcome = store.put_vessel(second.clone());

        assert_eq!(outcome.old_tile, Some(first.tile));
        assert_eq!(outcome.new_tile, second.tile);
        assert!(store.vessels_in_tile(first.tile).is_empty());
        assert_eq!(store.vessels_in_tile(second.tile), vec![second]);
        // The emptied tile set is evicted, not left as a shell.
        assert_eq!(store.tile_count(), 1);
    }

    #[test]
    fn update_within_a_tile_reports_the_old_tile() {
        let store = VesselStore::new(TTL);
        let rec = record(333, 22.3964, 114.1095);
        store.put_vessel(rec.clone());

        let outcome = store.put_vessel(record(333, 22.3965, 114.1096));
        assert_eq!(outcome.old_tile, Some(rec.tile));
        assert_eq!(outcome.new_tile, rec.tile);
        assert_eq!(store.vessels_in_tile(rec.tile).len(), 1);
    }

    #[test]
    fn identical_puts_are_idempotent() {
        let store = VesselStore::new(TTL);
        let rec = record(444, 22.3964, 114.1095);
        let now = Instant::now();

        store.put_vessel_at(rec.clone(), now);
        store.put_vessel_at(rec.clone(), now);

        assert_eq!(store.vessels_in_tile_at(rec.tile, now), vec![rec]);
        assert_eq!(store.vessel_count_at(now), 1);
        assert_eq!(store.tile_count(), 1);
    }

    #[test]
    fn expired_records_read_as_absent() {
        let store = VesselStore::new(TTL);
        let rec = record(555, 22.3964, 114.1095);
        let t0 = Instant::now();
        store.put_vessel_at(rec.clone(), t0);

        let just_before = t0 + TTL - Duration::from_millis(1);
        assert_eq!(store.get_vessel_at(555, just_before), Some(rec.clone()));

        let at_deadline = t0 + TTL;
        assert_eq!(store.get_vessel_at(555, at_deadline), None);
        assert!(store.vessels_in_tile_at(rec.tile, at_deadline).is_empty());
        assert_eq!(store.vessel_count_at(at_deadline), 0);
    }

    #[test]
    fn a_fresh_put_refreshes_the_ttl() {
        let store = VesselStore::new(TTL);
        let rec = record(666, 22.3964, 114.1095);
        let t0 = Instant::now();

        store.put_vessel_at(rec.clone(), t0);
        let t1 = t0 + Duration::from_secs(100);
        store.put_vessel_at(rec.clone(), t1);

        // Would have expired at t0 + 120s without the refresh.
        let probe = t0 + Duration::from_secs(130);
        assert_eq!(store.get_vessel_at(666, probe), Some(rec));
    }

    #[test]
    fn reput_after_expiry_scrubs_stale_tile_membership() {
        let store = VesselStore::new(TTL);
        let first = record(777, 22.40, 114.11);
        let t0 = Instant::now();
        store.put_vessel_at(first.clone(), t0);

        // The record expires, then the vessel reappears in another tile
        // before any sweep ran.
        let later = t0 + TTL + Duration::from_secs(10);
        let second = record(777, 22.41, 114.20);
        let outcome = store.put_vessel_at(second.clone(), later);

        // The expired record does not count as an old tile, but its stale
        // membership is gone all the same.
        assert_eq!(outcome.old_tile, None);
        assert!(store.vessels_in_tile_at(first.tile, later).is_empty());
        assert_eq!(store.vessels_in_tile_at(second.tile, later), vec![second]);
    }

    #[test]
    fn sweep_drops_expired_vessels_and_empty_tiles() {
        let store = VesselStore::new(TTL);
        let t0 = Instant::now();
        store.put_vessel_at(record(111, 22.40, 114.11), t0);
        store.put_vessel_at(record(222, 22.41, 114.20), t0);

        let t1 = t0 + Duration::from_secs(60);
        store.put_vessel_at(record(333, 51.0, 1.0), t1);

        let swept = store.sweep_expired_at(t0 + TTL + Duration::from_secs(1));
        assert_eq!(swept, 2);
        assert_eq!(store.vessel_count_at(t0 + TTL + Duration::from_secs(1)), 1);
        assert_eq!(store.tile_count(), 1);
    }

    #[test]
    fn scan_pages_in_mmsi_order_until_exhausted() {
        let store = VesselStore::new(TTL);
        for mmsi in [50u64, 10, 40, 20, 30] {
            store.put_vessel(record(mmsi, 22.3964, 114.1095));
        }

        let (page, cursor) = store.scan_from(None, 2);
        assert_eq!(page.iter().map(|r| r.mmsi).collect::<Vec<_>>(), vec![10, 20]);
        let cursor = cursor.expect("more pages expected");
        assert_eq!(cursor, 20);

        let (page, cursor) = store.scan_from(Some(cursor), 2);
        assert_eq!(page.iter().map(|r| r.mmsi).collect::<Vec<_>>(), vec![30, 40]);
        let cursor = cursor.expect("more pages expected");

        let (page, cursor) = store.scan_from(Some(cursor), 2);
        assert_eq!(page.iter().map(|r| r.mmsi).collect::<Vec<_>>(), vec![50]);
        assert_eq!(cursor, None);
    }

    #[test]
    fn scan_skips_expired_records() {
        let store = VesselStore::new(TTL);
        let t0 = Instant::now();
        store.put_vessel_at(record(10, 22.40, 114.11), t0);
        let t1 = t0 + Duration::from_secs(60);
        store.put_vessel_at(record(20, 22.41, 114.20), t1);

        let probe = t0 + TTL + Duration::from_secs(1);
        let (page, cursor) = store.scan_from_at(None, 10, probe);
        assert_eq!(page.iter().map(|r| r.mmsi).collect::<Vec<_>>(), vec![20]);
        assert_eq!(cursor, None);
    }

    #[test]
    fn reverse_index_matches_vessel_tiles() {
        // mmsi in tileSets[T] exactly when the live record's tile is T.
        let store = VesselStore::new(TTL);
        let records = [
            record(1, 22.40, 114.11),
            record(2, 22.41, 114.20),
            record(3, 22.40, 114.11),
        ];
        for rec in &records {
            store.put_vessel(rec.clone());
        }
        store.put_vessel(record(3, 22.41, 114.20));

        for rec in [record(1, 22.40, 114.11), record(2, 22.41, 114.20)] {
            let in_tile = store.vessels_in_tile(rec.tile);
            assert!(in_tile.iter().any(|r| r.mmsi == rec.mmsi));
        }
        let t1 = tile_of(22.40, 114.11, 12);
        assert!(!store.vessels_in_tile(t1).iter().any(|r| r.mmsi == 3));
    }

    #[test]
    fn concurrent_writes_to_one_vessel_leave_a_single_membership() {
        use std::sync::Arc;

        let store = Arc::new(VesselStore::new(TTL));
        let a = record(999, 22.40, 114.11);
        let b = record(999, 22.41, 114.20);
        let (t1, t2) = (a.tile, b.tile);

        // Four writers ping-pong the same vessel between two tiles.
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                let rec = if i % 2 == 0 { a.clone() } else { b.clone() };
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        store.put_vessel(rec.clone());
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // Whichever write won, the vessel sits in exactly one tile set and
        // that set agrees with the record.
        let last = store.get_vessel(999).expect("vessel should be live");
        let in_t1 = store.vessels_in_tile(t1).iter().any(|r| r.mmsi == 999);
        let in_t2 = store.vessels_in_tile(t2).iter().any(|r| r.mmsi == 999);
        assert!(in_t1 ^ in_t2);
        assert_eq!(if in_t1 { t1 } else { t2 }, last.tile);
        assert_eq!(store.vessel_count(), 1);
    }

    #[test]
    fn parallel_writers_with_readers_converge_to_a_full_store() {
        use std::sync::Arc;

        let store = Arc::new(VesselStore::new(TTL));
        let tile = tile_of(22.3964, 114.1095, 12);

        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        store.put_vessel(record(1000 + w * 100 + i, 22.3964, 114.1095));
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        // Every snapshot is internally consistent: records
                        // returned for a tile really belong to it.
                        for rec in store.vessels_in_tile(tile) {
                            assert_eq!(rec.tile, tile);
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(store.vessel_count(), 400);
        assert_eq!(store.vessels_in_tile(tile).len(), 400);
    }

    #[test]
    fn dense_tile_snapshot_returns_every_vessel() {
        let store = VesselStore::new(TTL);
        let tile = tile_of(22.3964, 114.1095, 12);
        for i in 0..1200u64 {
            store.put_vessel(record(100_000 + i, 22.3964, 114.1095));
        }

        let snapshot = store.vessels_in_tile(tile);
        assert_eq!(snapshot.len(), 1200);
        // Ordered by MMSI for deterministic payloads.
        assert!(snapshot.windows(2).all(|w| w[0].mmsi < w[1].mmsi));
    }
}
