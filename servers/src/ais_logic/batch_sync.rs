//! Periodic synchronizer from the in-memory store to the durable mirror.
//!
//! Each tick advances an MMSI-ordered cursor through the store and pushes
//! one bounded batch into PostGIS. A full pass over the store is allowed to
//! span several ticks; a failed batch is logged and the next tick simply
//! scans on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::interval;

use lib_common::connections::db_postgres::Database;
use lib_common::core::VesselStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub scanned: usize,
    pub upserted: u64,
    pub errors: u32,
    pub duration_ms: u64,
}

pub async fn run(
    db: Database,
    store: Arc<VesselStore>,
    interval_ms: u64,
    batch_size: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = interval(Duration::from_millis(interval_ms.max(1)));
    let mut cursor: Option<u64> = None;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Batch synchronizer shutting down.");
                break;
            }
            _ = tick.tick() => {
                let stats = sync_once(&db, &store, &mut cursor, batch_size).await;
                if stats.scanned > 0 || stats.errors > 0 {
                    log::info!(
                        "Batch sync: scanned={} upserted={} errors={} duration_ms={}",
                        stats.scanned,
                        stats.upserted,
                        stats.errors,
                        stats.duration_ms
                    );
                }
            }
        }
    }
}

async fn sync_once(
    db: &Database,
    store: &VesselStore,
    cursor: &mut Option<u64>,
    batch_size: usize,
) -> SyncStats {
    let started = Instant::now();
    let (records, next_cursor) = store.scan_from(*cursor, batch_size);
    *cursor = next_cursor;

    let mut stats = SyncStats {
        scanned: records.len(),
        ..SyncStats::default()
    };
    if records.is_empty() {
        return stats;
    }

    match db.upsert_batch(&records).await {
        Ok(rows) => stats.upserted = rows,
        Err(e) => {
            stats.errors = 1;
            log::error!("Batch upsert failed for {} vessels: {}", records.len(), e);
        }
    }
    stats.duration_ms = started.elapsed().as_millis() as u64;
    stats
}
