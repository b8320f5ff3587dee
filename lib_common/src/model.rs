//! Vessel domain model shared by the live pipeline and the durable mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tiles::TileKey;

/// The authoritative kinematic state of one vessel.
///
/// Keyed by MMSI. `tile` always equals the projection of `lat`/`lon` at the
/// pipeline's indexing zoom; the store maintains that invariant on every
/// write. In `vessel_update` payloads the enclosing message's tile is
/// authoritative when the two disagree (a vessel can be mid-transition
/// between tiles when the snapshot is taken).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselRecord {
    pub mmsi: u64,
    pub lat: f64,
    pub lon: f64,
    pub cog: Option<f64>,
    pub sog: Option<f64>,
    /// Bow direction in degrees, 0-359. The wire sentinel 511 ("not
    /// available") is mapped to `None` before a record is built.
    pub heading: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub tile: TileKey,
}
