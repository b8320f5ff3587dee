//! Web Mercator tile math
//!
//! Conversions between geographic coordinates (latitude/longitude) and the
//! slippy-map tiles the live pipeline is indexed by. All functions are pure;
//! callers own validation policy (the ingest path rejects out-of-range
//! coordinates before projecting, so projection itself clamps rather than
//! errors).

mod types;

pub use types::{CoordError, TileKey, DEFAULT_ZOOM, MAX_MERCATOR_LAT, MAX_ZOOM};

use std::f64::consts::PI;

/// Clamps a latitude into the range the Web Mercator projection covers.
#[inline]
pub fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT)
}

/// Normalizes a longitude into [-180, 180).
///
/// +180 and -180 land on the same meridian, so both map into the same tile
/// column.
#[inline]
pub fn normalize_lon(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Projects geographic coordinates onto the tile containing them.
///
/// Latitude is clamped to the Mercator range and longitude normalized into
/// [-180, 180) first, so the function is total over finite inputs.
#[inline]
pub fn tile_of(lat: f64, lon: f64, zoom: u8) -> TileKey {
    let lat = clamp_lat(lat);
    let lon = normalize_lon(lon);

    let n = 2.0_f64.powi(zoom as i32);
    let max_index = (1u32 << zoom) - 1;

    let x = ((lon + 180.0) / 360.0 * n) as u32;

    let lat_rad = lat * PI / 180.0;
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n) as u32;

    // Floating point can round the extreme row/column onto 2^z.
    TileKey::new(zoom, x.min(max_index), y.min(max_index))
}

/// Geographic coordinates of a tile's northwest corner.
#[inline]
pub fn tile_northwest(tile: TileKey) -> (f64, f64) {
    let n = 2.0_f64.powi(tile.z as i32);

    let lon = tile.x as f64 / n * 360.0 - 180.0;

    let y = tile.y as f64 / n;
    let lat_rad = (PI * (1.0 - 2.0 * y)).sinh().atan();
    let lat = lat_rad * 180.0 / PI;

    (lat, lon)
}

/// Bounding box of a tile as (north, south, east, west).
pub fn tile_bounds(tile: TileKey) -> (f64, f64, f64, f64) {
    let (north, west) = tile_northwest(tile);
    let (south, east) = tile_northwest(TileKey::new(tile.z, tile.x + 1, tile.y + 1));
    (north, south, east, west)
}

/// The rectangle of tiles covering a viewport.
///
/// Callers cap the result; viewports spanning more than 1500 tiles are
/// rejected downstream rather than here.
pub fn tiles_in_bounds(north: f64, south: f64, east: f64, west: f64, zoom: u8) -> Vec<TileKey> {
    let nw = tile_of(north.max(south), west.min(east), zoom);
    let se = tile_of(north.min(south), west.max(east), zoom);

    let mut tiles = Vec::with_capacity(
        ((se.x - nw.x + 1) as usize).saturating_mul((se.y - nw.y + 1) as usize),
    );
    for x in nw.x..=se.x {
        for y in nw.y..=se.y {
            tiles.push(TileKey::new(zoom, x, y));
        }
    }
    tiles
}

/// Encodes the zoom-12 tile of a coordinate pair as `x * 4096 + y`.
///
/// The durable mirror indexes on this value; it is always computed at zoom
/// 12 regardless of the zoom the live pipeline runs at, since `x * 4096 + y`
/// only decodes uniquely when both components are below 4096.
#[inline]
pub fn tile_z12(lat: f64, lon: f64) -> i32 {
    let tile = tile_of(lat, lon, 12);
    (tile.x * 4096 + tile.y) as i32
}
