use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Latitude beyond which the Web Mercator projection is undefined.
pub const MAX_MERCATOR_LAT: f64 = 85.0511287798066;

/// Zoom level used for tile indexing unless configured otherwise.
pub const DEFAULT_ZOOM: u8 = 12;

/// Highest zoom level the tile math supports.
pub const MAX_ZOOM: u8 = 18;

/// Errors produced when validating tile keys. Coordinates themselves never
/// error here: projection clamps latitude and normalizes longitude instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoordError {
    #[error("zoom {0} exceeds the supported maximum of {MAX_ZOOM}")]
    InvalidZoom(u8),
    #[error("malformed tile key '{0}', expected 'z/x/y'")]
    MalformedKey(String),
}

/// A slippy-map Web Mercator tile, rendered canonically as `"z/x/y"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

impl FromStr for TileKey {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoordError::MalformedKey(s.to_string());

        let mut parts = s.split('/');
        let z: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        let x: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        let y: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }

        if z > MAX_ZOOM {
            return Err(CoordError::InvalidZoom(z));
        }
        let n = 1u32 << z;
        if x >= n || y >= n {
            return Err(malformed());
        }

        Ok(TileKey { z, x, y })
    }
}

// Tile keys travel over the wire in their "z/x/y" text form.
impl Serialize for TileKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TileKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
