//! Wire types for both sides of the pipeline: the upstream aisstream
//! envelope and the downstream client protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lib_common::model::VesselRecord;
use lib_common::tiles::{self, TileKey};

// --- Upstream: aisstream envelope -------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct AisEnvelope {
    #[serde(rename = "MessageType")]
    pub message_type: Option<String>,
    #[serde(rename = "Message")]
    pub message: Option<AisMessage>,
    #[serde(rename = "MetaData")]
    pub metadata: Option<AisMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AisMessage {
    #[serde(rename = "PositionReport")]
    pub position_report: Option<PositionReport>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PositionReport {
    #[serde(rename = "UserID")]
    pub user_id: Option<u64>,
    #[serde(rename = "Latitude")]
    pub latitude: Option<f64>,
    #[serde(rename = "Longitude")]
    pub longitude: Option<f64>,
    #[serde(rename = "Cog")]
    pub cog: Option<f64>,
    #[serde(rename = "Sog")]
    pub sog: Option<f64>,
    #[serde(rename = "TrueHeading")]
    pub true_heading: Option<i64>,
}

/// Provider-side metadata. Fills in whatever the position report is missing.
#[derive(Debug, Default, Deserialize)]
pub struct AisMetadata {
    #[serde(rename = "MMSI")]
    pub mmsi: Option<u64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub time_utc: Option<String>,
}

/// Heading sentinel for "not available" on the wire.
pub const HEADING_UNAVAILABLE: i64 = 511;

/// A validated position extracted from one upstream message.
#[derive(Debug, Clone, PartialEq)]
pub struct VesselPosition {
    pub mmsi: u64,
    pub lat: f64,
    pub lon: f64,
    pub cog: Option<f64>,
    pub sog: Option<f64>,
    pub heading: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

impl VesselPosition {
    /// Extracts a position from an envelope, applying the metadata fallbacks
    /// and validation rules. Returns `None` for anything that is not a
    /// usable position report: missing/zero MMSI, missing or out-of-range
    /// coordinates.
    pub fn from_envelope(envelope: &AisEnvelope, now: DateTime<Utc>) -> Option<Self> {
        let report = envelope.message.as_ref()?.position_report.as_ref()?;
        let meta = envelope.metadata.as_ref();

        let mmsi = report
            .user_id
            .or_else(|| meta.and_then(|m| m.mmsi))
            .filter(|&m| m > 0)?;

        let lat = report.latitude.or_else(|| meta.and_then(|m| m.latitude))?;
        let lon = report.longitude.or_else(|| meta.and_then(|m| m.longitude))?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }

        let heading = report
            .true_heading
            .filter(|&h| h != HEADING_UNAVAILABLE && (0..=359).contains(&h))
            .map(|h| h as u16);

        let timestamp = meta
            .and_then(|m| m.time_utc.as_deref())
            .and_then(parse_time_utc)
            .unwrap_or(now);

        Some(Self {
            mmsi,
            lat,
            lon,
            cog: report.cog,
            sog: report.sog,
            heading,
            timestamp,
        })
    }

    pub fn into_record(self, zoom: u8) -> VesselRecord {
        let tile = tiles::tile_of(self.lat, self.lon, zoom);
        VesselRecord {
            mmsi: self.mmsi,
            lat: self.lat,
            lon: self.lon,
            cog: self.cog,
            sog: self.sog,
            heading: self.heading,
            timestamp: self.timestamp,
            tile,
        }
    }
}

/// Parses the provider's `time_utc` field. The feed emits Go's default
/// `time.String()` layout ("2024-01-01 12:00:00.000000000 +0000 UTC");
/// RFC 3339 is accepted as well.
pub fn parse_time_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let trimmed = raw.trim_end_matches(" UTC");
    DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

// --- Downstream: client protocol ---------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { tiles: Vec<String> },
    Unsubscribe { tiles: Vec<String> },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        client_id: String,
        message: String,
    },
    Subscribed {
        tiles: Vec<TileKey>,
        message: String,
    },
    Unsubscribed {
        tiles: Vec<TileKey>,
        message: String,
    },
    /// The enclosing `tile` is authoritative; each vessel echoes its own
    /// tile, which can lag during a tile transition.
    VesselUpdate {
        tile: TileKey,
        vessels: Vec<VesselRecord>,
    },
    Pong,
}

impl ServerMessage {
    /// Whether the bounded outbound queue may shed this message under
    /// pressure. Only tile updates are expendable; acks and the hello are
    /// not.
    pub fn is_droppable(&self) -> bool {
        matches!(self, ServerMessage::VesselUpdate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn envelope(raw: &str) -> AisEnvelope {
        serde_json::from_str(raw).expect("envelope should parse")
    }

    const FULL_REPORT: &str = r#"{
        "MessageType": "PositionReport",
        "Message": {
            "PositionReport": {
                "UserID": 477995000,
                "Latitude": 22.3964,
                "Longitude": 114.1095,
                "Cog": 45.0,
                "Sog": 12.3,
                "TrueHeading": 50
            }
        },
        "MetaData": {
            "MMSI": 477995000,
            "latitude": 22.3964,
            "longitude": 114.1095,
            "time_utc": "2024-01-01 12:00:00.000000000 +0000 UTC"
        }
    }"#;

    #[test]
    fn extracts_a_full_position_report() {
        let pos = VesselPosition::from_envelope(&envelope(FULL_REPORT), now()).unwrap();
        assert_eq!(pos.mmsi, 477995000);
        assert_eq!(pos.lat, 22.3964);
        assert_eq!(pos.lon, 114.1095);
        assert_eq!(pos.cog, Some(45.0));
        assert_eq!(pos.sog, Some(12.3));
        assert_eq!(pos.heading, Some(50));
        assert_eq!(
            pos.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn heading_sentinel_511_maps_to_none() {
        let raw = r#"{
            "Message": {"PositionReport": {
                "UserID": 111, "Latitude": 0.0, "Longitude": 0.0, "TrueHeading": 511
            }}
        }"#;
        let pos = VesselPosition::from_envelope(&envelope(raw), now()).unwrap();
        assert_eq!(pos.heading, None);

        let record = pos.into_record(12);
        assert_eq!(record.tile, "12/2048/2048".parse().unwrap());
        assert_eq!(record.heading, None);
    }

    #[test]
    fn out_of_band_headings_map_to_none() {
        for bad in [-1i64, 360, 510] {
            let raw = format!(
                r#"{{"Message": {{"PositionReport": {{
                    "UserID": 111, "Latitude": 1.0, "Longitude": 1.0, "TrueHeading": {bad}
                }}}}}}"#
            );
            let pos = VesselPosition::from_envelope(&envelope(&raw), now()).unwrap();
            assert_eq!(pos.heading, None, "heading {bad} should be unavailable");
        }
    }

    #[test]
    fn metadata_fills_missing_report_fields() {
        let raw = r#"{
            "Message": {"PositionReport": {"Cog": 12.0}},
            "MetaData": {
                "MMSI": 229876000,
                "latitude": 59.9,
                "longitude": 10.7,
                "time_utc": "2024-03-05T08:30:00Z"
            }
        }"#;
        let pos = VesselPosition::from_envelope(&envelope(raw), now()).unwrap();
        assert_eq!(pos.mmsi, 229876000);
        assert_eq!(pos.lat, 59.9);
        assert_eq!(pos.lon, 10.7);
        assert_eq!(
            pos.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 5, 8, 30, 0).unwrap()
        );
    }

    #[test]
    fn missing_or_zero_mmsi_is_dropped() {
        let no_mmsi = r#"{"Message": {"PositionReport": {"Latitude": 1.0, "Longitude": 1.0}}}"#;
        assert!(VesselPosition::from_envelope(&envelope(no_mmsi), now()).is_none());

        let zero = r#"{
            "Message": {"PositionReport": {"UserID": 0, "Latitude": 1.0, "Longitude": 1.0}}
        }"#;
        assert!(VesselPosition::from_envelope(&envelope(zero), now()).is_none());
    }

    #[test]
    fn out_of_range_coordinates_are_dropped() {
        for (lat, lon) in [(91.0, 0.0), (-91.0, 0.0), (0.0, 181.0), (0.0, -181.0)] {
            let raw = format!(
                r#"{{"Message": {{"PositionReport": {{
                    "UserID": 111, "Latitude": {lat}, "Longitude": {lon}
                }}}}}}"#
            );
            assert!(
                VesselPosition::from_envelope(&envelope(&raw), now()).is_none(),
                "({lat}, {lon}) should be rejected"
            );
        }
    }

    #[test]
    fn timestamp_defaults_to_now_when_absent() {
        let raw = r#"{"Message": {"PositionReport": {
            "UserID": 111, "Latitude": 1.0, "Longitude": 1.0
        }}}"#;
        let pos = VesselPosition::from_envelope(&envelope(raw), now()).unwrap();
        assert_eq!(pos.timestamp, now());
    }

    #[test]
    fn non_position_messages_yield_nothing() {
        let raw = r#"{"MessageType": "ShipStaticData", "Message": {}}"#;
        assert!(VesselPosition::from_envelope(&envelope(raw), now()).is_none());
    }

    #[test]
    fn parses_go_and_rfc3339_timestamps() {
        let go = parse_time_utc("2024-01-01 12:00:00.000000000 +0000 UTC").unwrap();
        let rfc = parse_time_utc("2024-01-01T12:00:00Z").unwrap();
        assert_eq!(go, rfc);
        assert!(parse_time_utc("yesterday").is_none());
    }

    #[test]
    fn client_messages_deserialize_from_tagged_json() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","tiles":["12/3346/1786"]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                tiles: vec!["12/3346/1786".to_string()]
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn server_messages_serialize_with_wire_field_names() {
        let connected = ServerMessage::Connected {
            client_id: "client-7".to_string(),
            message: "connected".to_string(),
        };
        let json = serde_json::to_value(&connected).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["clientId"], "client-7");

        let update = ServerMessage::VesselUpdate {
            tile: "12/2048/2048".parse().unwrap(),
            vessels: vec![],
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "vessel_update");
        assert_eq!(json["tile"], "12/2048/2048");
        assert_eq!(json["vessels"], serde_json::json!([]));

        assert_eq!(
            serde_json::to_string(&ServerMessage::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );
    }

    #[test]
    fn only_vessel_updates_are_droppable() {
        assert!(ServerMessage::VesselUpdate {
            tile: "12/0/0".parse().unwrap(),
            vessels: vec![]
        }
        .is_droppable());
        assert!(!ServerMessage::Pong.is_droppable());
        assert!(!ServerMessage::Subscribed {
            tiles: vec![],
            message: String::new()
        }
        .is_droppable());
    }
}
