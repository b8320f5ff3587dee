use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use lib_common::tiles::MAX_ZOOM;

#[derive(Parser, Debug, Clone)]
pub struct Config {
    /// Credential for the upstream AIS feed.
    #[clap(long, env = "AISSTREAM_API_KEY", hide_env_values = true)]
    pub aisstream_api_key: String,

    #[clap(long, env = "AISSTREAM_URL", default_value = "wss://stream.aisstream.io/v0/stream")]
    pub aisstream_url: String,

    /// Upstream filter as "lat1,lon1,lat2,lon2;..." pairs of corners.
    #[clap(long, env = "AISSTREAM_BBOX")]
    pub aisstream_bbox: Option<String>,

    #[clap(long, env = "TILE_ZOOM", default_value_t = 12)]
    pub tile_zoom: u8,

    #[clap(long, env = "VESSEL_TTL_SECONDS", default_value_t = 120)]
    pub vessel_ttl_seconds: u64,

    #[clap(long, env = "BATCH_SYNC_INTERVAL_MS", default_value_t = 5000)]
    pub batch_sync_interval_ms: u64,

    #[clap(long, env = "BATCH_SYNC_SIZE", default_value_t = 1000)]
    pub batch_sync_size: usize,

    #[clap(long, env = "INGEST_FLUSH_MS", default_value_t = 1000)]
    pub ingest_flush_ms: u64,

    #[clap(long, env = "DISPATCH_FLUSH_MS", default_value_t = 500)]
    pub dispatch_flush_ms: u64,

    #[clap(long, env = "HEARTBEAT_MS", default_value_t = 30_000)]
    pub heartbeat_ms: u64,

    #[clap(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Durable mirror connection string. The batch synchronizer is disabled
    /// when unset.
    #[clap(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Seconds without any upstream traffic before the connection is
    /// treated as dead and rebuilt.
    #[clap(long, env = "UPSTREAM_SILENT_TIMEOUT_SECONDS", default_value_t = 60)]
    pub upstream_silent_timeout_seconds: u64,

    #[clap(long, env = "LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[clap(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
}

pub fn load_config() -> Result<Config> {
    let config = Config::parse();
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.tile_zoom > MAX_ZOOM {
        bail!("TILE_ZOOM {} exceeds the maximum of {}", config.tile_zoom, MAX_ZOOM);
    }
    if let Some(raw) = &config.aisstream_bbox {
        parse_bbox_filter(raw).context("invalid AISSTREAM_BBOX")?;
    }
    Ok(())
}

/// Parses the bounding-box filter string into corner pairs in the shape the
/// upstream subscription message expects: `[[[lat1, lon1], [lat2, lon2]], ...]`.
pub fn parse_bbox_filter(raw: &str) -> Result<Vec<[[f64; 2]; 2]>> {
    let mut boxes = Vec::new();
    for part in raw.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let fields: Vec<f64> = part
            .split(',')
            .map(|f| f.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("bounding box '{part}' has a non-numeric field"))?;
        if fields.len() != 4 {
            bail!("bounding box '{part}' must have exactly 4 fields");
        }
        let (lat1, lon1, lat2, lon2) = (fields[0], fields[1], fields[2], fields[3]);
        if !(-90.0..=90.0).contains(&lat1) || !(-90.0..=90.0).contains(&lat2) {
            bail!("bounding box '{part}' has a latitude outside [-90, 90]");
        }
        if !(-180.0..=180.0).contains(&lon1) || !(-180.0..=180.0).contains(&lon2) {
            bail!("bounding box '{part}' has a longitude outside [-180, 180]");
        }
        boxes.push([[lat1, lon1], [lat2, lon2]]);
    }
    if boxes.is_empty() {
        bail!("no bounding boxes in filter string");
    }
    Ok(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_box() {
        let boxes = parse_bbox_filter("22.1,113.8,22.6,114.5").unwrap();
        assert_eq!(boxes, vec![[[22.1, 113.8], [22.6, 114.5]]]);
    }

    #[test]
    fn parses_multiple_boxes_and_ignores_blank_segments() {
        let boxes = parse_bbox_filter("22.1,113.8,22.6,114.5; 50.0,-1.5,51.5,1.5;").unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[1], [[50.0, -1.5], [51.5, 1.5]]);
    }

    #[test]
    fn rejects_malformed_filters() {
        assert!(parse_bbox_filter("").is_err());
        assert!(parse_bbox_filter("22.1,113.8,22.6").is_err());
        assert!(parse_bbox_filter("a,b,c,d").is_err());
        assert!(parse_bbox_filter("91.0,0.0,22.0,10.0").is_err());
        assert!(parse_bbox_filter("22.0,181.0,23.0,10.0").is_err());
    }
}
