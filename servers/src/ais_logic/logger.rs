//! Logging setup for the AIS tile server: fern dispatch to stdout plus a
//! timestamped file under `LOG_DIR`, with old-file cleanup on boot and a
//! redacted dump of the effective operator configuration.

use anyhow::Result;
use chrono::{DateTime, Local};
use std::fs;
use std::path::Path;

use crate::ais_logic::config::Config;

/// How many previous log files survive a boot.
const KEPT_LOG_FILES: usize = 1;

pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    cleanup_old_logs(log_dir, KEPT_LOG_FILES)?;

    let log_path = log_dir.join(log_file_name(Local::now()));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

/// Logs the configuration the server is actually running with, so a log
/// file is self-describing. The upstream credential is redacted.
pub fn log_boot_config(config: &Config) {
    log::info!("AIS feed: {}", config.aisstream_url);
    log::info!("AIS API key: {}", redact_secret(&config.aisstream_api_key));
    log::info!(
        "AIS bounding boxes: {}",
        config.aisstream_bbox.as_deref().unwrap_or("none (worldwide)")
    );
    log::info!(
        "Tile zoom {} | vessel TTL {}s | ingest flush {}ms | dispatch flush {}ms",
        config.tile_zoom,
        config.vessel_ttl_seconds,
        config.ingest_flush_ms,
        config.dispatch_flush_ms
    );
    log::info!(
        "Heartbeat {}ms | port {} | durable mirror: {}",
        config.heartbeat_ms,
        config.port,
        if config.database_url.is_some() {
            format!(
                "enabled (batch {} every {}ms)",
                config.batch_sync_size, config.batch_sync_interval_ms
            )
        } else {
            "disabled".to_string()
        }
    );
}

fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

fn log_file_name(now: DateTime<Local>) -> String {
    format!("server_ais_{}.log", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Masks a credential down to its last four characters.
fn redact_secret(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        let tail = &secret[secret.len() - 4..];
        format!("****{}", tail)
    }
}

/// Deletes all but the `keep` most recent `.log` files in the directory.
fn cleanup_old_logs(log_dir: &Path, keep: usize) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "log"))
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|e| {
        std::cmp::Reverse(
            e.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    for entry in entries.iter().skip(keep) {
        if let Err(e) = fs::remove_file(entry.path()) {
            eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e);
        }
    }

    Ok(())
}
