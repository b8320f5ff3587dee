//! Upstream ingest client for the AIS position feed.
//!
//! Connection lifecycle is an explicit state machine:
//! DISCONNECTED -> CONNECTING -> SUBSCRIBED -> DISCONNECTED, driven by a
//! reconnect loop with exponential backoff. While subscribed, every accepted
//! position report is written to the store and the touched tiles accumulate
//! in a local dirty set, drained to the dispatcher on the ingest flush tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use lib_common::core::VesselStore;
use lib_common::tiles::TileKey;

use crate::ais_logic::config::{parse_bbox_filter, Config};
use crate::ais_logic::dispatcher::DirtyTileBatch;
use crate::ais_logic::model::{AisEnvelope, VesselPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Reconnect delay schedule: starts at 1 s, grows by 1.5x per failed cycle,
/// capped at 30 s. Reset on every successful connection.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
        }
    }

    /// The delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.mul_f64(self.factor);
        self.current = grown.min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.5, Duration::from_secs(30))
    }
}

/// Feed-health counters, logged at each flush tick.
#[derive(Debug, Default)]
pub struct IngestCounters {
    pub accepted: AtomicU64,
    pub parse_errors: AtomicU64,
    pub invalid: AtomicU64,
}

impl IngestCounters {
    fn snapshot_and_reset(&self) -> (u64, u64, u64) {
        (
            self.accepted.swap(0, Ordering::Relaxed),
            self.parse_errors.swap(0, Ordering::Relaxed),
            self.invalid.swap(0, Ordering::Relaxed),
        )
    }
}

/// Builds the subscription message sent right after the socket opens.
/// `BoundingBoxes` is omitted entirely when no filter is configured.
pub fn subscription_message(config: &Config) -> serde_json::Value {
    let mut msg = json!({
        "APIKey": config.aisstream_api_key,
        "FilterMessageTypes": ["PositionReport"],
    });
    if let Some(raw) = &config.aisstream_bbox {
        if let Ok(boxes) = parse_bbox_filter(raw) {
            msg["BoundingBoxes"] = json!(boxes);
        }
    }
    msg
}

pub async fn run(
    config: Config,
    store: Arc<VesselStore>,
    dirty_tx: mpsc::UnboundedSender<DirtyTileBatch>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut backoff = Backoff::default();
    let mut state;
    let counters = IngestCounters::default();
    let silent_timeout = Duration::from_secs(config.upstream_silent_timeout_seconds);

    loop {
        state = IngestState::Connecting;
        log::info!(
            "Ingest state {:?}, connecting to AIS feed: {}",
            state,
            config.aisstream_url
        );

        let connected = tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Ingest client shutting down before connect.");
                return;
            }
            result = connect_async(&config.aisstream_url) => result,
        };

        match connected {
            Ok((ws_stream, _)) => {
                let (mut write, mut read) = ws_stream.split();

                let subscribe = subscription_message(&config).to_string();
                if let Err(e) = write.send(WsMessage::Text(subscribe.into())).await {
                    log::error!("Failed to send AIS subscription: {}", e);
                } else {
                    state = IngestState::Subscribed;
                    backoff.reset();
                    log::info!("Ingest state {:?}, receiving AIS position reports", state);

                    let mut dirty: HashSet<TileKey> = HashSet::new();
                    let mut flush_tick =
                        interval(Duration::from_millis(config.ingest_flush_ms.max(1)));
                    let mut last_activity = Instant::now();

                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                log::info!("Ingest client shutting down...");
                                flush_dirty(&mut dirty, &dirty_tx, &counters);
                                let _ = write.close().await;
                                return;
                            }
                            _ = flush_tick.tick() => {
                                flush_dirty(&mut dirty, &dirty_tx, &counters);
                                if last_activity.elapsed() > silent_timeout {
                                    log::warn!(
                                        "No upstream traffic for {}s, forcing reconnect",
                                        silent_timeout.as_secs()
                                    );
                                    break;
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(WsMessage::Text(text))) => {
                                        last_activity = Instant::now();
                                        handle_text(&text, &config, &store, &mut dirty, &counters);
                                    }
                                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                                        last_activity = Instant::now();
                                    }
                                    Some(Ok(WsMessage::Close(_))) | None => {
                                        log::warn!("AIS feed closed the connection");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        log::error!("AIS feed read error: {}", e);
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                    // Pending dirty tiles survive the reconnect.
                    flush_dirty(&mut dirty, &dirty_tx, &counters);
                }
            }
            Err(e) => {
                log::error!("Failed to connect to AIS feed: {}", e);
            }
        }

        state = IngestState::Disconnected;
        let delay = backoff.next_delay();
        log::info!(
            "Ingest state {:?}, reconnecting in {:.2}s",
            state,
            delay.as_secs_f64()
        );
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Ingest client shutting down during backoff.");
                return;
            }
            _ = sleep(delay) => {}
        }
    }
}

/// Parses one feed message and, when it carries a usable position, writes
/// it through the store and records the touched tiles.
fn handle_text(
    text: &str,
    config: &Config,
    store: &VesselStore,
    dirty: &mut HashSet<TileKey>,
    counters: &IngestCounters,
) {
    let envelope: AisEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            counters.parse_errors.fetch_add(1, Ordering::Relaxed);
            log::debug!("Unparseable AIS message: {}", e);
            return;
        }
    };

    let is_position_report = envelope
        .message
        .as_ref()
        .map_or(false, |m| m.position_report.is_some());
    if !is_position_report {
        return;
    }

    let Some(position) = VesselPosition::from_envelope(&envelope, Utc::now()) else {
        counters.invalid.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let record = position.into_record(config.tile_zoom);
    let outcome = store.put_vessel(record);
    dirty.insert(outcome.new_tile);
    if let Some(old_tile) = outcome.old_tile {
        dirty.insert(old_tile);
    }
    counters.accepted.fetch_add(1, Ordering::Relaxed);
}

fn flush_dirty(
    dirty: &mut HashSet<TileKey>,
    dirty_tx: &mpsc::UnboundedSender<DirtyTileBatch>,
    counters: &IngestCounters,
) {
    let (accepted, parse_errors, invalid) = counters.snapshot_and_reset();
    if accepted + parse_errors + invalid > 0 {
        log::debug!(
            "Ingest flush: accepted={} parse_errors={} invalid={}",
            accepted,
            parse_errors,
            invalid
        );
    }

    if dirty.is_empty() {
        return;
    }
    let batch = DirtyTileBatch(dirty.drain().collect());
    if dirty_tx.send(batch).is_err() {
        log::warn!("Dispatcher channel closed, dropping dirty tiles");
    }
}
