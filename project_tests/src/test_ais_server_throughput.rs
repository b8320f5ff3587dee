use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use lib_common::tiles::tiles_in_bounds;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Soak client for the AIS tile server", long_about = None)]
struct Args {
    /// WebSocket endpoint of a running server
    #[clap(long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Viewport to subscribe to, as north,south,east,west
    #[clap(long, default_value = "22.6,22.1,114.5,113.8")]
    viewport: String,

    /// Tile zoom of the server under test
    #[clap(long, default_value_t = 12)]
    zoom: u8,

    /// Report interval in minutes
    #[clap(short, long, default_value_t = 1)]
    report_interval_minutes: u64,
}

struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    tile_timestamps: HashMap<String, VecDeque<chrono::DateTime<Utc>>>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fields: Vec<f64> = args
        .viewport
        .split(',')
        .map(|f| f.trim().parse().expect("viewport fields must be numeric"))
        .collect();
    assert_eq!(fields.len(), 4, "viewport must be north,south,east,west");
    let tiles: Vec<String> = tiles_in_bounds(fields[0], fields[1], fields[2], fields[3], args.zoom)
        .iter()
        .map(|t| t.to_string())
        .collect();
    assert!(
        tiles.len() <= 1500,
        "viewport covers {} tiles, the server caps subscriptions at 1500",
        tiles.len()
    );

    let stats = Arc::new(Mutex::new(Stats {
        global_timestamps: VecDeque::new(),
        tile_timestamps: HashMap::new(),
    }));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_minutes * 60;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let now = Utc::now();
            let one_minute_ago = now - Duration::minutes(1);

            let mut data = stats_reporter.lock().unwrap();

            // Clean global
            while data
                .global_timestamps
                .front()
                .map_or(false, |&t| t < one_minute_ago)
            {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            // Clean per tile and collect rates
            let mut rates: Vec<(String, usize)> = Vec::new();
            for (tile, dq) in data.tile_timestamps.iter_mut() {
                while dq.front().map_or(false, |&t| t < one_minute_ago) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((tile.clone(), dq.len()));
                }
            }

            // Sort DESC by msg/min
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates
                .iter()
                .take(20)
                .map(|(t, r)| format!("{}: {} msg/min", t, r))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- 1-Minute Summary -----");
            println!("Global rate: {} msg/min", global_rate);
            println!(
                "Busiest tiles: {}",
                if report.is_empty() { "No data" } else { &report }
            );
            println!("----------------------------\n");
        }
    });

    // Main WebSocket Loop
    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(&args.url).await.expect("Failed to connect");
    let (mut write, mut read) = ws_stream.split();

    // Subscribe to the whole viewport
    let sub_msg = json!({ "type": "subscribe", "tiles": &tiles }).to_string();
    write
        .send(Message::Text(sub_msg.into()))
        .await
        .expect("Failed to send subscribe");
    println!("Subscribed to {} tiles. Press Ctrl+C to stop.", tiles.len());

    // Handle incoming messages
    while let Some(Ok(msg)) = read.next().await {
        if let Message::Text(text) = msg {
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            match parsed.get("type").and_then(|t| t.as_str()) {
                Some("vessel_update") => {
                    if let Some(tile) = parsed.get("tile").and_then(|t| t.as_str()) {
                        let now = Utc::now();
                        let mut data = stats.lock().unwrap();
                        data.global_timestamps.push_back(now);
                        data.tile_timestamps
                            .entry(tile.to_string())
                            .or_insert_with(VecDeque::new)
                            .push_back(now);
                    }
                }
                Some("connected") | Some("subscribed") => {
                    println!("Server: {}", text);
                }
                _ => {}
            }
        }
    }
}
