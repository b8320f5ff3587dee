use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::mpsc;

mod ais_logic;
use ais_logic::{batch_sync, config, dispatcher, downstream, logger, monitor, upstream};

use lib_common::connections::db_postgres::Database;
use lib_common::core::VesselStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const MAX_TILES_PER_SESSION: usize = 1500;
const DB_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config()?;
    logger::setup_logging(&config.log_dir, &config.log_level)?;
    logger::log_boot_config(&config);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let draining = Arc::new(AtomicBool::new(false));

    // Boot order: durable store, in-memory store, ingest, batch sync, HTTP
    // surface, dispatcher. Shutdown reverses it by draining everything at
    // once inside the grace window.
    let database = match &config.database_url {
        Some(url) => {
            // A lazy pool keeps an unreachable mirror from failing the
            // boot; batches retry tick by tick instead.
            let db = Database::connect_lazy(url, DB_MAX_CONNECTIONS)?;
            if let Err(e) = db.ensure_schema().await {
                log::error!("Durable store schema setup failed (will retry per batch): {}", e);
            }
            Some(db)
        }
        None => {
            log::warn!("DATABASE_URL not set, durable mirror disabled");
            None
        }
    };

    let store = Arc::new(VesselStore::new(Duration::from_secs(
        config.vessel_ttl_seconds,
    )));

    let (dirty_tx, dirty_rx) = mpsc::unbounded_channel::<dispatcher::DirtyTileBatch>();

    let upstream_handle = tokio::spawn(upstream::run(
        config.clone(),
        Arc::clone(&store),
        dirty_tx,
        shutdown_tx.subscribe(),
    ));

    let batch_sync_handle = database.map(|db| {
        tokio::spawn(batch_sync::run(
            db,
            Arc::clone(&store),
            config.batch_sync_interval_ms,
            config.batch_sync_size,
            shutdown_tx.subscribe(),
        ))
    });

    let dispatcher = Arc::new(dispatcher::Dispatcher::new(MAX_TILES_PER_SESSION));

    let downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        Arc::clone(&draining),
        shutdown_tx.clone(),
    ));

    let dispatcher_handle = tokio::spawn(dispatcher::Dispatcher::run(
        Arc::clone(&dispatcher),
        Arc::clone(&store),
        dirty_rx,
        config.dispatch_flush_ms,
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        config.heartbeat_ms,
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Refuse new connections, then drain everything within the grace window.
    draining.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(());

    let mut handles = vec![
        upstream_handle,
        downstream_handle,
        dispatcher_handle,
        monitor_handle,
    ];
    handles.extend(batch_sync_handle);

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        log::warn!(
            "Components did not drain within {}s, exiting anyway.",
            SHUTDOWN_GRACE.as_secs()
        );
    }

    log::info!("Shutdown complete.");
    Ok(())
}
