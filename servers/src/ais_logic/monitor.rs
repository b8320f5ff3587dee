//! Heartbeat and housekeeping ticker.
//!
//! Every `HEARTBEAT_MS` the monitor pings each session through its outbound
//! queue and terminates the sessions that produced no traffic since the
//! previous tick. The same tick runs the store's expiry sweep; correctness
//! does not depend on it (reads filter expired entries themselves), it just
//! bounds memory between updates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;

use lib_common::core::VesselStore;

use crate::ais_logic::dispatcher::{Dispatcher, Outbound};
use crate::ais_logic::downstream::CLOSE_HEARTBEAT_TIMEOUT;

pub async fn run(
    heartbeat_ms: u64,
    store: Arc<VesselStore>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = interval(Duration::from_millis(heartbeat_ms.max(1)));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = tick.tick() => {
                let expired = dispatcher.heartbeat_sweep();
                for session in expired {
                    log::warn!("Client {} missed its heartbeat, terminating", session.id);
                    session.queue.push(Outbound::Close {
                        code: CLOSE_HEARTBEAT_TIMEOUT,
                        reason: "Heartbeat timeout",
                    });
                    dispatcher.unregister(session.id);
                }

                let swept = store.sweep_expired();
                log::debug!(
                    "Monitor tick: {} sessions, {} subscribed tiles, {} vessels ({} expired)",
                    dispatcher.session_count(),
                    dispatcher.subscribed_tile_count(),
                    store.vessel_count(),
                    swept
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais_logic::dispatcher::SessionHandle;
    use tokio::time::timeout;

    #[tokio::test]
    async fn silent_sessions_are_terminated_after_one_missed_interval() {
        let store = Arc::new(VesselStore::new(Duration::from_secs(120)));
        let dispatcher = Arc::new(Dispatcher::new(1500));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        // The session never answers the ping, so the second sweep kills it.
        let session = Arc::new(SessionHandle::new(1, 16));
        dispatcher.register(Arc::clone(&session));

        let task = tokio::spawn(run(
            10,
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            shutdown_tx.subscribe(),
        ));

        let first = timeout(Duration::from_secs(1), session.queue.pop())
            .await
            .expect("first sweep should ping");
        assert_eq!(first, Outbound::Ping);

        let second = timeout(Duration::from_secs(1), session.queue.pop())
            .await
            .expect("second sweep should terminate");
        assert_eq!(
            second,
            Outbound::Close {
                code: CLOSE_HEARTBEAT_TIMEOUT,
                reason: "Heartbeat timeout"
            }
        );
        assert_eq!(dispatcher.session_count(), 0);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn responsive_sessions_keep_getting_pinged() {
        let store = Arc::new(VesselStore::new(Duration::from_secs(120)));
        let dispatcher = Arc::new(Dispatcher::new(1500));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let session = Arc::new(SessionHandle::new(1, 16));
        dispatcher.register(Arc::clone(&session));

        let task = tokio::spawn(run(
            100,
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            shutdown_tx.subscribe(),
        ));

        for _ in 0..3 {
            let item = timeout(Duration::from_secs(2), session.queue.pop())
                .await
                .expect("sweep should ping");
            assert_eq!(item, Outbound::Ping);
            // Answer every ping the way inbound traffic would.
            session
                .alive
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }
        assert_eq!(dispatcher.session_count(), 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
