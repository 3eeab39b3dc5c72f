//! Periodic summary logging, grounded in the same loop-and-sleep heartbeat
//! pattern the rest of this codebase's daemons use, just emitting a
//! structured `tracing` event instead of touching a heartbeat file.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dsm_engine::stats::Stats;
use tracing::info;

/// Spawns a task that logs `stats` every `interval` until the returned
/// handle is dropped or aborted. A zero interval disables the heartbeat
/// entirely (the caller should simply not call this).
pub fn spawn(stats: Arc<Mutex<Stats>>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot = *stats.lock().unwrap();
            info!(
                faults = snapshot.faults,
                bytes_fetched = snapshot.bytes_fetched,
                bytes_evicted = snapshot.bytes_evicted,
                prefetch_hit_rate = ?snapshot.prefetch_hit_rate(),
                "heartbeat"
            );
        }
    })
}
