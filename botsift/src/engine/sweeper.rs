// botsift/src/engine/sweeper.rs
//
// Liveness sweeper. Re-discovers buffered keys whose wake signal was missed
// (startup races, events appended by a previous process, a worker restart)
// and routes them back through the partitioner. Assigning an owned key is a
// no-op apart from waking its owner.
//
// Between sweeps it waits for the pool's idle signal, but never longer than
// sweep_max_wait, and never sweeps more often than sweep_min_interval.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::EngineContext;
use crate::error::Result;
use crate::metrics::EngineMetrics;

pub async fn run(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let max_wait     = ctx.config.sweep_max_wait();
    let min_interval = ctx.config.sweep_min_interval();
    let mut last: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            return;
        }
        if let Some(at) = last {
            let since = at.elapsed();
            if since < min_interval {
                tokio::select! {
                    _ = tokio::time::sleep(min_interval - since) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }

        match sweep_once(&ctx).await {
            Ok(0) => debug!("sweep found nothing pending"),
            Ok(n) => info!(keys = n, "sweep re-routed pending keys"),
            Err(e) => warn!("sweep failed: {}", e),
        }
        last = Some(Instant::now());

        tokio::select! {
            _ = tokio::time::timeout(max_wait, ctx.idle.notified()) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// One pass: assign every key with buffered events. Returns the number of
/// keys found.
pub async fn sweep_once(ctx: &EngineContext) -> Result<usize> {
    let storage = Arc::clone(&ctx.storage);
    let limit = ctx.config.sweep_batch.max(1);
    let keys = tokio::task::spawn_blocking(move || storage.pending_keys(limit)).await??;

    let fresh = ctx.partitioner.assign_all(&keys);
    EngineMetrics::incr(&ctx.metrics.sweeps);
    EngineMetrics::add(&ctx.metrics.swept_keys, keys.len() as u64);
    if fresh > 0 {
        debug!(fresh, "sweep found unowned keys");
    }
    Ok(keys.len())
}
