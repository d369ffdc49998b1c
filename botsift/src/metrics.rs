// botsift/src/metrics.rs
//
// Operational counters. Relaxed atomics bumped from the hot paths; read only
// for the periodic stats line and by tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::engine::partitioner::Partitioner;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub events_ingested:   AtomicU64,
    pub events_malformed:  AtomicU64,
    pub events_applied:    AtomicU64,
    pub events_replayed:   AtomicU64,
    pub events_discarded:  AtomicU64,
    pub events_stale:      AtomicU64,
    pub keys_drained:      AtomicU64,
    pub drain_failures:    AtomicU64,
    pub predictions:       AtomicU64,
    pub scorer_failures:   AtomicU64,
    pub cache_failures:    AtomicU64,
    pub sweeps:            AtomicU64,
    pub swept_keys:        AtomicU64,
    pub worker_restarts:   AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_ingested:   u64,
    pub events_malformed:  u64,
    pub events_applied:    u64,
    pub events_replayed:   u64,
    pub events_discarded:  u64,
    pub events_stale:      u64,
    pub keys_drained:      u64,
    pub drain_failures:    u64,
    pub predictions:       u64,
    pub scorer_failures:   u64,
    pub cache_failures:    u64,
    pub sweeps:            u64,
    pub swept_keys:        u64,
    pub worker_restarts:   u64,
}

impl EngineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let r = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_ingested:  r(&self.events_ingested),
            events_malformed: r(&self.events_malformed),
            events_applied:   r(&self.events_applied),
            events_replayed:  r(&self.events_replayed),
            events_discarded: r(&self.events_discarded),
            events_stale:     r(&self.events_stale),
            keys_drained:     r(&self.keys_drained),
            drain_failures:   r(&self.drain_failures),
            predictions:      r(&self.predictions),
            scorer_failures:  r(&self.scorer_failures),
            cache_failures:   r(&self.cache_failures),
            sweeps:           r(&self.sweeps),
            swept_keys:       r(&self.swept_keys),
            worker_restarts:  r(&self.worker_restarts),
        }
    }
}

/// Log a stats line every `interval` until shutdown.
pub async fn stats_loop(
    metrics:     Arc<EngineMetrics>,
    partitioner: Arc<Partitioner>,
    interval:    Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = Instant::now();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        let s = metrics.snapshot();
        let elapsed = start.elapsed().as_secs_f64().max(1.0);
        info!(
            uptime_s   = elapsed as u64,
            ingested   = s.events_ingested,
            eps        = %format!("{:.1}", s.events_ingested as f64 / elapsed),
            applied    = s.events_applied,
            malformed  = s.events_malformed,
            discarded  = s.events_discarded,
            drained    = s.keys_drained,
            failures   = s.drain_failures,
            predictions = s.predictions,
            scorer_failures = s.scorer_failures,
            owned_keys = partitioner.tracked_keys(),
            busy_workers = partitioner.busy_workers(),
            sweeps     = s.sweeps,
            restarts   = s.worker_restarts,
            "stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = EngineMetrics::new();
        EngineMetrics::incr(&m.events_ingested);
        EngineMetrics::add(&m.events_applied, 5);
        EngineMetrics::add(&m.events_applied, 0);
        let s = m.snapshot();
        assert_eq!(s.events_ingested, 1);
        assert_eq!(s.events_applied, 5);
        assert_eq!(s.sweeps, 0);
    }
}
