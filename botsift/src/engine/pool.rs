// botsift/src/engine/pool.rs
//
// Worker pool. Each slot runs one worker loop under a supervisor that
// restarts it if it panics; ownership records live in the partitioner, so a
// restarted worker picks up exactly the keys its predecessor held.
//
// Worker loop:
//   wait   snapshot owned keys, count their pending events. Keys with zero
//          pending are released (epoch guarded). If nothing is pending, park
//          on the slot's wake signal or an exponential backoff timer
//          (initial → doubling → max), whichever fires first. A wake resets
//          the backoff.
//   drain  for each key in the snapshot, run drain transactions until the
//          key's buffer is empty, then classify if new deltas were recorded.
//          One key's failure is logged and the loop moves on. A failed key
//          is held back from the next drains on its own exponential backoff
//          (same initial and max as the wait timer) until a drain succeeds.
//   settle release keys left with zero pending, then raise the sweeper's
//          idle signal.
//
// Shutdown is observed only while waiting, so a drain or scorer call in
// progress always completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::partitioner::WorkerId;
use super::EngineContext;
use crate::cache;
use crate::classifier::FeatureVector;
use crate::error::{ErrorKind, Result};
use crate::events::{ClassLabel, Key};
use crate::metrics::EngineMetrics;
use crate::state::KeyState;

const RESTART_DELAY: Duration = Duration::from_millis(100);

/// Spawn one supervised worker per partitioner slot.
pub fn spawn(ctx: Arc<EngineContext>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    (0..ctx.partitioner.workers())
        .map(|id| tokio::spawn(supervise(id, Arc::clone(&ctx), shutdown.clone())))
        .collect()
}

async fn supervise(id: WorkerId, ctx: Arc<EngineContext>, shutdown: watch::Receiver<bool>) {
    loop {
        let worker = Worker::new(id, Arc::clone(&ctx), shutdown.clone());
        match tokio::spawn(worker.run()).await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                EngineMetrics::incr(&ctx.metrics.worker_restarts);
                error!(worker = id, "worker panicked, restarting: {}", e);
                if *shutdown.borrow() {
                    return;
                }
                tokio::time::sleep(RESTART_DELAY).await;
            }
            Err(e) => {
                warn!(worker = id, "worker cancelled: {}", e);
                return;
            }
        }
    }
}

/// Drain failures for one key since its last successful drain.
#[derive(Debug, Clone, Copy)]
struct Retry {
    failures:   u32,
    not_before: Instant,
}

pub(crate) struct Worker {
    id:       WorkerId,
    ctx:      Arc<EngineContext>,
    shutdown: watch::Receiver<bool>,
    retries:  HashMap<Key, Retry>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, ctx: Arc<EngineContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self { id, ctx, shutdown, retries: HashMap::new() }
    }

    pub(crate) async fn run(mut self) {
        debug!(worker = self.id, "worker up");
        while let Some(snapshot) = self.wait_for_work().await {
            for key in &snapshot {
                self.process_key(key).await;
            }
            let owned = self.ctx.partitioner.snapshot(self.id);
            if let Err(e) = self.settle(owned).await {
                warn!(worker = self.id, "post-drain settle failed: {}", e);
            }
            self.ctx.idle.notify_one();
        }
        debug!(worker = self.id, "worker down");
    }

    /// Park until at least one owned key has pending events. Returns the keys
    /// with work, or None on shutdown.
    async fn wait_for_work(&mut self) -> Option<Vec<Key>> {
        let initial = self.ctx.config.backoff_initial();
        let max     = self.ctx.config.backoff_max();
        let mut backoff = initial;

        loop {
            if *self.shutdown.borrow() {
                return None;
            }

            let owned = self.ctx.partitioner.snapshot(self.id);
            self.retries.retain(|k, _| owned.iter().any(|(o, _)| o == k));
            let mut nap = backoff;

            if !owned.is_empty() {
                let before = owned.len();
                match self.settle(owned).await {
                    Ok(busy) if busy.is_empty() => {
                        debug!(worker = self.id, released = before, "owned keys drained elsewhere");
                        self.ctx.idle.notify_one();
                    }
                    Ok(busy) => {
                        let now = Instant::now();
                        let (ready, held): (Vec<_>, Vec<_>) =
                            busy.into_iter().partition(|k| self.retry_due(k, now));
                        if !ready.is_empty() {
                            return Some(ready);
                        }
                        let next = held
                            .iter()
                            .filter_map(|k| self.retries.get(k))
                            .map(|r| r.not_before)
                            .min();
                        if let Some(at) = next {
                            nap = nap.min(at.saturating_duration_since(now));
                        }
                    }
                    Err(e) => warn!(worker = self.id, "pending count failed: {}", e),
                }
            }

            let partitioner = Arc::clone(&self.ctx.partitioner);
            tokio::select! {
                _ = partitioner.notified(self.id) => backoff = initial,
                _ = tokio::time::sleep(nap) => backoff = (backoff * 2).min(max),
                _ = self.shutdown.changed() => return None,
            }
        }
    }

    fn retry_due(&self, key: &Key, now: Instant) -> bool {
        self.retries.get(key).map_or(true, |r| r.not_before <= now)
    }

    fn hold_back(&mut self, key: &Key) -> Retry {
        let initial = self.ctx.config.backoff_initial();
        let max     = self.ctx.config.backoff_max();
        let failures = self.retries.get(key).map_or(0, |r| r.failures) + 1;
        let delay = initial
            .checked_mul(1u32 << (failures - 1).min(16))
            .map_or(max, |d| d.min(max));
        let retry = Retry { failures, not_before: Instant::now() + delay };
        self.retries.insert(key.clone(), retry);
        retry
    }

    /// Count pending events for `owned`, release keys at zero and return the
    /// rest.
    async fn settle(&self, owned: Vec<(Key, u64)>) -> Result<Vec<Key>> {
        if owned.is_empty() {
            return Ok(Vec::new());
        }
        let storage = Arc::clone(&self.ctx.storage);
        let counted = tokio::task::spawn_blocking(move || {
            owned
                .into_iter()
                .map(|(key, epoch)| storage.pending_count(&key).map(|n| (key, epoch, n)))
                .collect::<Result<Vec<_>>>()
        })
        .await??;

        let mut busy = Vec::new();
        for (key, epoch, pending) in counted {
            if pending > 0 {
                busy.push(key);
            } else {
                self.ctx.partitioner.release(self.id, &key, epoch);
            }
        }
        Ok(busy)
    }

    async fn process_key(&mut self, key: &Key) {
        match self.drain(key).await {
            Ok(drained) => {
                self.retries.remove(key);
                if let Some(state) = drained {
                    self.classify(key, &state).await;
                }
            }
            Err(e) => {
                EngineMetrics::incr(&self.ctx.metrics.drain_failures);
                let retry = self.hold_back(key);
                match e.kind() {
                    ErrorKind::Invariant => error!(
                        worker = self.id, key = %key, failures = retry.failures,
                        "drain aborted: {}", e
                    ),
                    kind => warn!(
                        worker = self.id, key = %key, %kind, failures = retry.failures,
                        "drain failed, events stay buffered: {}", e
                    ),
                }
            }
        }
    }

    /// Drain every pending event for `key`. Returns the final state when new
    /// deltas were recorded (the classifier's trigger).
    async fn drain(&self, key: &Key) -> Result<Option<KeyState>> {
        let batch = self.ctx.config.drain_batch;
        let m = &self.ctx.metrics;
        let mut deltas = 0;
        let mut last = None;

        loop {
            let storage = Arc::clone(&self.ctx.storage);
            let k = key.clone();
            let out = tokio::task::spawn_blocking(move || storage.drain_key(&k, batch)).await??;
            if out.rows == 0 {
                break;
            }

            EngineMetrics::add(&m.events_applied, (out.deltas + out.counted + out.stale) as u64);
            EngineMetrics::add(&m.events_replayed, out.replayed as u64);
            EngineMetrics::add(&m.events_discarded, out.discarded as u64);
            EngineMetrics::add(&m.events_stale, out.stale as u64);
            EngineMetrics::add(&m.events_malformed, out.malformed as u64);
            if out.discarded > 0 {
                debug!(key = %key, discarded = out.discarded, "out-of-order page views dropped");
            }

            deltas += out.deltas;
            let more = out.more;
            last = Some(out.state);
            if !more {
                break;
            }
        }

        if last.is_some() {
            EngineMetrics::incr(&m.keys_drained);
        }
        Ok(if deltas > 0 { last } else { None })
    }

    /// Score `state`, publish the verdict and persist it. Skipped for this
    /// cycle when any external service is unavailable.
    async fn classify(&self, key: &Key, state: &KeyState) {
        let Some(bridge) = self.ctx.classifier.as_ref() else {
            return;
        };
        let Some(features) = FeatureVector::from_state(state) else {
            return;
        };

        let mut label = state.class_label.filter(|l| *l != ClassLabel::Unknown);
        if label.is_none() {
            if let Some(ua) = state.user_agents.front() {
                label = bridge.label_for(ua).await.filter(|l| *l != ClassLabel::Unknown);
            }
        }
        if let Some(l) = label {
            bridge.teach(l, &features).await;
        }

        let Some(prediction) = bridge.score(&features).await else {
            EngineMetrics::incr(&self.ctx.metrics.scorer_failures);
            return;
        };
        EngineMetrics::incr(&self.ctx.metrics.predictions);
        let verdict = ClassLabel::from_prediction(prediction);

        if let Some(c) = self.ctx.cache.as_ref() {
            let limit = self.ctx.config.cache_timeout();
            if let Err(e) = cache::publish(c.as_ref(), key, verdict, limit).await {
                EngineMetrics::incr(&self.ctx.metrics.cache_failures);
                warn!(key = %key, "verdict not published: {}", e);
            }
        }

        let storage = Arc::clone(&self.ctx.storage);
        let k = key.clone();
        let persisted = tokio::task::spawn_blocking(move || {
            storage.record_prediction(&k, Some(prediction), label)
        })
        .await;
        match persisted {
            Ok(Ok(())) => info!(key = %key, prediction, %verdict, "classified"),
            Ok(Err(e)) => warn!(key = %key, "prediction not persisted: {}", e),
            Err(e)     => warn!(key = %key, "prediction not persisted: {}", e),
        }
    }
}
