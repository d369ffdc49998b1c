// botsift/src/engine/mod.rs
//
// Engine wiring.
//
//   ingest ──append──▶ storage ◀──drain── worker pool ──▶ classifier ──▶ cache
//      │                  ▲                  ▲
//      └──assign/wake──▶ partitioner ◀──assign── sweeper
//
// Ingestion always appends to the durable buffer before it touches the
// partitioner, so any event a worker can be told about is already on disk.

pub mod partitioner;
pub mod pool;
pub mod sweeper;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::PredictionCache;
use crate::classifier::Classifier;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{IngestRecord, Key, LogEvent};
use crate::metrics::EngineMetrics;
use crate::storage::Storage;

use partitioner::Partitioner;

/// Everything the background tasks share.
pub struct EngineContext {
    pub config:      EngineConfig,
    pub storage:     Arc<Storage>,
    pub partitioner: Arc<Partitioner>,
    pub classifier:  Option<Classifier>,
    pub cache:       Option<Arc<dyn PredictionCache>>,
    pub metrics:     Arc<EngineMetrics>,
    /// Raised by workers after each drain cycle; the sweeper waits on it.
    pub idle:        Notify,
}

/// Outcome of one ingestion batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted:  usize,
    pub malformed: usize,
    pub new_keys:  usize,
}

pub struct Engine {
    ctx: Arc<EngineContext>,
}

impl Engine {
    pub fn new(
        config:     EngineConfig,
        storage:    Arc<Storage>,
        classifier: Option<Classifier>,
        cache:      Option<Arc<dyn PredictionCache>>,
    ) -> Self {
        let partitioner = Arc::new(Partitioner::new(config.workers));
        Self {
            ctx: Arc::new(EngineContext {
                config,
                storage,
                partitioner,
                classifier,
                cache,
                metrics: EngineMetrics::new(),
                idle:    Notify::new(),
            }),
        }
    }

    /// Open storage from `config` and build the classifier it names.
    pub fn open(config: EngineConfig, cache: Option<Arc<dyn PredictionCache>>) -> Result<Self> {
        let storage = Arc::new(Storage::open(
            &config.database_path,
            config.db_connections,
            config.storage_retries,
        )?);
        let classifier = Classifier::from_config(&config.scorer);
        Ok(Self::new(config, storage, classifier, cache))
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.ctx.storage
    }

    pub fn partitioner(&self) -> &Arc<Partitioner> {
        &self.ctx.partitioner
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.ctx.metrics
    }

    /// Validate, buffer and route a batch from the ingestion boundary.
    /// Malformed records are dropped and counted; an append failure returns
    /// the error with nothing buffered, so the caller can resubmit the batch.
    pub async fn ingest(&self, records: Vec<IngestRecord>) -> Result<IngestReport> {
        let mut events = Vec::with_capacity(records.len());
        let mut malformed = 0;
        for rec in records {
            match rec.into_event() {
                Ok(ev) => events.push(ev),
                Err(e) => {
                    warn!("dropping record: {}", e);
                    malformed += 1;
                }
            }
        }
        EngineMetrics::add(&self.ctx.metrics.events_malformed, malformed as u64);

        let (accepted, new_keys) = self.buffer_and_route(events).await?;
        Ok(IngestReport { accepted, malformed, new_keys })
    }

    /// Buffer and route already validated events.
    pub async fn ingest_events(&self, events: Vec<LogEvent>) -> Result<usize> {
        Ok(self.buffer_and_route(events).await?.0)
    }

    async fn buffer_and_route(&self, events: Vec<LogEvent>) -> Result<(usize, usize)> {
        if events.is_empty() {
            return Ok((0, 0));
        }
        let keys: Vec<Key> = {
            let mut seen = HashSet::new();
            events
                .iter()
                .filter(|e| seen.insert(&e.key))
                .map(|e| e.key.clone())
                .collect()
        };

        let storage = Arc::clone(&self.ctx.storage);
        let written = tokio::task::spawn_blocking(move || storage.append(&events)).await??;
        EngineMetrics::add(&self.ctx.metrics.events_ingested, written as u64);

        let fresh = self.ctx.partitioner.assign_all(&keys);
        Ok((written, fresh))
    }

    /// Spawn the worker pool and the sweeper.
    pub fn start(&self) -> EngineHandle {
        let (tx, rx) = watch::channel(false);
        let workers = pool::spawn(Arc::clone(&self.ctx), rx.clone());
        let sweeper = tokio::spawn(sweeper::run(Arc::clone(&self.ctx), rx));
        info!(
            workers = self.ctx.partitioner.workers(),
            classifier = self.ctx.classifier.is_some(),
            cache = self.ctx.cache.is_some(),
            "engine started"
        );
        EngineHandle { shutdown: tx, workers, sweeper }
    }
}

/// Running background tasks. Dropping it leaves them running; call
/// `shutdown` to stop them.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    workers:  Vec<JoinHandle<()>>,
    sweeper:  JoinHandle<()>,
}

impl EngineHandle {
    /// Receiver for other tasks that should stop with the engine.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop waiting for new work and wait for in-flight drains to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for w in self.workers {
            if let Err(e) = w.await {
                warn!("worker supervisor ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.sweeper.await {
            warn!("sweeper ended abnormally: {}", e);
        }
        info!("engine stopped");
    }
}
