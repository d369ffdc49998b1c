// botsift/src/main.rs
//
// botsift daemon.
//
// Tails a JSONL feed of ingestion records, buffers them, and runs the worker
// pool, liveness sweeper, verdict responder and stats logger until Ctrl+C.
//
// Usage:
//   botsift --config /etc/botsift.json --feed /var/log/botsift/events.jsonl
//   botsift --feed events.jsonl --from-start --workers 64

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use botsift::cache::{MemoryCache, PredictionCache, RedisCache};
use botsift::metrics::stats_loop;
use botsift::{verdict, Engine, EngineConfig, IngestRecord};

const BATCH_MAX: usize = 1_000;
const BATCH_LINGER: Duration = Duration::from_millis(50);
const RETRY_DELAY: Duration = Duration::from_millis(250);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "botsift",
    about   = "Per-client request timing statistics and bot classification",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "JSON engine config (defaults apply when omitted)")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "/tmp/botsift_feed.jsonl",
          help = "JSONL ingestion feed to tail")]
    feed: PathBuf,

    #[arg(long, help = "Ingest the feed's existing lines instead of seeking to the end")]
    from_start: bool,

    #[arg(long, help = "Override the configured worker count")]
    workers: Option<usize>,
}

// ── Event source ──────────────────────────────────────────────────────────────

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<IngestRecord>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening feed {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {}  // consume existing
    }

    info!("Tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim();
                if line.is_empty() { continue; }
                match IngestRecord::from_json(line) {
                    Ok(rec) => { if tx.send(rec).await.is_err() { break; } }
                    Err(e)  => warn!("Parse error: {}", e),
                }
            }
            None => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

/// Collect records into batches and hand them to the engine. A batch that
/// fails to buffer is retried until it lands.
async fn ingest_loop(engine: Arc<Engine>, mut rx: mpsc::Receiver<IngestRecord>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + BATCH_LINGER;
        while batch.len() < BATCH_MAX {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(rec)) => batch.push(rec),
                _ => break,
            }
        }

        loop {
            match engine.ingest(batch.clone()).await {
                Ok(report) => {
                    if report.malformed > 0 {
                        warn!(malformed = report.malformed, "records dropped");
                    }
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!(records = batch.len(), "buffer append failed, retrying: {}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(records = batch.len(), "buffer append failed, retrying: {}", e);
                    tokio::time::sleep(RETRY_DELAY * 4).await;
                }
            }
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("botsift=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(n) = cli.workers {
        config.workers = n;
    }
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let cache: Arc<dyn PredictionCache> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await
            .with_context(|| format!("connecting to {}", url))?),
        None => {
            warn!("no redis_url configured, verdicts stay in process memory");
            Arc::new(MemoryCache::new())
        }
    };

    let stats_interval = Duration::from_secs(config.stats_interval_secs.max(1));
    let verdict_listen = config.verdict_listen.clone();
    let cache_timeout = config.cache_timeout();

    let engine = Arc::new(Engine::open(config, Some(Arc::clone(&cache)))?);
    let handle = engine.start();

    tokio::spawn(stats_loop(
        Arc::clone(engine.metrics()),
        Arc::clone(engine.partitioner()),
        stats_interval,
        handle.subscribe(),
    ));

    if let Some(addr) = verdict_listen {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding verdict responder to {}", addr))?;
        let shutdown = handle.subscribe();
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            if let Err(e) = verdict::serve(listener, cache, cache_timeout, shutdown).await {
                error!("verdict responder stopped: {}", e);
            }
        });
    }

    let (tx, rx) = mpsc::channel::<IngestRecord>(16384);
    let feed = cli.feed.clone();
    let seek_end = !cli.from_start;
    tokio::spawn(async move {
        if let Err(e) = tail_jsonl(feed, tx, seek_end).await {
            error!("feed reader stopped: {:#}", e);
        }
    });
    let ingest = tokio::spawn(ingest_loop(Arc::clone(&engine), rx));

    info!("botsift running, Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    ingest.abort();
    handle.shutdown().await;
    Ok(())
}
