// botsift/src/verdict.rs
//
// Verdict lookups for downstream services.
//
// A query is an address or a `host/address` composite, sent either as raw
// text or as JSON `{"ip": "..."}`. The answer is one of YES / NO / MISSING /
// BADIP. The TCP responder handles one query per connection and replies
// without a trailing newline.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{bounded, PredictionCache};

const MAX_QUERY: usize = 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Yes,
    No,
    Missing,
    BadIp,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes     => "YES",
            Self::No      => "NO",
            Self::Missing => "MISSING",
            Self::BadIp   => "BADIP",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct JsonQuery {
    ip: String,
}

/// Cache key for a query, or None when it does not name a valid address.
pub fn parse_query(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let text = if raw.starts_with('{') {
        serde_json::from_str::<JsonQuery>(raw).ok()?.ip
    } else {
        raw.to_string()
    };
    let text = text.trim();
    let address = text.rsplit('/').next().unwrap_or(text);
    address.parse::<IpAddr>().ok()?;
    Some(text.to_string())
}

/// Answer `query`. A cache that fails or stays silent past `limit` reads as
/// MISSING.
pub async fn lookup(cache: &dyn PredictionCache, query: &str, limit: Duration) -> Verdict {
    let Some(key) = parse_query(query) else {
        return Verdict::BadIp;
    };
    match bounded(limit, cache.get(&key)).await {
        Ok(Some(v)) if v < 0 => Verdict::No,
        Ok(Some(_))          => Verdict::Yes,
        Ok(None)             => Verdict::Missing,
        Err(e) => {
            warn!(key = %key, "verdict lookup failed: {}", e);
            Verdict::Missing
        }
    }
}

// ── TCP responder ─────────────────────────────────────────────────────────────

pub async fn serve(
    listener:     TcpListener,
    cache:        Arc<dyn PredictionCache>,
    limit:        Duration,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("verdict responder on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (sock, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("verdict accept failed: {}", e);
                        continue;
                    }
                };
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    if let Err(e) = answer(sock, cache.as_ref(), limit).await {
                        debug!(%peer, "verdict connection error: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn answer(
    mut sock: TcpStream,
    cache:    &dyn PredictionCache,
    limit:    Duration,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_QUERY];
    let mut filled = 0;
    // stop at newline, EOF or a full buffer
    while filled < MAX_QUERY {
        let n = match tokio::time::timeout(READ_TIMEOUT, sock.read(&mut buf[filled..])).await {
            Ok(r) => r?,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].contains(&b'\n') {
            break;
        }
    }
    let query = String::from_utf8_lossy(&buf[..filled]);
    let verdict = lookup(cache, &query, limit).await;
    sock.write_all(verdict.as_str().as_bytes()).await?;
    sock.shutdown().await
}
